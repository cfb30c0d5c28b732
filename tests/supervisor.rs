mod common;

use common::{gateway_config, mock_gateway};
use gateway_session_client::core::config::SupervisorConfig;
use gateway_session_client::core::{EventBus, HealthChecker, LifecycleEvent};
use gateway_session_client::gateway::{GatewayEngine, GatewayError};
use gateway_session_client::supervisor::SupervisorState;
use gateway_session_client::{SessionSupervisor, SupervisorError};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn supervisor_config(max_reconnect_attempts: u32) -> SupervisorConfig {
    SupervisorConfig {
        max_reconnect_attempts,
        reconnect_delay_ms: 100,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test(start_paused = true)]
async fn test_retries_refused_connection_then_stops_cleanly() {
    let (connector, mut gateway) = mock_gateway();
    connector.refuse(1);
    let engine = GatewayEngine::new(gateway_config(), connector, EventBus::default());
    let health = HealthChecker::new();
    let supervisor = Arc::new(SessionSupervisor::new(engine, supervisor_config(3), health.clone()));

    let session = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start().await })
    };

    let mut conn = gateway.accept().await;
    conn.complete_handshake("supervised", 1).await;
    wait_until(|| supervisor.is_ready()).await;
    assert_eq!(supervisor.state(), SupervisorState::Running);
    assert_eq!(health.component("gateway").await, Some(true));

    assert!(matches!(supervisor.start().await, Err(SupervisorError::AlreadyRunning)));

    supervisor.stop().await;
    assert_ok!(session.await.unwrap());
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert!(!supervisor.is_ready());
    assert_eq!(conn.expect_close().await, 1000);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_close_is_not_retried() {
    let (connector, mut gateway) = mock_gateway();
    let engine = GatewayEngine::new(gateway_config(), connector, EventBus::default());
    let supervisor = Arc::new(SessionSupervisor::new(engine, supervisor_config(5), HealthChecker::new()));

    let session = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start().await })
    };

    let mut conn = gateway.accept().await;
    conn.complete_handshake("doomed", 1).await;
    wait_until(|| supervisor.is_ready()).await;
    conn.close(4011);

    let result = session.await.unwrap();
    assert!(matches!(result, Err(SupervisorError::ShardingRequired)));
    assert_eq!(supervisor.state(), SupervisorState::Idle);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(gateway.try_accept().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_token_fails_during_handshake() {
    let (connector, mut gateway) = mock_gateway();
    let engine = GatewayEngine::new(gateway_config(), connector, EventBus::default());
    let supervisor = SessionSupervisor::new(engine, supervisor_config(5), HealthChecker::new());

    let server = tokio::spawn(async move {
        let mut conn = gateway.accept().await;
        conn.hello(common::HEARTBEAT_INTERVAL_MS);
        conn.expect_payload().await;
        conn.close(4004);
        gateway
    });

    let result = supervisor.start().await;
    assert!(matches!(result, Err(SupervisorError::AuthenticationFailed)));
    let mut gateway = server.await.unwrap();
    assert!(gateway.try_accept().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let (connector, mut gateway) = mock_gateway();
    connector.refuse(10);
    let engine = GatewayEngine::new(gateway_config(), connector, EventBus::default());
    let supervisor = SessionSupervisor::new(engine, supervisor_config(2), HealthChecker::new());

    let result = supervisor.start().await;
    match result {
        Err(SupervisorError::ReconnectsExhausted { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected the supervisor to give up, got {other:?}"),
    }
    assert!(gateway.try_accept().is_none());
    assert_eq!(supervisor.state(), SupervisorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_can_restart_after_stop() {
    let (connector, mut gateway) = mock_gateway();
    let engine = GatewayEngine::new(gateway_config(), connector, EventBus::default());
    let supervisor = Arc::new(SessionSupervisor::new(engine, supervisor_config(3), HealthChecker::new()));

    for round in 0..2 {
        let session = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.start().await })
        };
        let mut conn = gateway.accept().await;
        let handshake = conn.complete_handshake(&format!("round-{round}"), 1).await;
        if round == 1 {
            // the session cached by the first round is resumed
            assert_eq!(handshake.op.as_u8(), 6);
        }
        wait_until(|| supervisor.is_ready()).await;

        supervisor.stop().await;
        assert_ok!(session.await.unwrap());
        supervisor.wait_idle().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_stream_ends_session_quietly() {
    let (connector, mut gateway) = mock_gateway();
    connector.fail_with(GatewayError::Decode("corrupt deflate block".into()));
    let events = EventBus::default();
    let mut lifecycle = events.subscribe();
    let engine = GatewayEngine::new(gateway_config(), connector, events);
    let supervisor = SessionSupervisor::new(engine, supervisor_config(3), HealthChecker::new());

    assert_ok!(supervisor.start().await);
    assert_eq!(supervisor.state(), SupervisorState::Idle);
    assert!(gateway.try_accept().is_none());

    match lifecycle.recv().await.unwrap() {
        LifecycleEvent::Disconnected { code, reason, .. } => {
            assert_eq!(code, None);
            assert!(reason.contains("corrupt deflate block"));
        }
        other => panic!("expected a disconnect notification, got {other:?}"),
    }
}
