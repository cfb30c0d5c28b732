use anyhow::Result;
use gateway_session_client::core::{logging, Config, EventBus, HealthChecker};
use gateway_session_client::gateway::{DispatchEvent, GatewayEngine, GatewayMetrics, TungsteniteConnector};
use gateway_session_client::http::{ReqwestTransport, RequestDispatcher, RequestOptions, Route};
use gateway_session_client::SessionSupervisor;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
struct GatewayInfo {
    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::load("config/gateway")?;
    if config.gateway.token.is_empty() {
        config = Config::from_env()?;
    }

    logging::init_logging(&config.monitoring.log_level);

    tracing::info!("gateway session client starting");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let health_checker = HealthChecker::new();
    let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(config.http.timeout_secs))?);
    let dispatcher = RequestDispatcher::new(transport, config.http.clone());

    match dispatcher
        .request_json::<GatewayInfo>(&Route::get("/gateway"), RequestOptions::default())
        .await
    {
        Ok(info) => {
            health_checker.update_component("http", true).await;
            config.gateway.url = info.url;
        }
        Err(e) => {
            tracing::warn!("gateway discovery failed, using {}: {}", config.gateway.url, e);
            health_checker.update_component("http", false).await;
        }
    }

    let engine = GatewayEngine::new(
        config.gateway.clone(),
        Arc::new(TungsteniteConnector::default()),
        EventBus::default(),
    );

    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    engine.add_listener(Arc::new(dispatch_tx));
    tokio::spawn(log_dispatches(dispatch_rx));

    let metrics = engine.metrics();
    let health_clone = health_checker.clone();
    let health_port = config.monitoring.health_port;
    tokio::spawn(async move { start_health_server(health_clone, metrics, health_port).await });
    tracing::info!("Health endpoint running on port {}", health_port);

    let supervisor = Arc::new(SessionSupervisor::new(
        engine,
        config.supervisor.clone(),
        health_checker,
    ));

    let mut session = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start().await })
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("shutdown requested");
            supervisor.stop().await;
            session.await??;
        }
        outcome = &mut session => outcome??,
    }

    Ok(())
}

async fn log_dispatches(mut events: mpsc::UnboundedReceiver<DispatchEvent>) {
    while let Some(event) = events.recv().await {
        tracing::info!(sequence = ?event.sequence, "dispatch {}", event.name);
    }
}

async fn start_health_server(health_checker: HealthChecker, metrics: Arc<GatewayMetrics>, port: u16) {
    use warp::Filter;

    let health = warp::path("health")
        .and(warp::any().map(move || health_checker.clone()))
        .and_then(|checker: HealthChecker| async move {
            let status = checker.get_status().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&status))
        });

    let metrics = warp::path("metrics")
        .and(warp::any().map(move || metrics.clone()))
        .map(|metrics: Arc<GatewayMetrics>| warp::reply::json(&metrics.get_snapshot()));

    warp::serve(health.or(metrics)).run(([0, 0, 0, 0], port)).await;
}
