use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::SupervisorConfig;
use crate::core::event_bus::LifecycleEvent;
use crate::core::health::HealthChecker;
use crate::gateway::close_codes::CloseCode;
use crate::gateway::{GatewayEngine, GatewayError};

/// Terminal outcomes of a supervised session, worded for whoever has to fix them.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("authentication failed: the token was rejected")]
    AuthenticationFailed,

    #[error("invalid shard: the shard index or count was rejected")]
    InvalidShard,

    #[error("sharding required: this identity has too many guilds for one connection")]
    ShardingRequired,

    #[error("invalid gateway API version")]
    InvalidApiVersion,

    #[error("invalid intents: the intents value was rejected")]
    InvalidIntents,

    #[error("privileged intents requested that are not enabled for this application")]
    PrivilegedIntentsRequired,

    #[error("gateway closed the connection with code {code}: {reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("gave up after {attempts} failed connection attempts: {source}")]
    ReconnectsExhausted {
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    #[error("supervisor is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl SupervisorError {
    /// Turn a fatal close into an actionable error
    pub fn from_gateway(err: GatewayError) -> Self {
        let GatewayError::SessionClosed { code, reason } = err else {
            return Self::Gateway(err);
        };
        match CloseCode::from_u16(code) {
            Some(CloseCode::AuthenticationFailed) => Self::AuthenticationFailed,
            Some(CloseCode::InvalidShard) => Self::InvalidShard,
            Some(CloseCode::ShardingRequired) => Self::ShardingRequired,
            Some(CloseCode::InvalidApiVersion) => Self::InvalidApiVersion,
            Some(CloseCode::InvalidIntents) => Self::InvalidIntents,
            Some(CloseCode::DisallowedIntents) => Self::PrivilegedIntentsRequired,
            _ => Self::ConnectionClosed { code, reason },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Running,
}

/// Owns one engine's lifecycle: connects it, keeps it running across transient
/// failures and reports terminal ones.
pub struct SessionSupervisor {
    engine: Arc<GatewayEngine>,
    config: SupervisorConfig,
    health: HealthChecker,
    ready: Arc<AtomicBool>,
    state: watch::Sender<SupervisorState>,
    stop: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new(engine: Arc<GatewayEngine>, config: SupervisorConfig, health: HealthChecker) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            engine,
            config,
            health,
            ready: Arc::new(AtomicBool::new(false)),
            state,
            stop: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn engine(&self) -> &Arc<GatewayEngine> {
        &self.engine
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Set on READY or RESUMED, cleared on every disconnect
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn stop_token(&self) -> CancellationToken {
        self.stop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Run the session until [`stop`](Self::stop) is called (`Ok`) or it fails for good.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let entered = self.state.send_if_modified(|state| {
            if *state == SupervisorState::Running {
                false
            } else {
                *state = SupervisorState::Running;
                true
            }
        });
        if !entered {
            return Err(SupervisorError::AlreadyRunning);
        }

        let stop = {
            let mut stop = self.stop.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if stop.is_cancelled() {
                *stop = CancellationToken::new();
            }
            stop.clone()
        };

        let watcher = tokio::spawn(watch_lifecycle(
            self.engine.events().subscribe(),
            self.ready.clone(),
            self.health.clone(),
        ));

        info!(shard = %self.engine.shard(), "session supervisor started");
        let result = self.supervise(&stop).await;
        if let Err(e) = &result {
            error!(shard = %self.engine.shard(), "session ended: {}", e);
        }

        self.engine.close().await;
        watcher.abort();
        self.ready.store(false, Ordering::Release);
        self.health.update_component("gateway", false).await;
        self.state.send_replace(SupervisorState::Idle);
        info!(shard = %self.engine.shard(), "session supervisor stopped");
        result
    }

    async fn supervise(&self, stop: &CancellationToken) -> Result<(), SupervisorError> {
        let mut failures: u32 = 0;

        loop {
            if stop.is_cancelled() {
                return Ok(());
            }

            let outcome = match self.engine.connect().await {
                Ok(()) => {
                    failures = 0;
                    if stop.is_cancelled() {
                        return Ok(());
                    }
                    tokio::select! {
                        _ = stop.cancelled() => return Ok(()),
                        result = self.engine.run() => result,
                    }
                }
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => e,
                Err(e @ GatewayError::SessionClosed { .. }) => return Err(SupervisorError::from_gateway(e)),
                Err(e) => {
                    error!(shard = %self.engine.shard(), "session stopped: {}", e);
                    self.engine
                        .events()
                        .publish(LifecycleEvent::disconnected(None, e.to_string()));
                    return Ok(());
                }
            };

            if stop.is_cancelled() {
                return Ok(());
            }
            self.ready.store(false, Ordering::Release);
            self.engine
                .events()
                .publish(LifecycleEvent::disconnected(None, err.to_string()));

            failures += 1;
            if failures > self.config.max_reconnect_attempts {
                return Err(SupervisorError::ReconnectsExhausted {
                    attempts: failures - 1,
                    source: err,
                });
            }

            let delay = self.backoff(failures);
            warn!(
                shard = %self.engine.shard(),
                "connection lost ({}), retrying in {:?} (attempt {}/{})",
                err,
                delay,
                failures,
                self.config.max_reconnect_attempts
            );
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = time::sleep(delay) => {}
            }
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let base = self.config.reconnect_delay_ms;
        let delay = base.saturating_mul(2_u64.pow(failures.min(5)));
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(delay + jitter)
    }

    /// Ask a running session to stop. Safe to call when idle.
    pub async fn stop(&self) {
        self.stop_token().cancel();
        self.engine.close().await;
    }

    pub async fn wait_idle(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state == SupervisorState::Idle).await;
    }
}

async fn watch_lifecycle(
    mut events: broadcast::Receiver<LifecycleEvent>,
    ready: Arc<AtomicBool>,
    health: HealthChecker,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("lifecycle watcher skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        match event {
            LifecycleEvent::Connected { .. } | LifecycleEvent::Resumed { .. } => {
                ready.store(true, Ordering::Release);
                health.update_component("gateway", true).await;
            }
            LifecycleEvent::Disconnected { .. } | LifecycleEvent::Reconnecting { .. } => {
                ready.store(false, Ordering::Release);
                health.update_component("gateway", false).await;
            }
            LifecycleEvent::HighLatency { .. } => {}
        }
    }
}
