//! Gateway connection engine
//!
//! One engine owns one logical session over one websocket at a time. Three kinds of
//! work touch the socket:
//!
//! - the receive loop ([`GatewayEngine::run`]) reads frames,
//! - [`GatewayEngine::send`] writes frames (application payloads and heartbeats),
//! - [`GatewayEngine::reconnect`] tears the socket down and replaces it.
//!
//! The phase watch channel is the readiness signal: readers and writers wait on it
//! while a reconnect is in flight. The write half sits behind a mutex that the
//! reconnect holds across the whole swap, so a send either completes on the old
//! socket before it is closed or runs on the new one after the handshake. The
//! heartbeat task never reconnects by itself; it asks the receive loop to do it.

use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::close_codes::{CloseAction, NORMAL_CLOSURE, RESUME_CLOSE_CODE};
use super::dispatch::{DispatchEvent, DispatchListener, DispatchListeners};
use super::error::{GatewayError, Result};
use super::heartbeat::{HeartbeatState, HIGH_LATENCY};
use super::inflater::Inflater;
use super::metrics::GatewayMetrics;
use super::protocol::{
    ConnectionProperties, GatewayPayload, IdentifyPayload, OpCode, ResumePayload, READY_EVENT,
    RESUMED_EVENT,
};
use super::rate_limiter::{SendLimit, SendLimiter};
use super::session::{Session, ShardDescriptor};
use super::transport::{Connector, Frame, FrameSink, FrameStream};
use crate::core::config::GatewayConfig;
use crate::core::event_bus::{EventBus, LifecycleEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Ready,
    Reconnecting,
    Closing,
}

impl ConnectionPhase {
    pub fn is_open(self) -> bool {
        self == Self::Ready
    }

    /// Phases that end on their own, in Ready or Disconnected
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::AwaitingHello
                | Self::Identifying
                | Self::Resuming
                | Self::Reconnecting
        )
    }
}

/// Requests from the heartbeat task to the receive loop
#[derive(Debug)]
enum ControlSignal {
    Reconnect {
        generation: u64,
        reason: &'static str,
    },
}

enum Step {
    Inbound(Inbound),
    Control(ControlSignal),
    /// The phase left Ready underneath the loop
    Interrupted,
    Stop,
}

enum Inbound {
    Payload(GatewayPayload),
    Closed { code: Option<u16>, reason: String },
}

/// Read half plus the inflate context bound to it
struct FrameReader {
    stream: Box<dyn FrameStream>,
    inflater: Inflater,
}

impl FrameReader {
    fn new(stream: Box<dyn FrameStream>) -> Self {
        Self {
            stream,
            inflater: Inflater::new(),
        }
    }

    /// Next decoded payload. Partial compressed frames are buffered and malformed
    /// payloads are dropped without ending the stream. A corrupt compressed stream
    /// ends it, since the inflate context cannot recover.
    async fn next_inbound(&mut self, metrics: &GatewayMetrics) -> Inbound {
        loop {
            let frame = match self.stream.next_frame().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    return Inbound::Closed {
                        code: None,
                        reason: e.to_string(),
                    }
                }
                None => {
                    return Inbound::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    }
                }
            };
            metrics.increment_frames_received();

            let text = match frame {
                Frame::Text(text) => text,
                Frame::Binary(bytes) => match self.inflater.push(&bytes) {
                    Ok(Some(text)) => text,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("compressed stream corrupted, forcing a reconnect: {}", e);
                        metrics.increment_malformed();
                        return Inbound::Closed {
                            code: None,
                            reason: format!("compressed stream corrupted: {e}"),
                        };
                    }
                },
                Frame::Close { code, reason } => return Inbound::Closed { code, reason },
            };

            match GatewayPayload::from_json(&text) {
                Ok(payload) => return Inbound::Payload(payload),
                Err(e) => {
                    warn!("dropping malformed payload: {}", e);
                    metrics.increment_malformed();
                }
            }
        }
    }
}

struct HandshakeInfo {
    interval: Duration,
    hello_at: Instant,
    /// Dispatches received before the session was ready, delivered once it is
    backlog: Vec<GatewayPayload>,
}

/// Holds the connect/reconnect slot. Released on drop, so an abandoned attempt
/// cannot leave the engine stuck in a transitional phase.
struct AttemptGuard<'a> {
    engine: &'a GatewayEngine,
}

impl<'a> AttemptGuard<'a> {
    fn enter(engine: &'a GatewayEngine) -> Option<Self> {
        if engine.reconnecting.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self { engine })
        }
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.engine.phase().is_transitional() {
            self.engine.set_phase(ConnectionPhase::Disconnected);
        }
        self.engine.reconnecting.store(false, Ordering::Release);
    }
}

struct HeartbeatTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct GatewayEngine {
    config: GatewayConfig,
    shard: ShardDescriptor,
    connector: Arc<dyn Connector>,
    self_ref: Weak<GatewayEngine>,

    writer: Mutex<Option<Box<dyn FrameSink>>>,
    reader: Mutex<Option<FrameReader>>,
    phase: watch::Sender<ConnectionPhase>,
    reconnecting: AtomicBool,
    generation: AtomicU64,

    session: StdMutex<Session>,
    presence: StdMutex<Option<Value>>,
    heartbeat: StdMutex<Option<Arc<HeartbeatState>>>,
    heartbeat_task: StdMutex<Option<HeartbeatTask>>,
    control_tx: mpsc::UnboundedSender<ControlSignal>,
    control_rx: Mutex<mpsc::UnboundedReceiver<ControlSignal>>,
    stop: StdMutex<CancellationToken>,

    limiter: SendLimiter,
    listeners: DispatchListeners,
    events: EventBus,
    metrics: Arc<GatewayMetrics>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl GatewayEngine {
    pub fn new(config: GatewayConfig, connector: Arc<dyn Connector>, events: EventBus) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(ConnectionPhase::Disconnected);
        let limiter = SendLimiter::new(SendLimit::new(
            config.send_limit,
            Duration::from_secs(config.send_window_secs),
        ));
        let shard = ShardDescriptor::new(config.shard_index, config.shard_count);

        Arc::new_cyclic(|self_ref| Self {
            config,
            shard,
            connector,
            self_ref: self_ref.clone(),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            phase,
            reconnecting: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            session: StdMutex::new(Session::default()),
            presence: StdMutex::new(None),
            heartbeat: StdMutex::new(None),
            heartbeat_task: StdMutex::new(None),
            control_tx,
            control_rx: Mutex::new(control_rx),
            stop: StdMutex::new(CancellationToken::new()),
            limiter,
            listeners: DispatchListeners::new(),
            events,
            metrics: Arc::new(GatewayMetrics::new()),
        })
    }

    pub fn shard(&self) -> ShardDescriptor {
        self.shard
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.subscribe()
    }

    pub fn session(&self) -> Session {
        lock(&self.session).clone()
    }

    pub fn sequence(&self) -> Option<u64> {
        lock(&self.session).sequence
    }

    pub fn latency(&self) -> Option<Duration> {
        lock(&self.heartbeat).as_ref().and_then(|state| state.latency())
    }

    pub fn average_latency(&self) -> Option<Duration> {
        lock(&self.heartbeat)
            .as_ref()
            .and_then(|state| state.average_latency())
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        self.metrics.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn add_listener(&self, listener: Arc<dyn DispatchListener>) {
        self.listeners.add(listener);
    }

    /// Presence sent with the next Identify
    pub fn set_presence(&self, presence: Option<Value>) {
        *lock(&self.presence) = presence;
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(shard = %self.shard, "phase {:?} -> {:?}", previous, phase);
        }
    }

    fn stop_token(&self) -> CancellationToken {
        lock(&self.stop).clone()
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let mut phase_rx = self.phase.subscribe();
        let phase = *phase_rx
            .wait_for(|phase| !phase.is_transitional())
            .await
            .map_err(|_| GatewayError::NotConnected)?;
        if phase.is_open() {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    /// Open the transport and complete the handshake, resuming when a session is cached.
    pub async fn connect(&self) -> Result<()> {
        let Some(_guard) = AttemptGuard::enter(self) else {
            return Err(GatewayError::Transport(
                "a connection attempt is already in progress".to_string(),
            ));
        };
        if self.phase().is_open() {
            return Ok(());
        }

        {
            let mut stop = lock(&self.stop);
            if stop.is_cancelled() {
                *stop = CancellationToken::new();
            }
        }

        let resume = lock(&self.session).is_resumable();
        self.set_phase(ConnectionPhase::Connecting);
        self.replace_transport(resume, None, None).await
    }

    /// Drop the current socket and handshake on a new one. A second caller while one
    /// reconnect is running waits for it instead of starting another.
    pub async fn reconnect(&self, resume: bool, close_code: Option<u16>, url: Option<String>) -> Result<()> {
        if self.stop_token().is_cancelled() {
            return Err(GatewayError::NotConnected);
        }
        let Some(_guard) = AttemptGuard::enter(self) else {
            debug!(shard = %self.shard, "reconnect already in progress, waiting on it");
            return self.wait_until_ready().await;
        };

        info!(shard = %self.shard, resume, "reconnecting");
        self.metrics.increment_reconnects();
        self.events.publish(LifecycleEvent::Reconnecting {
            resume,
            reason: close_code.map_or_else(|| "requested".to_string(), |code| format!("close code {code}")),
        });
        self.set_phase(ConnectionPhase::Reconnecting);

        let result = self.replace_transport(resume, close_code, url).await;
        if let Err(e) = &result {
            error!(shard = %self.shard, "reconnect failed: {}", e);
            self.events
                .publish(LifecycleEvent::disconnected(None, e.to_string()));
        }
        result
    }

    async fn replace_transport(&self, resume: bool, close_code: Option<u16>, url: Option<String>) -> Result<()> {
        self.stop_heartbeat().await;

        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;

        if let Some(mut old) = writer.take() {
            let code = close_code.unwrap_or(if resume { RESUME_CLOSE_CODE } else { NORMAL_CLOSURE });
            if let Err(e) = old.close(code).await {
                debug!("closing previous socket failed: {}", e);
            }
        }
        reader.take();
        if !resume {
            lock(&self.session).invalidate();
        }

        let (mut sink, new_reader, info) = match self.establish(resume, url).await {
            Ok(parts) => parts,
            Err(e) => {
                self.set_phase(ConnectionPhase::Disconnected);
                return Err(e);
            }
        };

        let stop = self.stop_token();
        if stop.is_cancelled() {
            let _ = sink.close(NORMAL_CLOSURE).await;
            self.set_phase(ConnectionPhase::Disconnected);
            return Err(GatewayError::NotConnected);
        }

        *writer = Some(sink);
        *reader = Some(new_reader);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.start_heartbeat(info.interval, info.hello_at, generation, &stop);
        self.set_phase(ConnectionPhase::Ready);
        drop(reader);
        drop(writer);

        for payload in info.backlog {
            self.process_dispatch(payload).await;
        }
        Ok(())
    }

    /// Connect and handshake, retrying inside the attempt when the remote invalidates
    /// the session mid-handshake.
    async fn establish(
        &self,
        mut resume: bool,
        url: Option<String>,
    ) -> Result<(Box<dyn FrameSink>, FrameReader, HandshakeInfo)> {
        let mut invalidations = 0;

        loop {
            self.set_phase(ConnectionPhase::Connecting);
            let base = url
                .clone()
                .or_else(|| {
                    if resume {
                        lock(&self.session).resume_url.clone()
                    } else {
                        None
                    }
                })
                .unwrap_or_else(|| self.config.url.clone());
            let target = self.config.connect_url(&base);

            info!(shard = %self.shard, resume, "connecting to {}", target);
            let (mut sink, stream) = self.connector.connect(&target).await?;
            let mut reader = FrameReader::new(stream);

            match self.handshake(sink.as_mut(), &mut reader, resume).await {
                Ok(info) => return Ok((sink, reader, info)),
                Err(GatewayError::InvalidSession { resumable })
                    if invalidations < self.config.max_invalid_session_retries =>
                {
                    invalidations += 1;
                    let _ = sink
                        .close(if resumable { RESUME_CLOSE_CODE } else { NORMAL_CLOSURE })
                        .await;
                    if !resumable {
                        lock(&self.session).invalidate();
                    }
                    resume = resumable;
                    let delay = Duration::from_millis(rand::thread_rng().gen_range(1000..=5000));
                    warn!(shard = %self.shard, "session invalidated during handshake, retrying in {:?}", delay);
                    time::sleep(delay).await;
                }
                Err(e) => {
                    let _ = sink.close(NORMAL_CLOSURE).await;
                    if matches!(e, GatewayError::Handshake(_)) {
                        lock(&self.session).invalidate();
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn handshake(&self, sink: &mut dyn FrameSink, reader: &mut FrameReader, resume: bool) -> Result<HandshakeInfo> {
        self.set_phase(ConnectionPhase::AwaitingHello);
        let timeout = self.config.handshake_timeout();

        let hello = match time::timeout(timeout, reader.next_inbound(&self.metrics)).await {
            Err(_) => return Err(GatewayError::Handshake("no hello received".to_string())),
            Ok(Inbound::Closed { code, reason }) => return Err(Self::closed_during_handshake(code, reason)),
            Ok(Inbound::Payload(payload)) => payload,
        };
        let interval = match hello.as_hello() {
            Some(hello) if hello.heartbeat_interval > 0 => Duration::from_millis(hello.heartbeat_interval),
            _ => return Err(GatewayError::Handshake(format!("expected hello, got {hello}"))),
        };
        let hello_at = Instant::now();
        debug!(shard = %self.shard, "hello received, heartbeat interval {:?}", interval);

        let resume_payload = if resume { self.resume_payload() } else { None };
        let payload = match resume_payload {
            Some(resume_payload) => {
                self.set_phase(ConnectionPhase::Resuming);
                info!(shard = %self.shard, session_id = %resume_payload.session_id, "resuming session");
                GatewayPayload::resume(&resume_payload)?
            }
            None => {
                self.set_phase(ConnectionPhase::Identifying);
                lock(&self.session).invalidate();
                info!(shard = %self.shard, "identifying");
                GatewayPayload::identify(&self.identify_payload())?
            }
        };
        sink.send(Frame::Text(payload.to_json()?)).await?;
        self.metrics.increment_payloads_sent();

        let deadline = hello_at + timeout;
        let mut backlog = Vec::new();
        loop {
            let inbound = time::timeout_at(deadline, reader.next_inbound(&self.metrics))
                .await
                .map_err(|_| GatewayError::Timeout("READY"))?;
            let payload = match inbound {
                Inbound::Payload(payload) => payload,
                Inbound::Closed { code, reason } => return Err(Self::closed_during_handshake(code, reason)),
            };
            lock(&self.session).observe(payload.s);

            match payload.op {
                OpCode::Dispatch => {
                    let done = matches!(payload.t.as_deref(), Some(READY_EVENT) | Some(RESUMED_EVENT));
                    backlog.push(payload);
                    if done {
                        return Ok(HandshakeInfo {
                            interval,
                            hello_at,
                            backlog,
                        });
                    }
                }
                OpCode::InvalidSession => {
                    return Err(GatewayError::InvalidSession {
                        resumable: payload.invalid_session_resumable(),
                    })
                }
                OpCode::Heartbeat => {
                    let beat = GatewayPayload::heartbeat(self.sequence());
                    sink.send(Frame::Text(beat.to_json()?)).await?;
                }
                OpCode::Reconnect => {
                    return Err(GatewayError::Transport(
                        "reconnect requested during handshake".to_string(),
                    ))
                }
                other => debug!("ignoring {} during handshake", other),
            }
        }
    }

    fn closed_during_handshake(code: Option<u16>, reason: String) -> GatewayError {
        match CloseAction::classify(code) {
            CloseAction::Fatal => GatewayError::SessionClosed {
                code: code.unwrap_or_default(),
                reason,
            },
            CloseAction::Reidentify => GatewayError::InvalidSession { resumable: false },
            CloseAction::Resume => {
                GatewayError::Transport(format!("closed during handshake ({code:?}): {reason}"))
            }
        }
    }

    fn identify_payload(&self) -> IdentifyPayload {
        IdentifyPayload {
            token: self.config.token.clone(),
            intents: self.config.intents,
            shard: self.shard.as_array(),
            properties: ConnectionProperties::default(),
            presence: lock(&self.presence).clone(),
            compress: false,
            large_threshold: self.config.large_threshold,
        }
    }

    fn resume_payload(&self) -> Option<ResumePayload> {
        let session = lock(&self.session);
        Some(ResumePayload {
            token: self.config.token.clone(),
            session_id: session.session_id.clone()?,
            seq: session.sequence,
        })
    }

    fn start_heartbeat(&self, interval: Duration, hello_at: Instant, generation: u64, stop: &CancellationToken) {
        let state = Arc::new(HeartbeatState::new(interval));
        *lock(&self.heartbeat) = Some(state.clone());

        let token = stop.child_token();
        let first_delay = state.initial_jitter().saturating_sub(hello_at.elapsed());
        let handle = tokio::spawn(heartbeat_loop(
            self.self_ref.clone(),
            state,
            token.clone(),
            first_delay,
            generation,
            self.control_tx.clone(),
        ));
        *lock(&self.heartbeat_task) = Some(HeartbeatTask { token, handle });
    }

    /// Stop the heartbeat task and wait for it, so it can never write to a socket
    /// that is about to close.
    async fn stop_heartbeat(&self) {
        let task = lock(&self.heartbeat_task).take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                if e.is_panic() {
                    error!("heartbeat task panicked");
                }
            }
        }
    }

    /// Serialize and write one payload. Heartbeats bypass the outbound limiter.
    pub async fn send(&self, payload: &GatewayPayload, bypass_rate_limit: bool) -> Result<()> {
        let text = payload.to_json()?;
        let _permit = if bypass_rate_limit {
            None
        } else {
            Some(self.limiter.acquire().await)
        };

        self.wait_until_ready().await?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(GatewayError::NotConnected)?;
        sink.send(Frame::Text(text)).await?;
        self.metrics.increment_payloads_sent();
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<()> {
        self.send(&GatewayPayload::heartbeat(self.sequence()), true).await?;
        self.metrics.increment_heartbeats_sent();
        Ok(())
    }

    /// Receive loop. Returns `Ok` once stopped, or the error that ended the session.
    pub async fn run(&self) -> Result<()> {
        let mut control = self.control_rx.try_lock().map_err(|_| {
            GatewayError::Transport("receive loop is already running".to_string())
        })?;
        let stop = self.stop_token();

        loop {
            if stop.is_cancelled() {
                return Ok(());
            }

            let mut phase_rx = self.phase.subscribe();
            let phase = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                phase = phase_rx.wait_for(|phase| !phase.is_transitional()) => {
                    *phase.map_err(|_| GatewayError::NotConnected)?
                }
            };
            if !phase.is_open() {
                return Err(GatewayError::NotConnected);
            }

            let step = {
                let mut guard = self.reader.lock().await;
                // a failed reconnect leaves the slot empty
                let Some(reader) = guard.as_mut() else {
                    return Err(GatewayError::NotConnected);
                };
                tokio::select! {
                    biased;
                    inbound = reader.next_inbound(&self.metrics) => Step::Inbound(inbound),
                    Some(signal) = control.recv() => Step::Control(signal),
                    _ = phase_rx.wait_for(|phase| !phase.is_open()) => Step::Interrupted,
                    _ = stop.cancelled() => Step::Stop,
                }
            };

            match step {
                Step::Inbound(Inbound::Payload(payload)) => self.handle_payload(payload).await?,
                Step::Inbound(Inbound::Closed { code, reason }) => {
                    if stop.is_cancelled() {
                        return Ok(());
                    }
                    self.handle_close(code, reason).await?;
                }
                Step::Control(signal) => self.handle_control(signal).await?,
                Step::Interrupted => {}
                Step::Stop => return Ok(()),
            }
        }
    }

    async fn handle_control(&self, signal: ControlSignal) -> Result<()> {
        match signal {
            ControlSignal::Reconnect { generation, reason } => {
                if generation != self.generation.load(Ordering::Acquire) {
                    debug!("ignoring reconnect request from a previous connection");
                    return Ok(());
                }
                warn!(shard = %self.shard, "{}, reconnecting", reason);
                self.reconnect(true, Some(RESUME_CLOSE_CODE), None).await
            }
        }
    }

    async fn handle_close(&self, code: Option<u16>, reason: String) -> Result<()> {
        match CloseAction::classify(code) {
            CloseAction::Resume => {
                info!(shard = %self.shard, "connection closed ({:?}: {}), resuming", code, reason);
                self.reconnect(true, None, None).await
            }
            CloseAction::Reidentify => {
                info!(shard = %self.shard, "connection closed ({:?}: {}), re-identifying", code, reason);
                self.reconnect(false, None, None).await
            }
            CloseAction::Fatal => {
                let code = code.unwrap_or_default();
                error!(shard = %self.shard, "connection closed with fatal code {}: {}", code, reason);
                self.stop_heartbeat().await;
                self.writer.lock().await.take();
                self.reader.lock().await.take();
                self.set_phase(ConnectionPhase::Disconnected);
                self.events
                    .publish(LifecycleEvent::disconnected(Some(code), reason.clone()));
                Err(GatewayError::SessionClosed { code, reason })
            }
        }
    }

    async fn handle_payload(&self, payload: GatewayPayload) -> Result<()> {
        lock(&self.session).observe(payload.s);

        match payload.op {
            OpCode::Dispatch => self.process_dispatch(payload).await,
            OpCode::Heartbeat => {
                debug!("heartbeat requested by remote");
                if let Err(e) = self.send_heartbeat().await {
                    warn!("requested heartbeat not sent: {}", e);
                }
            }
            OpCode::HeartbeatAck => self.handle_heartbeat_ack(),
            OpCode::Reconnect => {
                info!(shard = %self.shard, "remote requested reconnect");
                self.reconnect(true, Some(RESUME_CLOSE_CODE), None).await?;
            }
            OpCode::InvalidSession => {
                let resumable = payload.invalid_session_resumable();
                info!(shard = %self.shard, resumable, "session invalidated");
                let code = if resumable { RESUME_CLOSE_CODE } else { NORMAL_CLOSURE };
                self.reconnect(resumable, Some(code), None).await?;
            }
            OpCode::Unknown(code) => debug!("unknown opcode {}, ignoring", code),
            other => debug!("unexpected {} from remote, ignoring", other),
        }
        Ok(())
    }

    fn handle_heartbeat_ack(&self) {
        let state = lock(&self.heartbeat).clone();
        let Some(state) = state else {
            return;
        };
        let latency = state.acknowledge(Instant::now());
        self.metrics.record_heartbeat_ack(latency);

        if let Some(latency) = latency {
            debug!(shard = %self.shard, "heartbeat acknowledged in {:?}", latency);
            if latency >= HIGH_LATENCY {
                warn!(shard = %self.shard, "high gateway latency: {:?}", latency);
                self.events.publish(LifecycleEvent::HighLatency {
                    latency_ms: latency.as_millis() as u64,
                });
            }
        }
    }

    async fn process_dispatch(&self, payload: GatewayPayload) {
        self.metrics.increment_dispatches();

        match payload.t.as_deref() {
            Some(READY_EVENT) => {
                if let Some(ready) = payload.as_ready() {
                    info!(shard = %self.shard, session_id = %ready.session_id, "session ready");
                    lock(&self.session).establish(ready.session_id.clone(), ready.resume_gateway_url);
                    self.events.publish(LifecycleEvent::Connected {
                        session_id: ready.session_id,
                        shard: self.shard.as_array(),
                        timestamp: chrono::Utc::now(),
                    });
                } else {
                    warn!("READY without a session id");
                }
            }
            Some(RESUMED_EVENT) => {
                let session = self.session();
                info!(shard = %self.shard, "session resumed");
                self.events.publish(LifecycleEvent::Resumed {
                    session_id: session.session_id.unwrap_or_default(),
                    sequence: session.sequence,
                    timestamp: chrono::Utc::now(),
                });
            }
            _ => {}
        }

        let event = DispatchEvent {
            name: payload.t.unwrap_or_default(),
            sequence: payload.s,
            data: payload.d.unwrap_or(Value::Null),
        };
        self.listeners.dispatch(&event).await;
    }

    /// Stop the receive loop and heartbeat and close the socket. Safe to call twice.
    pub async fn close(&self) {
        {
            let stop = lock(&self.stop);
            if stop.is_cancelled() {
                return;
            }
            stop.cancel();
        }

        info!(shard = %self.shard, "closing gateway connection");
        self.set_phase(ConnectionPhase::Closing);
        self.stop_heartbeat().await;

        if let Some(mut sink) = self.writer.lock().await.take() {
            if let Err(e) = sink.close(NORMAL_CLOSURE).await {
                debug!("close frame not delivered: {}", e);
            }
        }
        self.reader.lock().await.take();
        self.set_phase(ConnectionPhase::Disconnected);
        self.events
            .publish(LifecycleEvent::disconnected(Some(NORMAL_CLOSURE), "closed by client"));
    }
}

async fn heartbeat_loop(
    engine: Weak<GatewayEngine>,
    state: Arc<HeartbeatState>,
    token: CancellationToken,
    first_delay: Duration,
    generation: u64,
    control: mpsc::UnboundedSender<ControlSignal>,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = time::sleep(first_delay) => {}
    }

    loop {
        if !state.is_acknowledged() {
            warn!("heartbeat not acknowledged, connection presumed zombied");
            let _ = control.send(ControlSignal::Reconnect {
                generation,
                reason: "heartbeat not acknowledged",
            });
            return;
        }

        let Some(engine) = engine.upgrade() else {
            return;
        };
        state.mark_sent(Instant::now());
        let sent = tokio::select! {
            _ = token.cancelled() => return,
            sent = engine.send_heartbeat() => sent,
        };
        drop(engine);

        if let Err(e) = sent {
            warn!("heartbeat could not be sent: {}", e);
            let _ = control.send(ControlSignal::Reconnect {
                generation,
                reason: "heartbeat send failed",
            });
            return;
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = time::sleep(state.interval()) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_classification() {
        assert!(ConnectionPhase::Ready.is_open());
        assert!(!ConnectionPhase::Ready.is_transitional());
        assert!(ConnectionPhase::Reconnecting.is_transitional());
        assert!(ConnectionPhase::Resuming.is_transitional());
        assert!(!ConnectionPhase::Disconnected.is_transitional());
        assert!(!ConnectionPhase::Closing.is_transitional());
    }

    #[test]
    fn test_close_during_handshake_mapping() {
        assert!(matches!(
            GatewayEngine::closed_during_handshake(Some(4004), "bad token".into()),
            GatewayError::SessionClosed { code: 4004, .. }
        ));
        assert!(matches!(
            GatewayEngine::closed_during_handshake(Some(4007), String::new()),
            GatewayError::InvalidSession { resumable: false }
        ));
        assert!(matches!(
            GatewayEngine::closed_during_handshake(None, String::new()),
            GatewayError::Transport(_)
        ));
    }
}
