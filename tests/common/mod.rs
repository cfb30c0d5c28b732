#![allow(dead_code)]

use async_trait::async_trait;
use gateway_session_client::core::config::GatewayConfig;
use gateway_session_client::gateway::error::{GatewayError, Result};
use gateway_session_client::gateway::{Connector, Frame, FrameSink, FrameStream, GatewayPayload};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const HEARTBEAT_INTERVAL_MS: u64 = 41_250;

pub fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        url: "wss://gateway.test".into(),
        token: "test-token".into(),
        compress: false,
        ..Default::default()
    }
}

/// What the client wrote, as the server sees it
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Payload(GatewayPayload),
    Close(u16),
}

/// In-memory websocket factory. Every `connect` hands the server half to the test.
pub struct MockConnector {
    connections: mpsc::UnboundedSender<ServerConnection>,
    closed_writes: Arc<AtomicUsize>,
    refusals: AtomicUsize,
    failure: Mutex<Option<GatewayError>>,
}

impl MockConnector {
    /// Refuse the next `count` connection attempts
    pub fn refuse(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Fail the next connection attempt with `err`
    pub fn fail_with(&self, err: GatewayError) {
        *self.failure.lock().unwrap() = Some(err);
    }
}

pub struct MockGateway {
    connections: mpsc::UnboundedReceiver<ServerConnection>,
    closed_writes: Arc<AtomicUsize>,
}

pub fn mock_gateway() -> (Arc<MockConnector>, MockGateway) {
    let (tx, rx) = mpsc::unbounded_channel();
    let closed_writes = Arc::new(AtomicUsize::new(0));
    (
        Arc::new(MockConnector {
            connections: tx,
            closed_writes: closed_writes.clone(),
            refusals: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }),
        MockGateway {
            connections: rx,
            closed_writes,
        },
    )
}

impl MockGateway {
    pub async fn accept(&mut self) -> ServerConnection {
        tokio::time::timeout(Duration::from_secs(120), self.connections.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped")
    }

    /// Next connection attempt, or `None` once the connector is gone
    pub async fn next(&mut self) -> Option<ServerConnection> {
        self.connections.recv().await
    }

    pub fn try_accept(&mut self) -> Option<ServerConnection> {
        self.connections.try_recv().ok()
    }

    /// Writes attempted on a socket after it was closed
    pub fn closed_writes(&self) -> usize {
        self.closed_writes.load(Ordering::SeqCst)
    }

    pub fn closed_writes_counter(&self) -> Arc<AtomicUsize> {
        self.closed_writes.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(GatewayError::Transport(format!("connection to {url} refused")));
        }
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let server = ServerConnection {
            url: url.to_string(),
            to_client,
            from_client,
            closed: closed.clone(),
        };
        self.connections
            .send(server)
            .map_err(|_| GatewayError::Transport("gateway gone".into()))?;

        Ok((
            Box::new(ChannelSink {
                tx: client_tx,
                closed,
                closed_writes: self.closed_writes.clone(),
            }),
            Box::new(ChannelStream { rx: client_rx }),
        ))
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<ClientFrame>,
    closed: Arc<AtomicBool>,
    closed_writes: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            self.closed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(GatewayError::Transport("write to closed socket".into()));
        }
        let Frame::Text(text) = frame else {
            return Ok(());
        };
        let payload = GatewayPayload::from_json(&text)?;
        // the server half may already be gone; the socket itself is still open
        let _ = self.tx.send(ClientFrame::Payload(payload));
        Ok(())
    }

    async fn close(&mut self, code: u16) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(ClientFrame::Close(code));
        }
        Ok(())
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameStream for ChannelStream {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Server side of one in-memory connection
pub struct ServerConnection {
    pub url: String,
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
    closed: Arc<AtomicBool>,
}

impl ServerConnection {
    pub fn send(&self, payload: Value) {
        let _ = self.to_client.send(Frame::Text(payload.to_string()));
    }

    pub fn send_frame(&self, frame: Frame) {
        let _ = self.to_client.send(frame);
    }

    pub fn hello(&self, interval_ms: u64) {
        self.send(json!({"op": 10, "d": {"heartbeat_interval": interval_ms}}));
    }

    pub fn ready(&self, session_id: &str, sequence: u64) {
        self.send(json!({
            "op": 0,
            "t": "READY",
            "s": sequence,
            "d": {"session_id": session_id, "resume_gateway_url": "wss://resume.test"}
        }));
    }

    pub fn resumed(&self, sequence: u64) {
        self.send(json!({"op": 0, "t": "RESUMED", "s": sequence, "d": null}));
    }

    pub fn dispatch(&self, name: &str, sequence: Option<u64>, data: Value) {
        self.send(json!({"op": 0, "t": name, "s": sequence, "d": data}));
    }

    pub fn ack(&self) {
        self.send(json!({"op": 11}));
    }

    pub fn close(&self, code: u16) {
        self.send_frame(Frame::Close {
            code: Some(code),
            reason: format!("closed with {code}"),
        });
    }

    pub fn is_closed_by_client(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn recv(&mut self) -> Option<ClientFrame> {
        tokio::time::timeout(Duration::from_secs(300), self.from_client.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn expect_payload(&mut self) -> GatewayPayload {
        match self.recv().await {
            Some(ClientFrame::Payload(payload)) => payload,
            other => panic!("expected a payload, got {other:?}"),
        }
    }

    /// Skip heartbeats until the client closes, returning the close code
    pub async fn expect_close(&mut self) -> u16 {
        loop {
            match self.recv().await {
                Some(ClientFrame::Close(code)) => return code,
                Some(ClientFrame::Payload(_)) => continue,
                None => panic!("connection ended without a close frame"),
            }
        }
    }

    /// Hello, then answer Identify with READY or Resume with RESUMED.
    /// Returns the handshake payload the client sent.
    pub async fn complete_handshake(&mut self, session_id: &str, sequence: u64) -> GatewayPayload {
        self.hello(HEARTBEAT_INTERVAL_MS);
        let payload = self.expect_payload().await;
        match payload.op.as_u8() {
            2 => self.ready(session_id, sequence),
            6 => self.resumed(sequence),
            other => panic!("expected identify or resume, got op {other}"),
        }
        payload
    }
}
