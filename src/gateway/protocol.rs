//! Gateway wire format
//!
//! Every frame on the control connection is a JSON object `{op, d, s, t}`. `op` is
//! resolved against a fixed table into [`OpCode`]; codes outside the table decode
//! into [`OpCode::Unknown`] instead of failing the frame.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Gateway operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Server dispatches an event
    Dispatch,
    /// Heartbeat, sent by the client or requested by the server
    Heartbeat,
    /// Start a new session
    Identify,
    /// Update the client's presence
    PresenceUpdate,
    /// Join, move or leave voice channels
    VoiceStateUpdate,
    /// Resume a previous session
    Resume,
    /// Server asks the client to reconnect and resume
    Reconnect,
    /// Request guild members
    RequestMembers,
    /// Session has been invalidated
    InvalidSession,
    /// First frame after the socket opens
    Hello,
    /// Heartbeat acknowledged
    HeartbeatAck,
    /// Anything not in the table
    Unknown(u8),
}

const OPCODE_TABLE: [(u8, OpCode); 11] = [
    (0, OpCode::Dispatch),
    (1, OpCode::Heartbeat),
    (2, OpCode::Identify),
    (3, OpCode::PresenceUpdate),
    (4, OpCode::VoiceStateUpdate),
    (6, OpCode::Resume),
    (7, OpCode::Reconnect),
    (8, OpCode::RequestMembers),
    (9, OpCode::InvalidSession),
    (10, OpCode::Hello),
    (11, OpCode::HeartbeatAck),
];

impl OpCode {
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        OPCODE_TABLE
            .iter()
            .find(|(code, _)| *code == value)
            .map(|(_, op)| *op)
            .unwrap_or(Self::Unknown(value))
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Unknown(value) => value,
            known => OPCODE_TABLE
                .iter()
                .find(|(_, op)| *op == known)
                .map(|(code, _)| *code)
                .unwrap_or_default(),
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "Dispatch",
            Self::Heartbeat => "Heartbeat",
            Self::Identify => "Identify",
            Self::PresenceUpdate => "PresenceUpdate",
            Self::VoiceStateUpdate => "VoiceStateUpdate",
            Self::Resume => "Resume",
            Self::Reconnect => "Reconnect",
            Self::RequestMembers => "RequestMembers",
            Self::InvalidSession => "InvalidSession",
            Self::Hello => "Hello",
            Self::HeartbeatAck => "HeartbeatAck",
            Self::Unknown(_) => "Unknown",
        }
    }
}

impl Serialize for OpCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for OpCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Self::from_u8(u8::deserialize(deserializer)?))
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

/// One gateway frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: OpCode,

    #[serde(default)]
    pub d: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    #[must_use]
    pub fn new(op: OpCode, d: Option<Value>) -> Self {
        Self { op, d, s: None, t: None }
    }

    /// Heartbeat carrying the last sequence seen, or null before any dispatch
    #[must_use]
    pub fn heartbeat(last_sequence: Option<u64>) -> Self {
        Self::new(OpCode::Heartbeat, Some(last_sequence.map_or(Value::Null, Value::from)))
    }

    pub fn identify(payload: &IdentifyPayload) -> Result<Self, serde_json::Error> {
        Ok(Self::new(OpCode::Identify, Some(serde_json::to_value(payload)?)))
    }

    pub fn resume(payload: &ResumePayload) -> Result<Self, serde_json::Error> {
        Ok(Self::new(OpCode::Resume, Some(serde_json::to_value(payload)?)))
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode `d` as a Hello payload
    pub fn as_hello(&self) -> Option<HelloPayload> {
        if self.op != OpCode::Hello {
            return None;
        }
        self.d.as_ref().and_then(|d| serde_json::from_value(d.clone()).ok())
    }

    /// Decode `d` as a READY payload
    pub fn as_ready(&self) -> Option<ReadyPayload> {
        if self.op != OpCode::Dispatch || self.t.as_deref() != Some(READY_EVENT) {
            return None;
        }
        self.d.as_ref().and_then(|d| serde_json::from_value(d.clone()).ok())
    }

    /// The resumable flag carried by an InvalidSession frame
    pub fn invalid_session_resumable(&self) -> bool {
        self.op == OpCode::InvalidSession && matches!(self.d, Some(Value::Bool(true)))
    }
}

impl std::fmt::Display for GatewayPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.t, self.s) {
            (Some(t), Some(s)) => write!(f, "GatewayPayload(op={}, t={t}, s={s})", self.op),
            (Some(t), None) => write!(f, "GatewayPayload(op={}, t={t})", self.op),
            _ => write!(f, "GatewayPayload(op={})", self.op),
        }
    }
}

pub const READY_EVENT: &str = "READY";
pub const RESUMED_EVENT: &str = "RESUMED";

/// Payload for op 10 (Hello)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// Payload of the READY dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,

    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// Client connection properties sent with Identify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Payload for op 2 (Identify)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub intents: u64,
    pub shard: [u32; 2],
    pub properties: ConnectionProperties,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,

    pub compress: bool,
    pub large_threshold: u32,
}

/// Payload for op 6 (Resume)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}
