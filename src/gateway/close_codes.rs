//! WebSocket close codes
//!
//! The close code sent by the remote decides recovery: a fixed allow-list is
//! recoverable, a subset of that list must re-identify instead of resuming, and
//! everything else is fatal.

/// Gateway close codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSequence = 4007,
    RateLimited = 4008,
    SessionTimeout = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
    InvalidApiVersion = 4012,
    InvalidIntents = 4013,
    DisallowedIntents = 4014,
}

impl CloseCode {
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSequence),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimeout),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::UnknownError => "Unknown error occurred",
            Self::UnknownOpcode => "Invalid opcode sent",
            Self::DecodeError => "Invalid payload encoding",
            Self::NotAuthenticated => "Payload sent before identifying",
            Self::AuthenticationFailed => "Authentication failed",
            Self::AlreadyAuthenticated => "Identified more than once",
            Self::InvalidSequence => "Invalid sequence number for resume",
            Self::RateLimited => "Sending payloads too quickly",
            Self::SessionTimeout => "Session timed out",
            Self::InvalidShard => "Invalid shard",
            Self::ShardingRequired => "Sharding required",
            Self::InvalidApiVersion => "Invalid API version",
            Self::InvalidIntents => "Invalid intents",
            Self::DisallowedIntents => "Disallowed intents",
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u16())
    }
}

/// Normal closure; the remote forgets the session
pub const NORMAL_CLOSURE: u16 = 1000;
/// Endpoint going away
pub const GOING_AWAY: u16 = 1001;
/// No close frame was received
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code used when the client drops a connection it intends to resume
pub const RESUME_CLOSE_CODE: u16 = 4000;

const RECOVERABLE: [u16; 11] = [
    NORMAL_CLOSURE,
    GOING_AWAY,
    ABNORMAL_CLOSURE,
    4000,
    4001,
    4002,
    4003,
    4005,
    4007,
    4008,
    4009,
];

const NON_RESUMABLE: [u16; 4] = [NORMAL_CLOSURE, GOING_AWAY, 4007, 4009];

/// What to do after the remote closed the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume the session
    Resume,
    /// Reconnect with a fresh identify
    Reidentify,
    /// Stop and surface the code
    Fatal,
}

impl CloseAction {
    /// Classify a close code. A missing code means the transport dropped without
    /// a close frame, which is always worth resuming.
    #[must_use]
    pub fn classify(code: Option<u16>) -> Self {
        let Some(code) = code else {
            return Self::Resume;
        };
        if !RECOVERABLE.contains(&code) {
            Self::Fatal
        } else if NON_RESUMABLE.contains(&code) {
            Self::Reidentify
        } else {
            Self::Resume
        }
    }

    #[must_use]
    pub fn is_recoverable(self) -> bool {
        self != Self::Fatal
    }
}
