use thiserror::Error;

use super::close_codes::CloseCode;

/// Errors raised by the gateway connection engine.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The socket could not be opened or broke underneath us
    #[error("Transport error: {0}")]
    Transport(String),

    /// Hello was missing or malformed, or the handshake stalled
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// The remote closed the connection with a code outside the recoverable set
    #[error("Session closed by remote with code {code}: {reason}")]
    SessionClosed { code: u16, reason: String },

    /// The remote rejected identify/resume with an InvalidSession frame
    #[error("Session invalidated (resumable: {resumable})")]
    InvalidSession { resumable: bool },

    /// No live transport to write to
    #[error("Not connected")]
    NotConnected,

    /// Compressed stream could not be inflated
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
}

impl GatewayError {
    /// Known close code carried by a `SessionClosed` error
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::SessionClosed { code, .. } => CloseCode::from_u16(*code),
            _ => None,
        }
    }

    /// Transient errors the supervisor may retry by reconnecting
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Handshake(_)
                | Self::InvalidSession { .. }
                | Self::NotConnected
                | Self::Timeout(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
