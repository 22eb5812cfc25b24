use thiserror::Error;

/// Errors from the Tor control port
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Tor replied {status}: {message}")]
    Reply { status: u16, message: String },

    #[error("Malformed control reply: {0}")]
    Malformed(String),

    #[error("Control connection closed by Tor")]
    Closed,

    #[error("Control connection is out of step with Tor after an earlier failure")]
    Desynced,

    #[error("Every directory rejected the descriptor of {0}")]
    PublicationFailed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("No usable authentication method (Tor offers: {0})")]
    NoAuthMethod(String),

    #[error("Not connected to a Tor control port")]
    NotConnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for control port operations
pub type Result<T> = std::result::Result<T, ControlError>;

impl ControlError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }
}
