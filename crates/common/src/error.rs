use thiserror::Error;

/// Errors surfaced by the onion-routing engine
#[derive(Debug, Error)]
pub enum OnionError {
    #[error("Handshake verification failed")]
    HandshakeVerificationFailed,

    #[error("Server not found in directory: {0}")]
    ServerNotFound(String),

    #[error("No route found: {0}")]
    NoRouteFound(String),

    #[error("No free stream ids on circuit")]
    NoFreeStreamIds,

    #[error("Circuit closed")]
    CircuitClosed,

    #[error("No answer within {0} ms")]
    NoAnswer(u64),

    #[error("Unexpected cell type: expected {expected}, got {actual}")]
    UnexpectedCellType { expected: String, actual: String },

    #[error("Stream ended by peer (reason {reason})")]
    StreamEnded { reason: u8 },

    #[error("Circuit truncated by peer (reason {reason})")]
    Truncated { reason: u8 },

    #[error("Circuit destroyed (reason {reason})")]
    Destroyed { reason: u8 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Extension rejected: {0}")]
    ExtensionRejected(String),

    #[error("Circuit setup exceeded {0} ms")]
    SetupTimeout(u64),

    #[error("Interrupted")]
    Interrupted,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for onion-routing operations
pub type Result<T> = std::result::Result<T, OnionError>;

impl OnionError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn unexpected(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::UnexpectedCellType {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether a single build attempt that failed with this error may be retried
    /// on a different route.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HandshakeVerificationFailed
                | Self::ServerNotFound(_)
                | Self::NoRouteFound(_)
                | Self::NoAnswer(_)
                | Self::UnexpectedCellType { .. }
                | Self::Truncated { .. }
                | Self::Destroyed { .. }
                | Self::Transport(_)
                | Self::Protocol(_)
                | Self::ExtensionRejected(_)
                | Self::Io(_)
        )
    }

    /// Whether this error means the underlying link is unusable
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}
