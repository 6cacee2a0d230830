//! Error types for the wsveil transport.

use thiserror::Error;

/// Result type alias for wsveil operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dialing, accepting, or driving a flow.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The address scheme or network is not supported
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The transform engine rejected the named strategy
    #[error("failed to compile transform strategy: {0}")]
    Strategy(String),

    /// Applying the transform strategy to the first request failed
    #[error("transform failed: {0}")]
    Transform(String),

    /// Normalizing the first inbound request failed
    #[error("normalization failed: {0}")]
    Normalize(String),

    /// The encryption key does not select a valid AES variant
    #[error("encryption key must be 16, 24, or 32 bytes, got {0}")]
    EncryptionKey(usize),

    /// WebSocket protocol or handshake error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// The handshake did not complete in time
    #[error("handshake timed out after {0}ms")]
    Timeout(u64),

    /// The listener has been closed
    #[error("listener closed")]
    ListenerClosed,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new strategy-compilation error
    pub fn strategy(msg: impl Into<String>) -> Self {
        Error::Strategy(msg.into())
    }

    /// Create a new transform error
    pub fn transform(msg: impl Into<String>) -> Self {
        Error::Transform(msg.into())
    }

    /// Create a new normalization error
    pub fn normalize(msg: impl Into<String>) -> Self {
        Error::Normalize(msg.into())
    }

    /// Create a new TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check whether this error ends a single flow rather than the listener
    pub fn is_per_flow(&self) -> bool {
        !matches!(self, Error::ListenerClosed)
    }
}

// Wrapper connections surface crate errors through `poll_read`/`poll_write`,
// which speak `io::Error`.
impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
