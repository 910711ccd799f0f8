use thiserror::Error;

/// Main error type for the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("WebSocket closed")]
    TransportClosed,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("binary frames are not supported")]
    BinaryFrame,

    #[error("extension not connected")]
    ExtensionNotConnected,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("CDP protocol error: {0}")]
    CdpProtocol(String),

    #[error("unsupported channel: {0}")]
    UnsupportedChannel(String),

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    pub fn malformed_frame(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }

    pub fn cdp_protocol(msg: impl Into<String>) -> Self {
        Self::CdpProtocol(msg.into())
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn unsupported_channel(msg: impl Into<String>) -> Self {
        Self::UnsupportedChannel(msg.into())
    }

    pub fn executable_not_found(msg: impl Into<String>) -> Self {
        Self::ExecutableNotFound(msg.into())
    }
}
