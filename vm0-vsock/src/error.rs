#[derive(Debug, thiserror::Error)]
pub enum VsockError {
    #[error("vsock handshake failed: expected \"OK <port>\", got {0:?}")]
    Handshake(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed before a reply was received")]
    ConnectionClosed,
}

pub type VsockResult<T> = Result<T, VsockError>;
