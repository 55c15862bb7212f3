#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("failed to launch firecracker: {0}")]
    Spawn(std::io::Error),

    #[error("api socket {0} did not become ready within the deadline")]
    ApiNotReady(std::path::PathBuf),

    #[error("firecracker api error: {method} {path} -> {detail}")]
    Api {
        method: &'static str,
        path: String,
        detail: String,
    },

    #[error("malformed response from firecracker api: {0}")]
    MalformedResponse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("instance already stopped")]
    AlreadyStopped,
}

pub type HypervisorResult<T> = Result<T, HypervisorError>;
