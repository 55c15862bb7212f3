#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] vm0_orchestrator::OrchestratorError),

    #[error("paths error: {0}")]
    Paths(#[from] vm0_paths::PathsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed pool message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("pid file {path} is held by another process")]
    LockHeld { path: std::path::PathBuf },

    #[error("no pool daemon is running at {path}")]
    NotRunning { path: std::path::PathBuf },
}

pub type PoolResult<T> = Result<T, PoolError>;
