#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(String),

    #[error("image error: {0}")]
    Image(#[from] vm0_image::ImageError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] vm0_snapshot::SnapshotError),

    #[error("paths error: {0}")]
    Paths(#[from] vm0_paths::PathsError),

    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] vm0_orchestrator::OrchestratorError),

    #[error("pool error: {0}")]
    Pool(#[from] vm0_pool::PoolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CliResult<T> = Result<T, CliError>;
