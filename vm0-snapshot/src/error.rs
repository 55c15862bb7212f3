#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("prerequisite check failed: {0}")]
    Prerequisites(String),

    #[error("rootfs not found at {0}")]
    RootfsMissing(std::path::PathBuf),

    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] vm0_hypervisor::HypervisorError),

    #[error("paths error: {0}")]
    Paths(#[from] vm0_paths::PathsError),

    #[error("vsock error: {0}")]
    Vsock(#[from] vm0_vsock::VsockError),

    #[error("timed out waiting for the runner daemon to come up")]
    RunnerTimeout,

    #[error("warmup execution {0} reported an error: {1}")]
    WarmupFailed(usize, String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SnapshotResult<T> = Result<T, SnapshotError>;
