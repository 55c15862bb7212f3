#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("prerequisite check failed: {0}")]
    Prerequisites(String),

    #[error("snapshot is not valid: {0}")]
    InvalidSnapshot(#[from] vm0_paths::PathsError),

    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] vm0_hypervisor::HypervisorError),

    #[error("uffd error: {0}")]
    Uffd(#[from] vm0_uffd::UffdError),

    #[error("file server error: {0}")]
    FileServer(#[from] vm0_fileserver::FileServerError),

    #[error("vsock error: {0}")]
    Vsock(#[from] vm0_vsock::VsockError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
