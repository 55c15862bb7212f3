#[derive(Debug, thiserror::Error)]
pub enum UffdError {
    #[error("failed to bind handshake socket at {0}: {1}")]
    Bind(std::path::PathBuf, std::io::Error),

    #[error("uffd handshake failed after {0} attempts: {1}")]
    Handshake(u32, String),

    #[error("malformed region list: {0}")]
    MalformedRegions(String),

    #[error("mmap failed: {0}")]
    Mmap(nix::errno::Errno),

    #[error("madvise failed: {0}")]
    Madvise(nix::errno::Errno),

    #[error("page-copy ioctl failed at {addr:#x}: {source}")]
    Copy { addr: usize, source: std::io::Error },

    #[error("zeropage ioctl failed at {addr:#x}: {source}")]
    Zeropage { addr: usize, source: std::io::Error },

    #[error("fault address {0:#x} is outside every known region")]
    AddressOutOfRange(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type UffdResult<T> = Result<T, UffdError>;
