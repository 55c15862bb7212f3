#[derive(Debug, thiserror::Error)]
pub enum FileServerError {
    #[error("failed to bind listener at {0}: {1}")]
    Bind(std::path::PathBuf, std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FileServerResult<T> = Result<T, FileServerError>;
