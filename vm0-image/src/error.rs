#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("missing prerequisite(s): {0}")]
    Prerequisites(String),

    #[error("command failed: {command}\n{detail}")]
    Command { command: String, detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ImageResult<T> = Result<T, ImageError>;
