mod builder;
mod command;
mod error;
mod init_script;
mod prerequisites;

pub use builder::{BuildConfig, build};
pub use error::{ImageError, ImageResult};
pub use init_script::JVM_OPTS;
