mod error;
mod protocol;
mod root;
mod server;

pub use error::{FileServerError, FileServerResult};
pub use protocol::{MAX_READ_LEN, Request};
pub use server::serve;
