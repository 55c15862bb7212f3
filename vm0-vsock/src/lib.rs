mod client;
mod error;
mod protocol;

pub use client::{FILE_SERVER_PORT, RUNNER_PORT, TRANSACTION_DEADLINE, exec, guest_listener_path, wait_ready};
pub use error::{VsockError, VsockResult};
pub use protocol::{ExecRequest, ExecResponse, TablePreview};
