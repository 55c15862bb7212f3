mod api;
mod driver;
mod error;
mod process;

pub use api::ApiClient;
pub use driver::{HypervisorDriver, MemBackend};
pub use error::{HypervisorError, HypervisorResult};
