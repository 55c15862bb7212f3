//! Keeps `N` restored VMs warm behind a local socket so `vm0 run` can skip
//! cold restore most of the time (§4.9/§4.10 of the execution model).

mod client;
mod daemon;
mod error;
mod lock;
mod protocol;
mod socket_path;

pub use client::{send_request, try_pool_exec};
pub use daemon::PoolDaemon;
pub use error::{PoolError, PoolResult};
pub use lock::acquire as acquire_pid_lock;
pub use protocol::{PoolRequest, PoolResponse, StatusRecord};
pub use socket_path::{default_socket_path, pid_file_path};
