//! Wires paths, hypervisor, UFFD, file server, and vsock together into one
//! restore-and-execute instance lifecycle.

mod error;
mod info;
mod instance;
mod prerequisites;
mod sweep;

pub use error::{OrchestratorError, OrchestratorResult};
pub use instance::{
    EXIT_GENERAL_ERROR, EXIT_INTERRUPTED, EXIT_TIMEOUT, ExecOutcome, ExecRequestArgs, ReadyInstance, RestoreRequest,
    restore_and_exec,
};
pub use prerequisites::check_prerequisites;
pub use sweep::sweep_dead_run_dirs;
