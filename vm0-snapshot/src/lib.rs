mod error;
mod holepunch;
mod maker;
mod metadata;

pub use error::{SnapshotError, SnapshotResult};
pub use holepunch::punch_zero_chunks;
pub use maker::{PrepareConfig, prepare};
pub use metadata::SnapshotMetadata;
pub use vm0_vsock::RUNNER_PORT;
