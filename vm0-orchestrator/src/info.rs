use serde::{Deserialize, Serialize};

/// Persisted at `InstancePaths::info()` for the lifetime of a restored
/// instance. Crash-recovery's only source of truth: if the process named
/// by `pid` is gone, the run directory is dead (§4.8 step 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub pid: u32,
    pub version: String,
}
