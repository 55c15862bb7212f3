use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One line of newline-delimited JSON sent to the pool daemon's local socket.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolRequest {
    Exec {
        code: String,
        cwd: PathBuf,
        show_tables: bool,
        show_table_meta: bool,
    },
    Status,
    Scale {
        target_size: usize,
    },
    Stop,
}

/// One line of newline-delimited JSON sent back in reply.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolResponse {
    ExecResult {
        version: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Status(StatusRecord),
    Ok,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub running: bool,
    pub pid: u32,
    pub version: String,
    pub ready: usize,
    pub target_size: usize,
    pub idle_seconds: u64,
    pub idle_timeout_seconds: u64,
}
