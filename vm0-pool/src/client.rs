use std::os::unix::process::CommandExt;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use vm0_orchestrator::ExecOutcome;
use vm0_paths::HomePaths;

use crate::error::{PoolError, PoolResult};
use crate::protocol::{PoolRequest, PoolResponse};
use crate::socket_path::default_socket_path;

const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Dial the pool daemon's socket and exchange one request/response. Used by
/// `vm0 pool status|scale|stop`; `vm0 run` uses [`try_pool_exec`] instead,
/// which never surfaces an error (it always has cold restore to fall back
/// on).
pub async fn send_request(request: &PoolRequest) -> PoolResult<PoolResponse> {
    let socket_path = default_socket_path();
    let stream = UnixStream::connect(&socket_path)
        .await
        .map_err(|_| PoolError::NotRunning { path: socket_path.clone() })?;
    roundtrip(stream, request).await.map_err(PoolError::Io)
}

/// Thin adapter the orchestrator's caller tries before paying for a cold
/// restore. Every failure mode here (no daemon, daemon busy, version
/// mismatch) returns `None` rather than an error — the caller always has
/// cold restore as the fallback.
pub async fn try_pool_exec(home: &HomePaths, version: &str, code: &str, cwd: &Path, show_tables: bool, show_table_meta: bool) -> Option<ExecOutcome> {
    let socket_path = default_socket_path();

    let Ok(Ok(stream)) = tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(&socket_path)).await else {
        spawn_daemon_if_snapshot_exists(home, version, &socket_path);
        return None;
    };

    let request = PoolRequest::Exec {
        code: code.to_string(),
        cwd: cwd.to_path_buf(),
        show_tables,
        show_table_meta,
    };

    match roundtrip(stream, &request).await {
        Ok(PoolResponse::ExecResult { version: got_version, exit_code, stdout, stderr }) => {
            if got_version != version {
                tracing::warn!(expected = version, got = %got_version, "pool daemon serves a different version, falling through");
                return None;
            }
            Some(ExecOutcome { exit_code, stdout, stderr })
        }
        Ok(PoolResponse::Error { message }) => {
            tracing::info!(message, "pool daemon declined exec, falling through");
            None
        }
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "pool daemon round-trip failed, falling through");
            None
        }
    }
}

async fn roundtrip(stream: UnixStream, request: &PoolRequest) -> std::io::Result<PoolResponse> {
    let (reader, mut writer) = stream.into_split();
    let mut line = serde_json::to_string(request).map_err(std::io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;

    let mut reader = BufReader::new(reader);
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;
    serde_json::from_str(&response_line).map_err(std::io::Error::other)
}

/// Spawn the daemon detached, in a new session, with its own log file. Never
/// waits for it to become ready — the caller proceeds through cold restore
/// regardless.
fn spawn_daemon_if_snapshot_exists(home: &HomePaths, version: &str, socket_path: &Path) {
    if vm0_paths::snapshot_valid(home, version).is_err() {
        return;
    }
    if std::env::var("VM0_DISABLE_POOL_AUTOSTART").is_ok() {
        return;
    }

    let Ok(current_exe) = std::env::current_exe() else { return };
    let log_path = home.vm_dir().join("pool.log");
    let Ok(log_file) = std::fs::File::options().create(true).append(true).open(&log_path) else { return };
    let Ok(log_file_err) = log_file.try_clone() else { return };

    let mut command = std::process::Command::new(current_exe);
    command
        .arg("pool")
        .arg("start")
        .arg("--version")
        .arg(version)
        .arg("--foreground")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(log_file))
        .stderr(std::process::Stdio::from(log_file_err));

    // SAFETY: `setsid` is called alone in the forked child, before `exec`;
    // it touches only the child's own process state.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    match command.spawn() {
        Ok(_child) => tracing::info!(version, socket = %socket_path.display(), "spawned pool daemon"),
        Err(e) => tracing::warn!(error = %e, "failed to spawn pool daemon"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_pool_exec_falls_through_when_no_socket_exists() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let home = HomePaths::new(dir.path());
        unsafe {
            std::env::set_var("VM0_DISABLE_POOL_AUTOSTART", "1");
        }
        let outcome = try_pool_exec(&home, "v1", "1+1", Path::new("/tmp"), false, false).await;
        assert!(outcome.is_none());
    }
}
