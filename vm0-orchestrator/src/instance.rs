use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use vm0_hypervisor::{HypervisorDriver, MemBackend};
use vm0_paths::{HomePaths, InstancePaths, SnapshotPaths};
use vm0_uffd::{FaultMode, PreloadedHandler, UffdHandler};
use vm0_vsock::{ExecRequest, ExecResponse, FILE_SERVER_PORT, RUNNER_PORT, TablePreview, guest_listener_path};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::info::InstanceInfo;
use crate::prerequisites::check_prerequisites;
use crate::sweep::sweep_dead_run_dirs;

/// Guest-side script error, or any other general failure.
pub const EXIT_GENERAL_ERROR: i32 = 1;
/// Caller's `--timeout-secs` elapsed before the runner replied.
pub const EXIT_TIMEOUT: i32 = 124;
/// SIGINT/SIGTERM arrived while an instance was live.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Everything the orchestrator's public entry point needs, resolved by the
/// caller (version lookup, file-vs-stdin reading, etc. are the CLI's job).
pub struct RestoreRequest {
    pub home: HomePaths,
    pub version: String,
    pub code: String,
    pub show_tables: bool,
    pub show_table_meta: bool,
    pub cwd: PathBuf,
    /// `Duration::ZERO` means unbounded.
    pub timeout: Duration,
}

pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A single request to run against an already-warm [`ReadyInstance`]. Mirrors
/// `RestoreRequest` minus the fields that only matter at restore time.
pub struct ExecRequestArgs {
    pub code: String,
    pub show_tables: bool,
    pub show_table_meta: bool,
    pub cwd: PathBuf,
    /// `Duration::ZERO` means unbounded.
    pub timeout: Duration,
}

/// A restored-but-not-yet-consumed VM: steps 1-9 of the restore flow have
/// already run. Holds every handle that must outlive the instance (VMM
/// process, file server task, UFFD fault loop) until [`ReadyInstance::destroy`]
/// tears it all down. The pool daemon keeps a channel of these; the one-shot
/// orchestrator restores one, execs it, and destroys it immediately.
pub struct ReadyInstance {
    version: String,
    snap: SnapshotPaths,
    instance: InstancePaths,
    driver: HypervisorDriver,
    fileserver_handle: Option<tokio::task::JoinHandle<()>>,
    uffd: Option<UffdGuard>,
}

struct UffdGuard {
    handler: Arc<UffdHandler>,
    fault_loop: tokio::task::JoinHandle<()>,
}

impl ReadyInstance {
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Steps 1-5 and 7-9: verify the snapshot, run prerequisite checks and
    /// the dead-run-dir sweep, probe UFFD, launch the VMM, and restore it up
    /// to (and including) resume. Step 6 (the file server) is deferred to
    /// [`ReadyInstance::exec`], since it needs the caller's `cwd`.
    pub async fn restore(home: &HomePaths, version: &str) -> OrchestratorResult<Self> {
        // 1. Verify snapshot completeness; fail fast if missing.
        vm0_paths::snapshot_valid(home, version)?;
        let snap = home.snapshot(version);

        // 2. Page-cache warming, fire-and-forget; overlaps everything below.
        spawn_page_cache_warm(snap.memory());

        // 3. Prerequisite checks and a dead-run-dir sweep, in parallel.
        let prereq_home = home.clone();
        let sweep_home = home.clone();
        let (prereqs, _) = tokio::join!(
            tokio::task::spawn_blocking(move || check_prerequisites(&prereq_home)),
            tokio::task::spawn_blocking(move || sweep_dead_run_dirs(&sweep_home)),
        );
        prereqs.map_err(|e| OrchestratorError::Prerequisites(e.to_string()))??;

        // 4. Probe UFFD availability; downgrade silently if unavailable.
        let use_uffd = std::env::var("VM0_DISABLE_UFFD").is_err() && vm0_uffd::uffd_available();
        if !use_uffd {
            tracing::info!("restoring in file-backed mode (uffd disabled or unavailable)");
        }

        // 5. Per-instance run directory.
        let instance_id = uuid::Uuid::new_v4().to_string();
        let instance = home.instance(&instance_id);
        tokio::fs::create_dir_all(instance.dir()).await?;

        match Self::launch_and_load(home, version, &snap, &instance, use_uffd).await {
            Ok(ready) => Ok(ready),
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(instance.dir()).await;
                Err(e)
            }
        }
    }

    async fn launch_and_load(
        home: &HomePaths,
        version: &str,
        snap: &SnapshotPaths,
        instance: &InstancePaths,
        use_uffd: bool,
    ) -> OrchestratorResult<Self> {
        // 7. In UFFD mode, preload + start the handshake listener before the
        // VMM is launched, so the handler is ready the moment it connects.
        let preloaded = if use_uffd {
            Some(UffdHandler::preload(instance.uffd_sock(), &snap.memory())?)
        } else {
            None
        };

        let mut driver = HypervisorDriver::launch(&home.firecracker_bin(), &instance.firecracker_sock()).await?;
        if let Some(pid) = driver.pid() {
            let info = InstanceInfo { pid, version: version.to_string() };
            tokio::fs::write(instance.info(), serde_json::to_vec(&info)?).await?;
        }

        match drive_restore(snap, instance, &mut driver, preloaded).await {
            Ok(uffd) => Ok(ReadyInstance {
                version: version.to_string(),
                snap: snap.clone(),
                instance: instance.clone(),
                driver,
                fileserver_handle: None,
                uffd,
            }),
            Err(e) => {
                let _ = driver.stop().await;
                Err(e)
            }
        }
    }

    /// Step 6 (deferred until here, since the pool restores ahead of knowing
    /// which request a warm VM will serve) plus steps 10-12: start the file
    /// server on the snapshot's original embedded vsock path, dial the
    /// runner subject to the caller's timeout and to interruption by
    /// SIGINT/SIGTERM, and format the result.
    pub async fn exec(&mut self, req: &ExecRequestArgs) -> OrchestratorResult<ExecOutcome> {
        self.fileserver_handle = Some(start_fileserver(&self.snap.vsock(), req.cwd.clone()));

        let request = ExecRequest {
            code: req.code.clone(),
            show_tables: req.show_tables,
            show_table_meta: req.show_table_meta,
        };
        run_request(&self.snap.vsock(), &request, req.timeout).await
    }

    /// Step 13: stop the VMM, abort the file server and fault loop, remove
    /// the run directory. Always safe to call, even after a failed `exec`,
    /// or before `exec` ever ran (scale-down of a still-ready pool slot).
    pub async fn destroy(self) {
        if let Some(fileserver_handle) = self.fileserver_handle {
            fileserver_handle.abort();
        }
        if let Some(uffd) = self.uffd {
            uffd.fault_loop.abort();
            drop(uffd.handler);
        }
        let mut driver = self.driver;
        let _ = driver.stop().await;
        let _ = tokio::fs::remove_dir_all(self.instance.dir()).await;
    }
}

/// Run the full restore-and-execute flow end to end. Always tears the
/// instance down on the way out, success or failure alike.
pub async fn restore_and_exec(req: RestoreRequest) -> OrchestratorResult<ExecOutcome> {
    let mut ready = ReadyInstance::restore(&req.home, &req.version).await?;

    let exec_args = ExecRequestArgs {
        code: req.code,
        show_tables: req.show_tables,
        show_table_meta: req.show_table_meta,
        cwd: req.cwd,
        timeout: req.timeout,
    };
    let result = ready.exec(&exec_args).await;
    ready.destroy().await;
    result
}

async fn drive_restore(
    snap: &SnapshotPaths,
    instance: &InstancePaths,
    driver: &mut HypervisorDriver,
    preloaded: Option<PreloadedHandler>,
) -> OrchestratorResult<Option<UffdGuard>> {
    let handler = match preloaded {
        Some(preloaded) => {
            // 8. Launch restore with the UFFD socket; the VMM dials it
            // during snapshot load, so the handshake must run concurrently.
            let handshake = tokio::spawn(preloaded.await_handshake());
            if let Err(e) = driver
                .load_snapshot(
                    &snap.vmstate(),
                    &MemBackend::Uffd { uffd_sock_path: instance.uffd_sock() },
                    false,
                )
                .await
            {
                // The VMM never dials back on a failed restore, so the
                // handshake task would otherwise sit parked forever inside
                // its blocking `accept()`.
                handshake.abort();
                return Err(e.into());
            }
            let handler = handshake
                .await
                .map_err(|e| OrchestratorError::Prerequisites(format!("uffd handshake task panicked: {e}")))??;
            Some(Arc::new(handler))
        }
        None => {
            // 8 (file mode). `resume_on_load = true`: the load implicitly
            // resumes, there is nothing further to await.
            driver
                .load_snapshot(&snap.vmstate(), &MemBackend::File { mem_file_path: snap.memory() }, true)
                .await?;
            None
        }
    };

    let fault_loop = handler.clone().map(|handler| {
        tokio::spawn(async move {
            handler.run_fault_loop().await;
        })
    });

    if let Some(handler) = &handler {
        // 9. Await eager-copy completion, then explicitly resume.
        handler.run_eager_copy(FaultMode::hybrid_from_env()).await?;
        driver.resume().await?;
    }

    Ok(match (handler, fault_loop) {
        (Some(handler), Some(fault_loop)) => Some(UffdGuard { handler, fault_loop }),
        _ => None,
    })
}

enum RequestOutcome {
    Response(ExecResponse),
    TimedOut,
    Interrupted,
}

async fn run_request(vsock_path: &Path, request: &ExecRequest, timeout: Duration) -> OrchestratorResult<ExecOutcome> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let outcome = tokio::select! {
        result = vm0_vsock::exec(vsock_path, RUNNER_PORT, request) => RequestOutcome::Response(result?),
        () = tokio::time::sleep(timeout), if !timeout.is_zero() => RequestOutcome::TimedOut,
        _ = tokio::signal::ctrl_c() => RequestOutcome::Interrupted,
        _ = sigterm.recv() => RequestOutcome::Interrupted,
    };

    Ok(match outcome {
        RequestOutcome::Response(response) => format_response(response, request.show_tables),
        RequestOutcome::TimedOut => ExecOutcome {
            exit_code: EXIT_TIMEOUT,
            stdout: String::new(),
            stderr: String::new(),
        },
        RequestOutcome::Interrupted => ExecOutcome {
            exit_code: EXIT_INTERRUPTED,
            stdout: String::new(),
            stderr: String::new(),
        },
    })
}

fn format_response(response: ExecResponse, show_tables: bool) -> ExecOutcome {
    let exit_code = if response.error.is_some() { EXIT_GENERAL_ERROR } else { response.exit_code };

    let mut stderr = response.stderr;
    if let Some(error) = &response.error {
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str(error);
    }

    let mut stdout = response.stdout;
    if show_tables && !response.tables.is_empty() {
        stdout.push_str(&format_tables(&response.tables));
    }

    ExecOutcome { exit_code, stdout, stderr }
}

fn format_tables(tables: &[TablePreview]) -> String {
    let mut out = String::new();
    for table in tables {
        let kind = if table.is_refreshing { "refreshing" } else { "static" };
        out.push_str(&format!("=== Table: {} ({} rows, {kind}) ===\n{}\n", table.name, table.row_count, table.preview));
    }
    out
}

fn start_fileserver(snap_vsock: &Path, root: PathBuf) -> tokio::task::JoinHandle<()> {
    let listen_path = guest_listener_path(snap_vsock, FILE_SERVER_PORT);
    tokio::spawn(async move {
        if let Err(e) = vm0_fileserver::serve(listen_path, root).await {
            tracing::warn!(error = %e, "file server exited");
        }
    })
}

fn spawn_page_cache_warm(mem_file_path: PathBuf) {
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let Ok(mut file) = std::fs::File::open(&mem_file_path) else { return };
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            match file.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(exit_code: i32, error: Option<&str>) -> ExecResponse {
        ExecResponse {
            exit_code,
            stdout: "hi\n".into(),
            stderr: String::new(),
            result_repr: None,
            error: error.map(str::to_string),
            tables: Vec::new(),
            timing: None,
        }
    }

    #[test]
    fn format_response_passes_through_exit_code_on_success() {
        let outcome = format_response(response(0, None), false);
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout, "hi\n");
        assert!(outcome.stderr.is_empty());
    }

    #[test]
    fn format_response_forces_exit_code_one_on_guest_error() {
        let outcome = format_response(response(0, Some("ValueError: boom")), false);
        assert_eq!(outcome.exit_code, EXIT_GENERAL_ERROR);
        assert!(outcome.stderr.contains("boom"));
    }

    #[test]
    fn format_response_appends_table_headers_when_requested() {
        let mut resp = response(0, None);
        resp.tables.push(TablePreview {
            name: "t".into(),
            row_count: 5,
            is_refreshing: false,
            preview: "a b c".into(),
        });

        let outcome = format_response(resp, true);
        assert!(outcome.stdout.contains("=== Table: t (5 rows, static) ==="));
    }

    #[test]
    fn format_response_omits_table_headers_when_not_requested() {
        let mut resp = response(0, None);
        resp.tables.push(TablePreview {
            name: "t".into(),
            row_count: 5,
            is_refreshing: false,
            preview: "a b c".into(),
        });

        let outcome = format_response(resp, false);
        assert!(!outcome.stdout.contains("=== Table"));
    }
}
