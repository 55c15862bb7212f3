use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::error::{HypervisorError, HypervisorResult};
use crate::process::kill_process_group;

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;
const STATE_STOPPED: u8 = 3;

const API_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the guest's memory comes from on restore. The only polymorphism
/// this driver needs: everything else is a tagged field, not a trait.
pub enum MemBackend {
    /// Restore reads the full memory image from disk; resumes implicitly.
    File { mem_file_path: PathBuf },
    /// Restore dials a UFFD handler socket; the driver must call
    /// [`HypervisorDriver::resume`] explicitly afterward.
    Uffd { uffd_sock_path: PathBuf },
}

/// A running (or being-restored) Firecracker child process plus its API
/// client. One driver instance owns exactly one VMM child.
pub struct HypervisorDriver {
    child: Child,
    api: ApiClient,
    state: Arc<AtomicU8>,
}

impl HypervisorDriver {
    /// Spawn the Firecracker binary, wait for its API socket to come up, and
    /// start a background task that drains its stderr.
    pub async fn launch(binary_path: &Path, api_sock_path: &Path) -> HypervisorResult<Self> {
        // A stale socket from a crashed prior instance must not confuse the
        // new child's bind.
        let _ = std::fs::remove_file(api_sock_path);

        let mut child = Command::new(binary_path)
            .arg("--api-sock")
            .arg(api_sock_path)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .process_group(0)
            .spawn()
            .map_err(HypervisorError::Spawn)?;

        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(stderr);
        }

        let api = ApiClient::new(api_sock_path.to_path_buf());
        api.wait_for_ready(API_READY_TIMEOUT).await?;

        Ok(Self {
            child,
            api,
            state: Arc::new(AtomicU8::new(STATE_CREATED)),
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// PID of the Firecracker child process, for crash-recovery bookkeeping.
    /// `None` only if the child has already been waited on.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn configure_machine(&self, vcpu_count: u32, mem_size_mib: u32) -> HypervisorResult<()> {
        self.api
            .put("/machine-config", &json!({"vcpu_count": vcpu_count, "mem_size_mib": mem_size_mib}))
            .await
    }

    pub async fn configure_boot_source(&self, kernel_path: &Path, boot_args: &str) -> HypervisorResult<()> {
        self.api
            .put(
                "/boot-source",
                &json!({"kernel_image_path": kernel_path, "boot_args": boot_args}),
            )
            .await
    }

    /// Attach a drive. `drive_id` `"rootfs"` is the root device by
    /// convention (§4.2).
    pub async fn attach_drive(
        &self,
        drive_id: &str,
        path_on_host: &Path,
        is_read_only: bool,
    ) -> HypervisorResult<()> {
        let is_root_device = drive_id == "rootfs";
        self.api
            .put(
                format!("/drives/{drive_id}"),
                &json!({
                    "drive_id": drive_id,
                    "path_on_host": path_on_host,
                    "is_root_device": is_root_device,
                    "is_read_only": is_read_only,
                }),
            )
            .await
    }

    /// Attach the vsock device. The guest CID is fixed at 3; `uds_path`
    /// becomes embedded in the snapshot's vmstate and must never change
    /// across a restore of the same snapshot.
    pub async fn attach_vsock(&self, uds_path: &Path) -> HypervisorResult<()> {
        self.api
            .put(
                "/vsock",
                &json!({"vsock_id": "vsock0", "guest_cid": 3, "uds_path": uds_path}),
            )
            .await
    }

    /// Install the balloon device. Must happen before `start`; the amount
    /// is inflated/deflated afterward via [`Self::update_balloon`].
    pub async fn install_balloon(&self) -> HypervisorResult<()> {
        self.api
            .put(
                "/balloon",
                &json!({"amount_mib": 0, "deflate_on_oom": true, "stats_polling_interval_s": 0}),
            )
            .await
    }

    pub async fn start(&self) -> HypervisorResult<()> {
        self.api
            .put("/actions", &json!({"action_type": "InstanceStart"}))
            .await?;
        self.state.store(STATE_RUNNING, Ordering::SeqCst);
        Ok(())
    }

    pub async fn update_balloon(&self, amount_mib: u32) -> HypervisorResult<()> {
        self.api.patch("/balloon", &json!({"amount_mib": amount_mib})).await
    }

    pub async fn pause(&self) -> HypervisorResult<()> {
        self.api.patch("/vm", &json!({"state": "Paused"})).await
    }

    pub async fn resume(&self) -> HypervisorResult<()> {
        self.api.patch("/vm", &json!({"state": "Resumed"})).await
    }

    pub async fn create_snapshot(&self, mem_file_path: &Path, snapshot_path: &Path) -> HypervisorResult<()> {
        self.api
            .put(
                "/snapshot/create",
                &json!({"mem_file_path": mem_file_path, "snapshot_path": snapshot_path}),
            )
            .await
    }

    /// Load a snapshot. Exactly one of `mem.File`/`mem.Uffd` applies at a
    /// time (never both). `resume_on_load` must be `false` in UFFD mode so
    /// the orchestrator can resume explicitly after eager-copy completes.
    pub async fn load_snapshot(
        &self,
        snapshot_path: &Path,
        mem: &MemBackend,
        resume_on_load: bool,
    ) -> HypervisorResult<()> {
        #[derive(Serialize)]
        struct MemBackendWire<'a> {
            backend_type: &'static str,
            backend_path: &'a Path,
        }

        let mem_backend = match mem {
            MemBackend::File { mem_file_path } => MemBackendWire {
                backend_type: "File",
                backend_path: mem_file_path,
            },
            MemBackend::Uffd { uffd_sock_path } => MemBackendWire {
                backend_type: "Uffd",
                backend_path: uffd_sock_path,
            },
        };

        self.api
            .put(
                "/snapshot/load",
                &json!({
                    "snapshot_path": snapshot_path,
                    "mem_backend": mem_backend,
                    "resume_vm": resume_on_load,
                }),
            )
            .await?;
        self.state.store(STATE_RUNNING, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the VMM and kill its process group. Idempotent: a second call
    /// after the first is a no-op.
    pub async fn stop(&mut self) -> HypervisorResult<()> {
        // CAS out of whichever pre-stop state we're in; a concurrent or
        // repeated caller that loses the race just returns early.
        let prior = self.state.swap(STATE_STOPPING, Ordering::SeqCst);
        if prior == STATE_STOPPING || prior == STATE_STOPPED {
            self.state.store(prior, Ordering::SeqCst);
            return Ok(());
        }

        kill_process_group(&self.child);
        let _ = self.child.wait().await;
        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_STOPPED
    }
}

impl Drop for HypervisorDriver {
    fn drop(&mut self) {
        if !self.is_stopped() {
            warn!("HypervisorDriver dropped without calling stop(); killing process group");
            kill_process_group(&self.child);
        }
    }
}

fn spawn_stderr_drain(stderr: tokio::process::ChildStderr) {
    use tokio::io::{AsyncBufReadExt, BufReader};
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "firecracker", "{line}");
        }
    });
}
