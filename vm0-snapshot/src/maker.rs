use std::time::Duration;

use vm0_hypervisor::HypervisorDriver;
use vm0_paths::HomePaths;
use vm0_vsock::{ExecRequest, RUNNER_PORT};

use crate::error::{SnapshotError, SnapshotResult};
use crate::holepunch::punch_zero_chunks;
use crate::metadata::SnapshotMetadata;

const RUNNER_READY_POLL: Duration = Duration::from_millis(1);
const RUNNER_READY_TIMEOUT: Duration = Duration::from_secs(120);
const BALLOON_SETTLE: Duration = Duration::from_secs(3);
const BALLOON_DEFLATE_SETTLE: Duration = Duration::from_millis(500);

/// Escalating warmup scripts (§4.4 step 5): trivial assignments first, then
/// containers, functions, serialization, and table-shaped data, so the JIT
/// has compiled the hot paths by the time the snapshot is captured.
const WARMUP_CODE: &[&str] = &[
    "",
    "x = 1",
    "x = 1 + 1",
    "x = 'hello'",
    "x = [1, 2, 3]",
    "x = {'a': 1}",
    "x = sum(range(100))",
    "def f(n):\n    return n * 2\nx = f(21)",
    "class C:\n    def __init__(self, v):\n        self.v = v\nx = C(1).v",
    "t = []\nfor i in range(100):\n    t.append(i)\nx = len(t)",
    "import json\nx = json.dumps({'a': 1})",
    "import pickle\nx = pickle.dumps([1, 2, 3])",
    "f = open('/dev/null', 'w')\nf.write('hi')\nf.close()",
    "rows = [{'a': i, 'b': i * 2} for i in range(20)]\nx = len(rows)",
    "rows = [{'a': i, 'b': i * 2, 'c': str(i)} for i in range(200)]\nx = sum(r['a'] for r in rows)",
    "rows = [{'a': i, 'b': i * 2, 'c': str(i)} for i in range(2000)]\nx = [r for r in rows if r['a'] % 2 == 0]",
    "import re\nx = re.findall(r'\\d+', 'a1 b22 c333')",
    "x = sorted(range(1000), reverse=True)",
    "x = {str(i): i ** 2 for i in range(500)}",
    "x = 'warm' * 1000",
];

/// Inputs to a `prepare` run — all the caller-resolved identifiers the
/// core needs, nothing more (version resolution, Java detection, etc. are
/// the CLI's concern).
pub struct PrepareConfig {
    pub home: HomePaths,
    pub version: String,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub boot_args: String,
}

/// Run the snapshot critical path (§4.4). On any failure the partial
/// snapshot directory is removed so a half-built snapshot is never
/// observed as valid by [`vm0_paths::snapshot_valid`].
pub async fn prepare(config: &PrepareConfig) -> SnapshotResult<SnapshotMetadata> {
    let snap = config.home.snapshot(&config.version);
    tokio::fs::create_dir_all(snap.dir()).await?;

    let rootfs = config.home.rootfs(&config.version);
    if !tokio::fs::try_exists(&rootfs).await? {
        return Err(SnapshotError::RootfsMissing(rootfs));
    }

    // 1. Copy the pristine rootfs; the snapshot VM writes to this copy only.
    tokio::fs::copy(&rootfs, snap.disk()).await?;

    let api_sock = snap.dir().join("firecracker.sock");
    let vsock_path = snap.vsock();
    let _ = tokio::fs::remove_file(&api_sock).await;
    let _ = tokio::fs::remove_file(&vsock_path).await;

    let result = run_with_vmm(config, &snap, &api_sock, &vsock_path).await;
    let _ = tokio::fs::remove_file(&api_sock).await;

    match result {
        Ok(meta) => Ok(meta),
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(snap.dir()).await;
            Err(e)
        }
    }
}

async fn run_with_vmm(
    config: &PrepareConfig,
    snap: &vm0_paths::SnapshotPaths,
    api_sock: &std::path::Path,
    vsock_path: &std::path::Path,
) -> SnapshotResult<SnapshotMetadata> {
    let mut driver = HypervisorDriver::launch(&config.home.firecracker_bin(), api_sock).await?;

    // 2. Configure boot, root drive, vsock, balloon.
    tokio::try_join!(
        driver.configure_machine(config.vcpu_count, config.mem_size_mib),
        driver.configure_boot_source(&config.home.vmlinux(), &config.boot_args),
        driver.attach_drive("rootfs", &snap.disk(), false),
        driver.attach_vsock(vsock_path),
        driver.install_balloon(),
    )?;

    // 3. Start.
    driver.start().await?;

    // 4. Wait for the runner daemon; a successful handshake means both the
    // workload server and the runner's warm session are ready.
    vm0_vsock::wait_ready(vsock_path, RUNNER_PORT, RUNNER_READY_POLL, RUNNER_READY_TIMEOUT)
        .await
        .map_err(|_| SnapshotError::RunnerTimeout)?;
    tracing::info!("runner daemon ready");

    // 5. Warm the JIT through escalating executions over the same path.
    run_warmup(vsock_path).await?;
    tracing::info!(count = WARMUP_CODE.len(), "jit warmup complete");

    // 6. Inflate the balloon to reclaim everything but a working set.
    let inflate_target = config.mem_size_mib.saturating_sub(512);
    driver.update_balloon(inflate_target).await?;
    tokio::time::sleep(BALLOON_SETTLE).await;

    // 7. Deflate without re-committing the now-zero pages.
    driver.update_balloon(0).await?;
    tokio::time::sleep(BALLOON_DEFLATE_SETTLE).await;

    // 8. Pause, 9. snapshot.
    driver.pause().await?;
    driver.create_snapshot(&snap.memory(), &snap.vmstate()).await?;
    driver.stop().await?;

    // 10. Punch holes; non-fatal on failure.
    match tokio::task::spawn_blocking({
        let memory = snap.memory();
        move || punch_zero_chunks(&memory)
    })
    .await
    {
        Ok(Ok(chunks)) => tracing::info!(chunks, "punched zero chunks in snapshot memory"),
        Ok(Err(e)) => tracing::warn!(error = %e, "hole-punch failed; continuing with a dense memory file"),
        Err(e) => tracing::warn!(error = %e, "hole-punch task panicked; continuing with a dense memory file"),
    }

    // 11. Delete the stale listener; only the path embedded in vmstate matters.
    let _ = tokio::fs::remove_file(vsock_path).await;

    // 12. Write metadata.
    let mut meta = SnapshotMetadata::new(&config.version, RUNNER_PORT);
    meta.mem_size_mib = Some(config.mem_size_mib);
    meta.balloon_mib = Some(0);
    tokio::fs::write(snap.metadata(), serde_json::to_vec_pretty(&meta)?).await?;

    Ok(meta)
}

async fn run_warmup(vsock_path: &std::path::Path) -> SnapshotResult<()> {
    for (i, code) in WARMUP_CODE.iter().enumerate() {
        let request = ExecRequest {
            code: (*code).to_string(),
            show_tables: false,
            show_table_meta: false,
        };
        let response = vm0_vsock::exec(vsock_path, RUNNER_PORT, &request).await?;
        if let Some(err) = response.error {
            return Err(SnapshotError::WarmupFailed(i, err));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_code_is_nonempty_and_escalating_in_length() {
        assert_eq!(WARMUP_CODE.len(), 20);
        assert!(WARMUP_CODE.last().unwrap_or(&"").len() > WARMUP_CODE[1].len());
    }
}
