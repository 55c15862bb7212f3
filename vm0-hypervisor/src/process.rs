//! Process-tree teardown helpers.
//!
//! Mirrors the reference driver's `killpg(SIGKILL)` discipline: a child
//! spawned with `process_group(0)` has its PGID equal to its PID, so killing
//! the group reaps any subprocesses Firecracker itself forks (jailer, none
//! here, but the pattern is cheap and correct either way).

/// Kill the entire process group of `child` via `killpg(SIGKILL)`.
///
/// No-op if the child has already exited or the PID cannot be represented
/// as `i32`.
pub(crate) fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        let pgid = nix::unistd::Pid::from_raw(pid);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}
