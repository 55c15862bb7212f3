//! Canonical path layout for the vm0 home directory.
//!
//! All paths are pure functions of `(home, version, instance-id)` — no I/O
//! happens here beyond the `stat` calls in [`snapshot_valid`] and
//! [`list_complete_snapshots`].

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathsError {
    #[error("snapshot for version {version:?} is missing {piece}")]
    MissingPiece { version: String, piece: &'static str },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PathsResult<T> = Result<T, PathsError>;

/// Top-level paths under the home directory (`<home>/vm/...`).
#[derive(Clone)]
pub struct HomePaths {
    vm_dir: PathBuf,
}

impl HomePaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            vm_dir: home.into().join("vm"),
        }
    }

    pub fn vm_dir(&self) -> &Path {
        &self.vm_dir
    }

    pub fn firecracker_bin(&self) -> PathBuf {
        self.vm_dir.join("firecracker")
    }

    pub fn vmlinux(&self) -> PathBuf {
        self.vm_dir.join("vmlinux")
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.vm_dir.join("rootfs")
    }

    pub fn rootfs(&self, version: &str) -> PathBuf {
        self.rootfs_dir().join(format!("{version}.ext4"))
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.vm_dir.join("snapshots")
    }

    pub fn snapshot(&self, version: &str) -> SnapshotPaths {
        SnapshotPaths::new(self.snapshots_dir().join(version))
    }

    pub fn run_dir(&self) -> PathBuf {
        self.vm_dir.join("run")
    }

    pub fn instance(&self, instance_id: &str) -> InstancePaths {
        InstancePaths::new(self.run_dir().join(instance_id))
    }
}

/// Paths for a single version's snapshot directory
/// (`vm/snapshots/<version>/`).
#[derive(Clone)]
pub struct SnapshotPaths {
    dir: PathBuf,
}

impl SnapshotPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> PathBuf {
        self.dir.join("metadata.json")
    }

    pub fn disk(&self) -> PathBuf {
        self.dir.join("disk.ext4")
    }

    pub fn memory(&self) -> PathBuf {
        self.dir.join("snapshot_mem")
    }

    pub fn vmstate(&self) -> PathBuf {
        self.dir.join("snapshot_vmstate")
    }

    /// The vsock UDS path embedded in `snapshot_vmstate`. Immutable once the
    /// snapshot is created — restores must bind at this exact path.
    pub fn vsock(&self) -> PathBuf {
        self.dir.join("vsock.sock")
    }

    /// The four files that make a snapshot "complete". Order matches
    /// `metadata.json`, `disk.ext4`, `snapshot_mem`, `snapshot_vmstate`.
    fn required_files(&self) -> [(PathBuf, &'static str); 4] {
        [
            (self.metadata(), "metadata.json"),
            (self.disk(), "disk.ext4"),
            (self.memory(), "snapshot_mem"),
            (self.vmstate(), "snapshot_vmstate"),
        ]
    }
}

/// Per-instance runtime paths (`vm/run/<instance-id>/`).
#[derive(Clone)]
pub struct InstancePaths {
    dir: PathBuf,
}

impl InstancePaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn firecracker_sock(&self) -> PathBuf {
        self.dir.join("firecracker.sock")
    }

    pub fn uffd_sock(&self) -> PathBuf {
        self.dir.join("uffd.sock")
    }

    /// The per-instance rename of the vsock UDS. Valid for host→guest dials
    /// only — guest→host listener paths must use the snapshot's original
    /// embedded path instead (see [`SnapshotPaths::vsock`]).
    pub fn vsock_sock(&self) -> PathBuf {
        self.dir.join("vsock.sock")
    }

    pub fn info(&self) -> PathBuf {
        self.dir.join("instance.json")
    }
}

/// Verify a snapshot directory contains all four required artifacts.
/// Partial snapshots must never be consumed.
pub fn snapshot_valid(home: &HomePaths, version: &str) -> PathsResult<()> {
    let snap = home.snapshot(version);
    for (path, name) in snap.required_files() {
        if !path.try_exists()? {
            return Err(PathsError::MissingPiece {
                version: version.to_string(),
                piece: name,
            });
        }
    }
    Ok(())
}

/// List versions whose snapshot directory exists and has a `metadata.json`.
/// Used by `prepare`'s idempotence check and by `clean`.
pub fn list_complete_snapshots(home: &HomePaths) -> PathsResult<Vec<String>> {
    let dir = home.snapshots_dir();
    if !dir.try_exists()? {
        return Ok(Vec::new());
    }
    let mut versions = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if SnapshotPaths::new(entry.path()).metadata().try_exists()? {
            versions.push(name);
        }
    }
    versions.sort();
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_paths_join_correctly() {
        let home = HomePaths::new("/srv/vm0home");
        assert_eq!(
            home.firecracker_bin(),
            PathBuf::from("/srv/vm0home/vm/firecracker")
        );
        assert_eq!(home.rootfs("1.2.3"), PathBuf::from("/srv/vm0home/vm/rootfs/1.2.3.ext4"));

        let snap = home.snapshot("1.2.3");
        assert_eq!(
            snap.metadata(),
            PathBuf::from("/srv/vm0home/vm/snapshots/1.2.3/metadata.json")
        );
        assert_eq!(
            snap.vsock(),
            PathBuf::from("/srv/vm0home/vm/snapshots/1.2.3/vsock.sock")
        );
    }

    #[test]
    fn instance_paths_join_correctly() {
        let home = HomePaths::new("/srv/vm0home");
        let inst = home.instance("550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(
            inst.firecracker_sock(),
            PathBuf::from(
                "/srv/vm0home/vm/run/550e8400-e29b-41d4-a716-446655440000/firecracker.sock"
            )
        );
    }

    #[test]
    fn instance_socket_paths_fit_sun_path_limit() {
        // sun_path limit is 108 bytes including the NUL terminator, so the
        // usable maximum for the path string itself is 107 bytes.
        let home = HomePaths::new("/home/runner");
        let uuid = "550e8400-e29b-41d4-a716-446655440000";
        let inst = home.instance(uuid);

        for path in [inst.firecracker_sock(), inst.uffd_sock(), inst.vsock_sock()] {
            assert!(
                path.as_os_str().len() <= 107,
                "{} is {} bytes, exceeds sun_path limit",
                path.display(),
                path.as_os_str().len()
            );
        }
    }

    #[test]
    fn snapshot_valid_reports_missing_piece() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let home = HomePaths::new(dir.path());
        let err = snapshot_valid(&home, "missing").unwrap_err();
        assert!(matches!(err, PathsError::MissingPiece { .. }));
    }

    #[test]
    fn snapshot_valid_accepts_complete_directory() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let home = HomePaths::new(dir.path());
        let snap = home.snapshot("v1");
        std::fs::create_dir_all(snap.dir()).unwrap_or_else(|e| panic!("mkdir: {e}"));
        for path in [snap.metadata(), snap.disk(), snap.memory(), snap.vmstate()] {
            std::fs::write(&path, b"").unwrap_or_else(|e| panic!("write: {e}"));
        }
        assert!(snapshot_valid(&home, "v1").is_ok());
    }

    #[test]
    fn list_complete_snapshots_skips_partial_directories() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let home = HomePaths::new(dir.path());

        let complete = home.snapshot("complete");
        std::fs::create_dir_all(complete.dir()).unwrap_or_else(|e| panic!("mkdir: {e}"));
        std::fs::write(complete.metadata(), b"{}").unwrap_or_else(|e| panic!("write: {e}"));

        let partial = home.snapshot("partial");
        std::fs::create_dir_all(partial.dir()).unwrap_or_else(|e| panic!("mkdir: {e}"));

        let versions = list_complete_snapshots(&home).unwrap_or_else(|e| panic!("list: {e}"));
        assert_eq!(versions, vec!["complete".to_string()]);
    }

    #[test]
    fn list_complete_snapshots_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let home = HomePaths::new(dir.path());
        assert!(list_complete_snapshots(&home).unwrap_or_else(|e| panic!("list: {e}")).is_empty());
    }
}
