use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use vm0_paths::HomePaths;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Verify the host can actually run a restore before any VM work starts
/// (§7 "missing prerequisite" — surface before any VM work, never retry).
///
/// Collects every failure into one error so a caller sees the whole picture
/// in a single pass rather than one missing thing at a time.
pub fn check_prerequisites(home: &HomePaths) -> OrchestratorResult<()> {
    let mut errors = Vec::new();

    check_file_exists(&home.firecracker_bin(), "firecracker binary", &mut errors);
    check_executable(&home.firecracker_bin(), "firecracker binary", &mut errors);
    check_file_exists(&home.vmlinux(), "kernel image", &mut errors);
    check_kvm(&mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(OrchestratorError::Prerequisites(errors.join("; ")))
    }
}

fn check_file_exists(path: &Path, label: &str, errors: &mut Vec<String>) {
    if !path.exists() {
        errors.push(format!("{label} not found: {}", path.display()));
    }
}

fn check_executable(path: &Path, label: &str, errors: &mut Vec<String>) {
    if let Ok(meta) = path.metadata()
        && meta.permissions().mode() & 0o111 == 0
    {
        errors.push(format!("{label} is not executable: {}", path.display()));
    }
}

fn check_kvm(errors: &mut Vec<String>) {
    let kvm = Path::new("/dev/kvm");
    if !kvm.exists() {
        errors.push("/dev/kvm not found (KVM not available)".to_string());
    } else if let Err(e) = std::fs::File::options().read(true).write(true).open(kvm) {
        errors.push(format!("/dev/kvm not accessible: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_missing_firecracker_binary_and_kernel_together() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let home = HomePaths::new(dir.path());
        let err = check_prerequisites(&home).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("firecracker binary"));
        assert!(message.contains("kernel image"));
    }
}
