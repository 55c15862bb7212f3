use crate::error::ImageError;

/// Verify the tools this builder shells out to are present.
///
/// Collects all failures and returns them in a single error so a caller
/// gets the full picture in one pass rather than one tool at a time.
pub fn check_prerequisites() -> Result<(), ImageError> {
    let mut errors = Vec::new();

    for cmd in ["mkfs.ext4", "mount", "umount"] {
        if which::which(cmd).is_err() {
            errors.push(format!("required command not found: {cmd}"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ImageError::Prerequisites(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_all_missing_commands_together() {
        // Point PATH at an empty directory so `which` finds none of
        // mkfs.ext4/mount/umount, then drive the real aggregation loop.
        let empty_dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let original_path = std::env::var("PATH").unwrap_or_default();
        unsafe {
            std::env::set_var("PATH", empty_dir.path());
        }

        let result = check_prerequisites();

        unsafe {
            std::env::set_var("PATH", original_path);
        }

        let err = result.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("mkfs.ext4"));
        assert!(message.contains("mount"));
        assert!(message.contains("umount"));
    }
}
