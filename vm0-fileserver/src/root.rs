use std::path::{Component, Path, PathBuf};

/// Clean `raw` (dropping any `RootDir`/`ParentDir`/`Prefix` components so it
/// cannot escape via a leading `/` or `..`), join it under `root`, then
/// re-validate that the result — once any existing ancestor is resolved
/// through its symlinks — still lives under `root`. Returns `None` on
/// escape; the caller maps that to the protocol's no-entry status.
pub fn safe_join(root: &Path, raw: &str) -> Option<PathBuf> {
    let mut joined = root.to_path_buf();
    for component in Path::new(raw).components() {
        if let Component::Normal(part) = component {
            joined.push(part);
        }
    }

    let canonical_root = std::fs::canonicalize(root).ok()?;
    resolve_within(&canonical_root, &joined)
}

/// Walk up from `candidate` to the nearest ancestor that actually exists,
/// canonicalize that ancestor, and confirm it sits under `canonical_root`.
/// A candidate that doesn't exist yet (e.g. a `stat` target) is still
/// considered safe as long as its real ancestors are.
fn resolve_within(canonical_root: &Path, candidate: &Path) -> Option<PathBuf> {
    if let Ok(resolved) = std::fs::canonicalize(candidate) {
        return resolved.starts_with(canonical_root).then_some(resolved);
    }

    let mut ancestor = candidate.parent()?;
    loop {
        match std::fs::canonicalize(ancestor) {
            Ok(resolved_ancestor) => {
                return resolved_ancestor.starts_with(canonical_root).then(|| candidate.to_path_buf());
            }
            Err(_) => ancestor = ancestor.parent()?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn joins_a_plain_relative_path() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        fs::write(dir.path().join("a.txt"), b"hi").unwrap_or_else(|e| panic!("{e}"));
        let joined = safe_join(dir.path(), "a.txt").unwrap_or_else(|| panic!("expected Some"));
        assert!(joined.ends_with("a.txt"));
    }

    #[test]
    fn strips_a_leading_slash_and_parent_components() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        fs::write(dir.path().join("a.txt"), b"hi").unwrap_or_else(|e| panic!("{e}"));
        let joined = safe_join(dir.path(), "/../../a.txt").unwrap_or_else(|| panic!("expected Some"));
        assert!(joined.starts_with(fs::canonicalize(dir.path()).unwrap_or_else(|e| panic!("{e}"))));
    }

    #[test]
    fn rejects_a_symlink_that_escapes_the_root() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let outside = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        fs::write(outside.path().join("secret"), b"nope").unwrap_or_else(|e| panic!("{e}"));
        #[cfg(unix)]
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap_or_else(|e| panic!("{e}"));

        let joined = safe_join(dir.path(), "escape/secret");
        assert!(joined.is_none());
    }

    #[test]
    fn allows_a_not_yet_existing_path_inside_the_root() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let joined = safe_join(dir.path(), "new-file.txt").unwrap_or_else(|| panic!("expected Some"));
        assert!(joined.ends_with("new-file.txt"));
    }
}
