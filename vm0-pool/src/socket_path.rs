use std::path::PathBuf;

/// Per-user local socket path. One daemon (and hence one pooled version) per
/// user at a time — matches the single PID-file lock in [`crate::lock`].
pub fn default_socket_path() -> PathBuf {
    let uid = nix::unistd::Uid::current();
    std::env::temp_dir().join(format!("vm0-pool-{uid}.sock"))
}

pub fn pid_file_path(socket_path: &std::path::Path) -> PathBuf {
    socket_path.with_extension("pid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_is_namespaced_by_uid() {
        let path = default_socket_path();
        let uid = nix::unistd::Uid::current();
        assert!(path.to_string_lossy().contains(&uid.to_string()));
    }

    #[test]
    fn pid_file_sits_next_to_the_socket() {
        let socket = PathBuf::from("/tmp/vm0-pool-1000.sock");
        assert_eq!(pid_file_path(&socket), PathBuf::from("/tmp/vm0-pool-1000.pid"));
    }
}
