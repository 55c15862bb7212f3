use vm0_paths::HomePaths;

use crate::info::InstanceInfo;

/// Remove entries under `run/` whose recorded PID is no longer alive
/// (§4.8 step 3, §7 "partial crash"). Best-effort: any I/O error on a
/// single entry just leaves it for the next sweep rather than aborting
/// the whole pass.
pub fn sweep_dead_run_dirs(home: &HomePaths) {
    let run_dir = home.run_dir();
    let Ok(entries) = std::fs::read_dir(&run_dir) else {
        return;
    };

    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else { continue };
        if !file_type.is_dir() {
            continue;
        }
        let Some(instance_id) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };

        let instance = home.instance(&instance_id);
        let info_path = instance.info();
        let is_dead = match std::fs::read(&info_path) {
            Ok(raw) => match serde_json::from_slice::<InstanceInfo>(&raw) {
                Ok(info) => !pid_is_alive(info.pid),
                Err(_) => true,
            },
            Err(_) => true,
        };

        if is_dead {
            tracing::info!(instance_id, "removing dead run directory");
            let _ = std::fs::remove_dir_all(instance.dir());
        }
    }
}

fn pid_is_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else { return false };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_a_run_dir_with_no_info_file() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let home = HomePaths::new(dir.path());
        let instance = home.instance("orphan");
        std::fs::create_dir_all(instance.dir()).unwrap_or_else(|e| panic!("{e}"));

        sweep_dead_run_dirs(&home);

        assert!(!instance.dir().exists());
    }

    #[test]
    fn removes_a_run_dir_whose_pid_is_dead() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let home = HomePaths::new(dir.path());
        let instance = home.instance("dead");
        std::fs::create_dir_all(instance.dir()).unwrap_or_else(|e| panic!("{e}"));
        let info = InstanceInfo {
            pid: 999_999_999, // far beyond any real PID on this host
            version: "v1".into(),
        };
        std::fs::write(instance.info(), serde_json::to_vec(&info).unwrap_or_else(|e| panic!("{e}")))
            .unwrap_or_else(|e| panic!("{e}"));

        sweep_dead_run_dirs(&home);

        assert!(!instance.dir().exists());
    }

    #[test]
    fn keeps_a_run_dir_whose_pid_is_alive() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let home = HomePaths::new(dir.path());
        let instance = home.instance("alive");
        std::fs::create_dir_all(instance.dir()).unwrap_or_else(|e| panic!("{e}"));
        let info = InstanceInfo {
            pid: std::process::id(),
            version: "v1".into(),
        };
        std::fs::write(instance.info(), serde_json::to_vec(&info).unwrap_or_else(|e| panic!("{e}")))
            .unwrap_or_else(|e| panic!("{e}"));

        sweep_dead_run_dirs(&home);

        assert!(instance.dir().exists());
    }
}
