use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};

const DEFAULT_VCPU: u32 = 2;
const DEFAULT_MEMORY_MB: u32 = 2048;
const DEFAULT_ROOTFS_SIZE_MIB: u32 = 1024;
const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// `vm0.yaml`. Build inputs (`build`) have no sensible default and must be
/// set; VM shape (`vm`) and pool behavior (`pool`) fall back to the same
/// defaults the CLI flags use.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub home: PathBuf,
    pub build: BuildConfig,
    #[serde(default)]
    pub vm: VmConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub jre_dir: PathBuf,
    pub runtime_package_dir: PathBuf,
    pub runner_daemon_path: PathBuf,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub vcpu: u32,
    pub memory_mb: u32,
    pub rootfs_size_mib: u32,
    pub boot_args: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            vcpu: DEFAULT_VCPU,
            memory_mb: DEFAULT_MEMORY_MB,
            rootfs_size_mib: DEFAULT_ROOTFS_SIZE_MIB,
            boot_args: DEFAULT_BOOT_ARGS.to_string(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS }
    }
}

/// Load and validate `vm0.yaml`. Relative paths are resolved against the
/// config file's parent directory, matching how the build artifacts are
/// usually laid out next to it.
pub async fn load(path: &Path) -> CliResult<Config> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| CliError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: Config = serde_yaml_ng::from_str(&content).map_err(|e| CliError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    Ok(config)
}

impl Config {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.home);
        resolve(&mut self.build.jre_dir);
        resolve(&mut self.build.runtime_package_dir);
        resolve(&mut self.build.runner_daemon_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_resolves_relative_paths_against_config_dir() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        tokio::fs::create_dir_all(dir.path().join("artifacts")).await.unwrap_or_else(|e| panic!("mkdir: {e}"));

        let yaml = r#"
home: vm0home
build:
  jre_dir: artifacts/jre
  runtime_package_dir: artifacts/runtime
  runner_daemon_path: artifacts/runnerd
"#;
        let config_path = dir.path().join("vm0.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap_or_else(|e| panic!("write: {e}"));

        let config = load(&config_path).await.unwrap_or_else(|e| panic!("load: {e}"));
        assert_eq!(config.home, dir.path().join("vm0home"));
        assert_eq!(config.build.jre_dir, dir.path().join("artifacts/jre"));
        assert_eq!(config.vm.vcpu, DEFAULT_VCPU);
        assert_eq!(config.pool.idle_timeout_secs, DEFAULT_IDLE_TIMEOUT_SECS);
    }

    #[tokio::test]
    async fn load_honors_explicit_vm_and_pool_overrides() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let yaml = r#"
home: /srv/vm0
build:
  jre_dir: /opt/jre
  runtime_package_dir: /opt/runtime
  runner_daemon_path: /opt/runnerd
vm:
  vcpu: 4
  memory_mb: 4096
  rootfs_size_mib: 2048
  boot_args: "console=ttyS0"
pool:
  idle_timeout_secs: 60
"#;
        let config_path = dir.path().join("vm0.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap_or_else(|e| panic!("write: {e}"));

        let config = load(&config_path).await.unwrap_or_else(|e| panic!("load: {e}"));
        assert_eq!(config.vm.vcpu, 4);
        assert_eq!(config.pool.idle_timeout_secs, 60);
    }
}
