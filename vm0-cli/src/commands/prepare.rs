use clap::Args;

use vm0_paths::HomePaths;
use vm0_snapshot::PrepareConfig;

use crate::config::Config;
use crate::error::CliResult;

#[derive(Args)]
pub struct PrepareArgs {
    /// Guest image version to build and snapshot.
    #[arg(long)]
    pub version: String,
    /// Override the configured vCPU count.
    #[arg(long)]
    pub vcpu: Option<u32>,
    /// Override the configured memory size, in MiB.
    #[arg(long = "memory-mb")]
    pub memory_mb: Option<u32>,
}

/// Image Builder then Snapshot Maker. Idempotent: a complete snapshot for
/// `version` short-circuits both steps.
pub async fn run(config: &Config, args: PrepareArgs) -> CliResult<()> {
    let home = HomePaths::new(&config.home);

    if vm0_paths::snapshot_valid(&home, &args.version).is_ok() {
        tracing::info!(version = %args.version, "snapshot already exists, nothing to do");
        return Ok(());
    }

    let vcpu = args.vcpu.unwrap_or(config.vm.vcpu);
    let mem_size_mib = args.memory_mb.unwrap_or(config.vm.memory_mb);

    let rootfs_path = home.rootfs(&args.version);
    if !tokio::fs::try_exists(&rootfs_path).await? {
        tokio::fs::create_dir_all(home.rootfs_dir()).await?;
        tracing::info!(version = %args.version, "building rootfs image");
        vm0_image::build(&vm0_image::BuildConfig {
            version: args.version.clone(),
            jre_dir: config.build.jre_dir.clone(),
            runtime_package_dir: config.build.runtime_package_dir.clone(),
            runner_daemon_path: config.build.runner_daemon_path.clone(),
            size_mib: config.vm.rootfs_size_mib,
            output_path: rootfs_path,
        })
        .await?;
    }

    tracing::info!(version = %args.version, vcpu, mem_size_mib, "building snapshot");
    let metadata = vm0_snapshot::prepare(&PrepareConfig {
        home,
        version: args.version.clone(),
        vcpu_count: vcpu,
        mem_size_mib,
        boot_args: config.vm.boot_args.clone(),
    })
    .await?;

    tracing::info!(version = %metadata.version, created_at = %metadata.created_at, "snapshot ready");
    Ok(())
}
