use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::command::{Privilege, exec};
use crate::error::{ImageError, ImageResult};
use crate::init_script;
use crate::prerequisites::check_prerequisites;

/// Inputs to a one-shot rootfs build. All paths are host paths to artifacts
/// this builder copies *into* the new image; they are not interpreted by
/// the image itself.
pub struct BuildConfig {
    pub version: String,
    pub jre_dir: PathBuf,
    pub runtime_package_dir: PathBuf,
    pub runner_daemon_path: PathBuf,
    pub size_mib: u32,
    pub output_path: PathBuf,
}

/// Build an ext4 rootfs image per [`BuildConfig`] and move it into place at
/// `output_path` only after every step, including unmount, has succeeded.
pub async fn build(config: &BuildConfig) -> ImageResult<()> {
    check_prerequisites()?;

    let work_dir = tempfile::tempdir()?;
    let image_path = work_dir.path().join("image.ext4");

    info!(version = %config.version, size_mib = config.size_mib, "allocating sparse rootfs image");
    allocate_sparse_file(&image_path, config.size_mib).await?;

    let size_arg = format!("{}M", config.size_mib);
    exec(
        "mkfs.ext4",
        &["-F", "-q", image_path.to_str().unwrap_or_default(), &size_arg],
        Privilege::User,
    )
    .await?;

    let mount_point = work_dir.path().join("mnt");
    tokio::fs::create_dir_all(&mount_point).await?;

    exec(
        "mount",
        &[
            "-o",
            "loop",
            image_path.to_str().unwrap_or_default(),
            mount_point.to_str().unwrap_or_default(),
        ],
        Privilege::Sudo,
    )
    .await?;

    let populate_result = populate(config, &mount_point).await;

    // Always attempt unmount, success or failure, so a half-mounted loop
    // device is never left behind.
    if let Err(e) = exec("umount", &[mount_point.to_str().unwrap_or_default()], Privilege::Sudo).await {
        warn!(error = %e, "failed to unmount build scratch directory");
    }

    populate_result?;

    if let Some(parent) = config.output_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(&image_path, &config.output_path).await?;

    info!(output = %config.output_path.display(), "rootfs build complete");
    Ok(())
}

async fn allocate_sparse_file(path: &Path, size_mib: u32) -> ImageResult<()> {
    let file = tokio::fs::File::create(path).await?;
    file.set_len(u64::from(size_mib) * 1024 * 1024).await?;
    Ok(())
}

async fn populate(config: &BuildConfig, mount_point: &Path) -> ImageResult<()> {
    copy_tree(&config.jre_dir, &mount_point.join("usr/lib/jvm")).await?;
    copy_tree(&config.runtime_package_dir, &mount_point.join("opt/runtime")).await?;

    let runner_dest = mount_point.join("usr/local/bin/vm0-runner");
    if let Some(parent) = runner_dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(&config.runner_daemon_path, &runner_dest).await?;
    set_executable(&runner_dest).await?;

    let script = init_script::render(
        "/usr/local/bin/vm0-runner",
        "/usr/lib/jvm/bin/java",
        "/opt/runtime/runtime.jar",
    );
    let init_dest = mount_point.join("sbin/vm0-init");
    if let Some(parent) = init_dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&init_dest, script).await?;
    set_executable(&init_dest).await?;

    Ok(())
}

async fn set_executable(path: &Path) -> ImageResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

async fn copy_tree(src: &Path, dst: &Path) -> ImageResult<()> {
    tokio::fs::create_dir_all(dst).await?;
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        let dest_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            Box::pin(copy_tree(&entry.path(), &dest_path)).await?;
        } else if file_type.is_file() {
            tokio::fs::copy(entry.path(), &dest_path).await?;
        }
    }
    Ok(())
}
