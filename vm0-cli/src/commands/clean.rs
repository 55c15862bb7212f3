use clap::Args;

use vm0_paths::HomePaths;

use crate::config::Config;
use crate::error::CliResult;

#[derive(Args)]
pub struct CleanArgs {
    /// Remove only this version's snapshot. Without it, every snapshot and
    /// every stale `run/` entry is removed.
    #[arg(long)]
    pub version: Option<String>,
}

pub async fn run(config: &Config, args: CleanArgs) -> CliResult<()> {
    let home = HomePaths::new(&config.home);

    match args.version {
        Some(version) => {
            let dir = home.snapshot(&version).dir().to_path_buf();
            if tokio::fs::try_exists(&dir).await? {
                tokio::fs::remove_dir_all(&dir).await?;
                tracing::info!(version, "removed snapshot");
            }
        }
        None => {
            for version in vm0_paths::list_complete_snapshots(&home)? {
                let dir = home.snapshot(&version).dir().to_path_buf();
                tokio::fs::remove_dir_all(&dir).await?;
                tracing::info!(version, "removed snapshot");
            }
        }
    }

    vm0_orchestrator::sweep_dead_run_dirs(&home);
    Ok(())
}
