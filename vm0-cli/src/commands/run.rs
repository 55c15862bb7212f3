use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use tokio::io::AsyncReadExt;

use vm0_orchestrator::{ExecOutcome, RestoreRequest};
use vm0_paths::HomePaths;

use crate::error::CliResult;

#[derive(Args)]
pub struct RunArgs {
    /// Guest image version to run.
    #[arg(long)]
    pub version: String,
    /// Path to a file containing the code to run, or `-` for stdin.
    #[arg(long = "file", conflicts_with = "code_inline")]
    pub file: Option<String>,
    /// Code to run, given directly instead of via `--file`.
    #[arg(long = "code")]
    pub code_inline: Option<String>,
    /// Working directory the guest's file requests resolve against.
    #[arg(long, default_value = ".")]
    pub cwd: PathBuf,
    /// Caller timeout in seconds. 0 means unbounded.
    #[arg(long = "timeout-secs", default_value_t = 0)]
    pub timeout_secs: u64,
    #[arg(long)]
    pub show_tables: bool,
    #[arg(long)]
    pub show_table_meta: bool,
}

/// Pool Client first, falling through to the Restore Orchestrator.
pub async fn run(config: &crate::config::Config, args: RunArgs) -> CliResult<ExecOutcome> {
    let code = read_code(&args).await?;
    let cwd = std::fs::canonicalize(&args.cwd).unwrap_or(args.cwd.clone());
    let timeout = Duration::from_secs(args.timeout_secs);
    let home = HomePaths::new(&config.home);

    if let Some(outcome) = vm0_pool::try_pool_exec(&home, &args.version, &code, &cwd, args.show_tables, args.show_table_meta).await {
        return Ok(outcome);
    }

    let outcome = vm0_orchestrator::restore_and_exec(RestoreRequest {
        home,
        version: args.version,
        code,
        show_tables: args.show_tables,
        show_table_meta: args.show_table_meta,
        cwd,
        timeout,
    })
    .await?;
    Ok(outcome)
}

async fn read_code(args: &RunArgs) -> CliResult<String> {
    if let Some(code) = &args.code_inline {
        return Ok(code.clone());
    }
    match args.file.as_deref() {
        Some("-") | None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            Ok(buf)
        }
        Some(path) => Ok(tokio::fs::read_to_string(path).await?),
    }
}
