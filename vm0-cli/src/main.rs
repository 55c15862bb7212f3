mod commands;
mod config;
mod error;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::FormatTime;

use commands::{clean, pool, prepare, run};
use error::CliResult;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "vm0", version)]
struct Cli {
    /// Path to `vm0.yaml`.
    #[arg(long, env = "VM0_CONFIG", default_value = "vm0.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a rootfs and snapshot for a version; skips work already done.
    Prepare(prepare::PrepareArgs),
    /// Run code against a restored VM, via the pool if one is warm.
    Run(run::RunArgs),
    /// Start, stop, inspect, or resize the pool daemon.
    Pool(pool::PoolArgs),
    /// Remove snapshot(s) and stale run directories.
    Clean(clean::CleanArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_timer(Elapsed(Instant::now())).init();

    if nix::unistd::getuid().is_root() {
        eprintln!("error: vm0 must not be run as root (it manipulates /dev/kvm and loop devices directly)");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> CliResult<ExitCode> {
    let config = config::load(&cli.config).await?;

    match cli.command {
        Command::Prepare(args) => {
            prepare::run(&config, args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => {
            let outcome = run::run(&config, args).await?;
            print!("{}", outcome.stdout);
            eprint!("{}", outcome.stderr);
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            Ok(ExitCode::from(outcome.exit_code.clamp(0, 255) as u8))
        }
        Command::Pool(args) => {
            pool::run(&config, args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Clean(args) => {
            clean::run(&config, args).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
