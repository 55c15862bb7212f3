use std::os::unix::process::CommandExt;
use std::time::Duration;

use clap::{Args, Subcommand};

use vm0_paths::HomePaths;
use vm0_pool::{PoolDaemon, PoolRequest, PoolResponse};

use crate::config::Config;
use crate::error::CliResult;

#[derive(Args)]
pub struct PoolArgs {
    #[command(subcommand)]
    pub command: PoolCommand,
}

#[derive(Subcommand)]
pub enum PoolCommand {
    /// Dial the daemon if one is already running; otherwise spawn it.
    Start {
        #[arg(long)]
        version: String,
        #[arg(long, default_value_t = 4)]
        target_size: usize,
        /// Run the daemon inline instead of spawning a detached process.
        /// Used internally when `vm0 run` auto-spawns a daemon.
        #[arg(long)]
        foreground: bool,
    },
    Stop,
    Status,
    Scale {
        target_size: usize,
    },
}

pub async fn run(config: &Config, args: PoolArgs) -> CliResult<()> {
    match args.command {
        PoolCommand::Start { version, target_size, foreground } => start(config, version, target_size, foreground).await,
        PoolCommand::Stop => {
            let response = vm0_pool::send_request(&PoolRequest::Stop).await?;
            print_response(response);
            Ok(())
        }
        PoolCommand::Status => {
            let response = vm0_pool::send_request(&PoolRequest::Status).await?;
            print_response(response);
            Ok(())
        }
        PoolCommand::Scale { target_size } => {
            let response = vm0_pool::send_request(&PoolRequest::Scale { target_size }).await?;
            print_response(response);
            Ok(())
        }
    }
}

async fn start(config: &Config, version: String, target_size: usize, foreground: bool) -> CliResult<()> {
    let home = HomePaths::new(&config.home);
    vm0_paths::snapshot_valid(&home, &version)?;

    if foreground {
        let socket_path = vm0_pool::default_socket_path();
        let _lock = vm0_pool::acquire_pid_lock(vm0_pool::pid_file_path(&socket_path)).await?;
        let idle_timeout = Duration::from_secs(config.pool.idle_timeout_secs);
        let daemon = PoolDaemon::new(home, version, target_size, idle_timeout, socket_path);
        daemon.run().await?;
        return Ok(());
    }

    if vm0_pool::send_request(&PoolRequest::Status).await.is_ok() {
        println!("pool daemon already running");
        return Ok(());
    }

    let current_exe = std::env::current_exe()?;
    let log_path = home.vm_dir().join("pool.log");
    let log_file = std::fs::File::options().create(true).append(true).open(&log_path)?;
    let log_file_err = log_file.try_clone()?;

    let mut command = std::process::Command::new(current_exe);
    command
        .arg("pool")
        .arg("start")
        .arg("--version")
        .arg(&version)
        .arg("--target-size")
        .arg(target_size.to_string())
        .arg("--foreground")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(log_file))
        .stderr(std::process::Stdio::from(log_file_err));

    // SAFETY: `setsid` is called alone in the forked child, before `exec`;
    // it touches only the child's own process state.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }
    command.spawn()?;
    println!("spawned pool daemon for version {version}, log at {}", log_path.display());
    Ok(())
}

fn print_response(response: PoolResponse) {
    match response {
        PoolResponse::Status(status) => println!(
            "running={} pid={} version={} ready={} target_size={} idle_seconds={} idle_timeout_seconds={}",
            status.running, status.pid, status.version, status.ready, status.target_size, status.idle_seconds, status.idle_timeout_seconds
        ),
        PoolResponse::Ok => println!("ok"),
        PoolResponse::Error { message } => println!("error: {message}"),
        PoolResponse::ExecResult { .. } => {}
    }
}
