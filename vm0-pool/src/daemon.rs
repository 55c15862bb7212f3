use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

use vm0_orchestrator::{ExecRequestArgs, ReadyInstance};
use vm0_paths::HomePaths;

use crate::error::PoolResult;
use crate::protocol::{PoolRequest, PoolResponse, StatusRecord};
use crate::socket_path::pid_file_path;

const BACKFILL_POLL: Duration = Duration::from_millis(100);
const BACKFILL_BACKOFF: Duration = Duration::from_millis(500);
const IDLE_TICK: Duration = Duration::from_secs(10);
const HEADROOM: usize = 2;

struct Channel {
    tx: mpsc::Sender<ReadyInstance>,
    rx: mpsc::Receiver<ReadyInstance>,
}

impl Channel {
    fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self { tx, rx }
    }

    fn ready_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

struct Shared {
    home: HomePaths,
    version: String,
    target_size: Mutex<usize>,
    channel: Mutex<Channel>,
    last_request: Mutex<Instant>,
    idle_timeout: Duration,
    pid: u32,
}

/// A long-lived pool of pre-restored VMs of one version, serving exec
/// requests over a local socket with near-zero startup.
pub struct PoolDaemon {
    shared: std::sync::Arc<Shared>,
    socket_path: PathBuf,
}

impl PoolDaemon {
    pub fn new(home: HomePaths, version: String, target_size: usize, idle_timeout: Duration, socket_path: PathBuf) -> Self {
        let shared = Shared {
            home,
            version,
            target_size: Mutex::new(target_size),
            channel: Mutex::new(Channel::with_capacity(target_size + HEADROOM)),
            last_request: Mutex::new(Instant::now()),
            idle_timeout,
            pid: std::process::id(),
        };
        Self { shared: std::sync::Arc::new(shared), socket_path }
    }

    /// Runs until idle shutdown, a `stop` request, or a fatal signal. Removes
    /// a stale socket left behind by a crashed prior daemon before binding.
    pub async fn run(self) -> PoolResult<()> {
        if self.socket_path.try_exists()? {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        let listener = UnixListener::bind(&self.socket_path)?;

        let (done_tx, done_rx) = watch::channel(false);

        let backfill = tokio::spawn(backfill_loop(self.shared.clone(), done_rx.clone()));
        let idle_watcher = tokio::spawn(idle_loop(self.shared.clone(), done_tx.clone(), done_rx.clone()));
        let accept = tokio::spawn(accept_loop(listener, self.shared.clone(), done_tx.clone(), done_rx.clone()));

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = done_rx.clone().wait_for(|done| *done) => {}
        }
        let _ = done_tx.send(true);

        let _ = accept.await;
        let _ = backfill.await;
        let _ = idle_watcher.await;

        drain_and_destroy_all(&self.shared).await;
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(pid_file_path(&self.socket_path));
        Ok(())
    }
}

async fn backfill_loop(shared: std::sync::Arc<Shared>, mut done: watch::Receiver<bool>) {
    loop {
        if *done.borrow() {
            return;
        }

        let target = *shared.target_size.lock().unwrap_or_else(|e| e.into_inner());
        let available_permit = {
            let channel = shared.channel.lock().unwrap_or_else(|e| e.into_inner());
            target > 0 && channel.tx.capacity() > 0
        };

        if !available_permit {
            wait_or_done(BACKFILL_POLL, &mut done).await;
            continue;
        }

        match ReadyInstance::restore(&shared.home, &shared.version).await {
            Ok(ready) => {
                let tx = shared.channel.lock().unwrap_or_else(|e| e.into_inner()).tx.clone();
                if let Err(mpsc::error::TrySendError::Full(ready) | mpsc::error::TrySendError::Closed(ready)) =
                    tx.try_send(ready)
                {
                    ready.destroy().await;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "backfill restore failed, backing off");
                wait_or_done(BACKFILL_BACKOFF, &mut done).await;
            }
        }
    }
}

async fn wait_or_done(d: Duration, done: &mut watch::Receiver<bool>) {
    tokio::select! {
        () = tokio::time::sleep(d) => {}
        _ = done.changed() => {}
    }
}

async fn idle_loop(shared: std::sync::Arc<Shared>, done_tx: watch::Sender<bool>, mut done: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(IDLE_TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = done.changed() => return,
        }
        let idle_for = {
            let last = *shared.last_request.lock().unwrap_or_else(|e| e.into_inner());
            last.elapsed()
        };
        if idle_for > shared.idle_timeout {
            tracing::info!(idle_seconds = idle_for.as_secs(), "pool idle timeout, shutting down");
            let _ = done_tx.send(true);
            return;
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    shared: std::sync::Arc<Shared>,
    done_tx: watch::Sender<bool>,
    mut done: watch::Receiver<bool>,
) {
    loop {
        let stream = tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = done.changed() => return,
        };

        let shared = shared.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &shared, &done_tx).await {
                tracing::warn!(error = %e, "pool connection failed");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, shared: &std::sync::Arc<Shared>, done_tx: &watch::Sender<bool>) -> PoolResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(line) = lines.next_line().await? else {
        return Ok(());
    };
    let request: PoolRequest = serde_json::from_str(&line)?;

    let response = match request {
        PoolRequest::Exec { code, cwd, show_tables, show_table_meta } => {
            handle_exec(shared, code, cwd, show_tables, show_table_meta).await
        }
        PoolRequest::Status => handle_status(shared),
        PoolRequest::Scale { target_size } => {
            handle_scale(shared, target_size).await;
            PoolResponse::Ok
        }
        PoolRequest::Stop => {
            let _ = done_tx.send(true);
            PoolResponse::Ok
        }
    };

    let mut line = serde_json::to_string(&response)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn handle_exec(shared: &std::sync::Arc<Shared>, code: String, cwd: PathBuf, show_tables: bool, show_table_meta: bool) -> PoolResponse {
    *shared.last_request.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();

    let dequeued = {
        let mut channel = shared.channel.lock().unwrap_or_else(|e| e.into_inner());
        channel.rx.try_recv().ok()
    };
    let Some(mut ready) = dequeued else {
        return PoolResponse::Error { message: "no warm VMs".to_string() };
    };

    let version = ready.version().to_string();
    let exec_args = ExecRequestArgs { code, show_tables, show_table_meta, cwd, timeout: Duration::ZERO };
    let outcome = ready.exec(&exec_args).await;
    ready.destroy().await;

    match outcome {
        Ok(outcome) => PoolResponse::ExecResult { version, exit_code: outcome.exit_code, stdout: outcome.stdout, stderr: outcome.stderr },
        Err(e) => PoolResponse::Error { message: e.to_string() },
    }
}

fn handle_status(shared: &std::sync::Arc<Shared>) -> PoolResponse {
    let ready = shared.channel.lock().unwrap_or_else(|e| e.into_inner()).ready_len();
    let target_size = *shared.target_size.lock().unwrap_or_else(|e| e.into_inner());
    let idle_seconds = shared.last_request.lock().unwrap_or_else(|e| e.into_inner()).elapsed().as_secs();

    PoolResponse::Status(StatusRecord {
        running: true,
        pid: shared.pid,
        version: shared.version.clone(),
        ready,
        target_size,
        idle_seconds,
        idle_timeout_seconds: shared.idle_timeout.as_secs(),
    })
}

/// Resize the ready channel to `new_target + headroom`. Shrinking destroys
/// whatever no longer fits immediately, per §4.9's "scale down drains excess
/// slots immediately" rule; growing just gives the backfill loop more room.
async fn handle_scale(shared: &std::sync::Arc<Shared>, new_target: usize) {
    *shared.target_size.lock().unwrap_or_else(|e| e.into_inner()) = new_target;

    let drained = {
        let mut channel = shared.channel.lock().unwrap_or_else(|e| e.into_inner());
        let mut drained = Vec::new();
        while let Ok(ready) = channel.rx.try_recv() {
            drained.push(ready);
        }
        *channel = Channel::with_capacity(new_target + HEADROOM);
        drained
    };

    let new_tx = shared.channel.lock().unwrap_or_else(|e| e.into_inner()).tx.clone();
    for ready in drained {
        if let Err(mpsc::error::TrySendError::Full(ready) | mpsc::error::TrySendError::Closed(ready)) = new_tx.try_send(ready) {
            ready.destroy().await;
        }
    }
}

async fn drain_and_destroy_all(shared: &std::sync::Arc<Shared>) {
    let drained = {
        let mut channel = shared.channel.lock().unwrap_or_else(|e| e.into_inner());
        let mut drained = Vec::new();
        while let Ok(ready) = channel.rx.try_recv() {
            drained.push(ready);
        }
        drained
    };
    for ready in drained {
        ready.destroy().await;
    }
}
