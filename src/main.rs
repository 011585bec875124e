use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use driftsync::common::clock::{system_clock, Clock};
use driftsync::network::{
    ConnectivityProbe, PlatformSignal, SimulatedProbe, SimulatedRemote, SyncContext,
    SyncCoordinator, SyncEvent,
};
use driftsync::storage::{FileStore, Mutation, OfflineQueue, OperationKind, QueuedAction};
use driftsync::SyncConfig;

/// Log sink that rolls `path` over to `path.1 .. path.N` once it grows past
/// `max_size` bytes.
struct RotatingFile {
    path: String,
    max_size: u64,
    max_files: u32,
    file: File,
    current_size: u64,
}

impl RotatingFile {
    fn new(path: String, max_size: u64, max_files: u32) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            max_files,
            file,
            current_size,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        for i in (1..self.max_files).rev() {
            let src = format!("{}.{}", self.path, i);
            let dst = format!("{}.{}", self.path, i + 1);
            let _ = std::fs::rename(&src, &dst);
        }
        let _ = std::fs::rename(&self.path, format!("{}.1", self.path));

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.current_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn init_logging() {
    // DRIFTSYNC_LOG_FILE writes plain env_logger lines to a rotating file.
    if let Ok(path) = std::env::var("DRIFTSYNC_LOG_FILE") {
        let max_size_mb: u64 = env_or("DRIFTSYNC_LOG_MAX_SIZE_MB", 10);
        let max_files: u32 = env_or("DRIFTSYNC_LOG_MAX_FILES", 3);

        match RotatingFile::new(path.clone(), max_size_mb * 1024 * 1024, max_files) {
            Ok(rot) => {
                let mut builder = env_logger::Builder::from_env(
                    env_logger::Env::default().default_filter_or("info"),
                );
                builder.target(env_logger::Target::Pipe(Box::new(rot)));
                if builder.try_init().is_ok() {
                    return;
                }
            }
            Err(e) => eprintln!("Cannot open log file {path}: {e}"),
        }
    }

    // Otherwise `log` records are bridged into tracing and formatted to stderr.
    let _ = LogTracer::init();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

#[derive(Parser)]
#[command(name = "driftsync")]
#[command(about = "Offline-tolerant write synchronization engine")]
struct Cli {
    /// Directory holding the persisted offline queue
    #[arg(short, long, default_value = "data", global = true)]
    data_dir: PathBuf,

    /// JSON config file; defaults apply to missing fields
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the queue and rate-limit status as JSON
    Status,

    /// Inspect or edit the persisted offline queue
    Queue {
        #[command(subcommand)]
        cmd: QueueCmd,
    },

    /// Run writes against a simulated remote through an offline period
    Simulate {
        /// Probability that a remote call fails transiently
        #[arg(long, default_value_t = 0.2)]
        failure_rate: f64,

        /// Number of writes to issue
        #[arg(long, default_value_t = 20)]
        actions: usize,

        /// How long the connection stays down at the start
        #[arg(long, default_value_t = 2_000)]
        offline_ms: u64,
    },
}

#[derive(Subcommand)]
enum QueueCmd {
    /// List queued actions, oldest first
    List,
    /// Queue a write without contacting the remote
    Push {
        /// Target table, e.g. profiles
        #[arg(short, long)]
        table: String,
        /// insert, update, delete or upsert
        #[arg(short, long)]
        operation: OperationKind,
        /// Row payload as a JSON object
        #[arg(long)]
        data: String,
    },
    /// Discard every queued action
    Clear,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(SyncConfig::default()),
    }
}

async fn open_queue(data_dir: &Path, config: &SyncConfig) -> anyhow::Result<OfflineQueue> {
    let store = FileStore::new(data_dir)
        .with_context(|| format!("opening data directory {}", data_dir.display()))?;
    Ok(OfflineQueue::open(Arc::new(store), config).await)
}

async fn run_queue_cmd(cmd: QueueCmd, queue: OfflineQueue) -> anyhow::Result<()> {
    match cmd {
        QueueCmd::List => {
            let pending = queue.pending().await;
            if pending.is_empty() {
                println!("Queue is empty");
            }
            for action in pending {
                println!("{}", serde_json::to_string(&action)?);
            }
        }
        QueueCmd::Push {
            table,
            operation,
            data,
        } => {
            let data: Value = serde_json::from_str(&data).context("parsing --data")?;
            let mutation = Mutation::from_parts(operation, data)?;
            let action = QueuedAction::new(table, mutation, system_clock().now_ms());
            let id = action.id.clone();
            if let Some(dropped) = queue.enqueue(action).await? {
                warn!("Dropped oldest action {} to make room", dropped.action.id);
            }
            println!("Queued {id} ({} pending)", queue.len());
        }
        QueueCmd::Clear => {
            let removed = queue.clear().await?;
            println!("Removed {removed} queued actions");
        }
    }
    Ok(())
}

async fn simulate(
    config: SyncConfig,
    data_dir: &Path,
    failure_rate: f64,
    actions: usize,
    offline_ms: u64,
) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&failure_rate) {
        bail!("--failure-rate must be between 0 and 1");
    }

    let store = Arc::new(FileStore::new(data_dir)?);
    let ctx = SyncContext::new(config, system_clock(), store, false).await;
    let remote = Arc::new(
        SimulatedRemote::new()
            .with_failure_rate(failure_rate)
            .with_latency(Duration::from_millis(20)),
    );
    let coordinator = SyncCoordinator::new(ctx, remote.clone());
    let mut events = coordinator.subscribe_events();
    let probe = Arc::new(SimulatedProbe::new(false));
    let probe_handle: Arc<dyn ConnectivityProbe> = probe.clone();
    coordinator.start(Some(probe_handle));

    info!("Connection down for {offline_ms}ms, issuing {actions} writes");
    for i in 0..actions {
        let data = json!({"id": format!("p{i}"), "bio": format!("bio #{i}")});
        let mutation = Mutation::from_parts(OperationKind::Upsert, data)?;
        let outcome = coordinator.smart_sync("profiles", mutation).await?;
        info!("Write {i}: {outcome:?}");
    }

    tokio::time::sleep(Duration::from_millis(offline_ms)).await;
    probe.set_reachable(true);
    coordinator
        .monitor()
        .handle_platform_signal(PlatformSignal::Online);

    // Wait for the reconnect drain, bounded so a stuck remote cannot hang us.
    let waited = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::DrainFinished(report)) if report.remaining == 0 => break,
                Ok(SyncEvent::DrainFinished(report)) => {
                    info!("{} actions still pending, waiting for next pass", report.remaining)
                }
                Ok(SyncEvent::Dropped(dropped)) => {
                    warn!("Dropped {}: {:?}", dropped.action.id, dropped.reason)
                }
                Ok(event) => info!("Event: {event:?}"),
                Err(RecvError::Lagged(n)) => warn!("Missed {n} sync events"),
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;
    if waited.is_err() {
        warn!("Timed out waiting for the queue to drain");
    }

    coordinator.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&coordinator.status())?);
    println!(
        "Remote calls: {}, rows in profiles: {}",
        remote.calls(),
        remote.row_count("profiles")
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Status => {
            let queue = open_queue(&cli.data_dir, &config).await?;
            let pending = queue.pending().await;
            let status = json!({
                "queue_length": pending.len(),
                "oldest": pending.first().map(|a| a.timestamp),
                "pending": pending,
                "max_queue_len": config.max_queue_len,
                "rate_limit": {
                    "window_ms": config.rate_limit_window_ms,
                    "max_requests": config.rate_limit_max_requests,
                },
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Queue { cmd } => {
            let queue = open_queue(&cli.data_dir, &config).await?;
            run_queue_cmd(cmd, queue).await?;
        }
        Command::Simulate {
            failure_rate,
            actions,
            offline_ms,
        } => simulate(config, &cli.data_dir, failure_rate, actions, offline_ms).await?,
    }

    Ok(())
}
