//! offsync CLI.
//!
//! Inspect and operate the offline write queue: show status, list and purge
//! pending records, push writes through the active backend, flush, move
//! records between machines, and run the sync daemon.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use offsync_core::backend::{Backend, BackendMode, WriteOp};
use offsync_core::config::{Config, LogFormat};
use offsync_core::error::{Error, StorageError, format_error_with_remediation};
use offsync_core::logging::{LogConfig, init_logging};
use offsync_core::queue::{PendingQueue, QueueConfig};
use offsync_core::retry::RetryPolicy;
use offsync_core::store::SqliteRecordStore;
use offsync_core::sync::{
    ConnectivityMonitor, SchedulerConfig, SyncController, SyncHandle, SyncScheduler, SyncTrigger,
};

type Queue = PendingQueue<SqliteRecordStore>;
type Controller = SyncController<SqliteRecordStore, Backend>;

#[derive(Parser)]
#[command(name = "offsync", version, about = "Offline-first durable write queue")]
#[command(
    after_help = "Environment:\n  OFFSYNC_CONFIG       Config file path\n  OFFSYNC_REMOTE_URL   Remote backend URL\n  OFFSYNC_REMOTE_KEY   Remote backend API key\n  OFFSYNC_DB_PATH      Queue database path\n  RUST_LOG             Log filter override"
)]
struct Cli {
    /// Config file (defaults to $OFFSYNC_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format override (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend mode and queue size
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List pending records, oldest first
    List {
        #[arg(long)]
        kind: Option<String>,
        /// Only records past the retry ceiling
        #[arg(long)]
        exhausted: bool,
        #[arg(long)]
        json: bool,
    },
    /// Apply a write through the active backend, queueing it if unreachable
    Write {
        #[arg(long)]
        kind: String,
        /// Write operation as JSON, e.g. '{"op":"create","entity":"tasks","data":{}}'
        #[arg(long)]
        op: String,
    },
    /// Replay pending records now
    Flush {
        #[arg(long)]
        kind: Option<String>,
    },
    /// Dump pending records as JSON Lines
    Export {
        #[arg(long)]
        kind: Option<String>,
        /// Output file (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Load records from a JSON Lines export
    Import { file: PathBuf },
    /// Remove a record, or every exhausted record
    Purge {
        #[arg(required_unless_present = "exhausted", conflicts_with = "exhausted")]
        id: Option<String>,
        #[arg(long)]
        exhausted: bool,
        #[arg(long, requires = "exhausted")]
        kind: Option<String>,
    },
    /// Run the sync daemon until interrupted
    Run,
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration with secrets redacted
    Show,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    mode: BackendMode,
    pending: usize,
    exhausted: usize,
    db_path: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn report_error(err: &anyhow::Error) {
    if let Some(core) = err.downcast_ref::<Error>() {
        eprintln!("{}", format_error_with_remediation(core));
    } else if let Some(storage) = err.downcast_ref::<StorageError>() {
        eprintln!(
            "{}",
            format_error_with_remediation(&Error::Storage(storage.clone()))
        );
    } else {
        eprintln!("Error: {err:#}");
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    let mut log_config = LogConfig::from_config(&config);
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    init_logging(&log_config)?;

    match cli.command {
        Commands::Status { json } => status(&config, json).await,
        Commands::List {
            kind,
            exhausted,
            json,
        } => list(&config, kind.as_deref(), exhausted, json).await,
        Commands::Write { kind, op } => write(&config, &kind, &op).await,
        Commands::Flush { kind } => flush(&config, kind.as_deref()).await,
        Commands::Export { kind, out } => export(&config, kind.as_deref(), out.as_deref()).await,
        Commands::Import { file } => import(&config, &file).await,
        Commands::Purge {
            id,
            exhausted,
            kind,
        } => purge(&config, id.as_deref(), exhausted, kind.as_deref()).await,
        Commands::Run => run_daemon(&config).await,
        Commands::Config {
            command: ConfigCommand::Show,
        } => show_config(&config),
    }
}

async fn open_queue(config: &Config) -> anyhow::Result<Queue> {
    let store =
        SqliteRecordStore::open_with_retry(config.db_path(), &RetryPolicy::store_open()).await?;
    Ok(PendingQueue::new(store, QueueConfig::from(config)))
}

async fn open_controller(config: &Config) -> anyhow::Result<Arc<Controller>> {
    let queue = Arc::new(open_queue(config).await?);
    let backend = Backend::from_config(config).await?;
    Ok(Arc::new(SyncController::new(queue, backend)))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn status(config: &Config, json: bool) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let report = StatusReport {
        mode: config.backend_mode(),
        pending: queue.pending_count().await.map_err(Error::from)?,
        exhausted: queue.exhausted(None).await.map_err(Error::from)?.len(),
        db_path: config.db_path(),
    };

    if json {
        return print_json(&report);
    }
    println!("mode:       {}", report.mode);
    println!("pending:    {}", report.pending);
    println!("exhausted:  {}", report.exhausted);
    println!("db path:    {}", report.db_path.display());
    Ok(())
}

async fn list(
    config: &Config,
    kind: Option<&str>,
    exhausted: bool,
    json: bool,
) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let records = if exhausted {
        queue.exhausted(kind).await
    } else {
        queue.list_unresolved(kind).await
    }
    .map_err(Error::from)?;

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No pending records");
        return Ok(());
    }
    let ceiling = queue.config().max_retries;
    for record in &records {
        let marker = if record.is_exhausted(ceiling) {
            "  (exhausted)"
        } else {
            ""
        };
        println!(
            "{}  {}  retries={}  {}{marker}",
            record.id,
            record.kind,
            record.retries,
            record.created_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn write(config: &Config, kind: &str, op: &str) -> anyhow::Result<()> {
    let op: WriteOp = serde_json::from_str(op).context("--op is not a valid write operation")?;
    let controller = open_controller(config).await?;
    let outcome = controller.write(kind, op).await.map_err(Error::from)?;
    print_json(&outcome)
}

async fn flush(config: &Config, kind: Option<&str>) -> anyhow::Result<()> {
    let controller = open_controller(config).await?;
    let report = match kind {
        Some(kind) => controller.drain_kind(kind).await,
        None => controller.flush_now().await,
    }
    .map_err(Error::from)?;
    print_json(&report)
}

async fn export(config: &Config, kind: Option<&str>, out: Option<&Path>) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let written = match out {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            let written = queue.export_jsonl(BufWriter::new(file), kind).await?;
            eprintln!("Exported {written} records to {}", path.display());
            written
        }
        None => {
            queue
                .export_jsonl(BufWriter::new(std::io::stdout()), kind)
                .await?
        }
    };
    info!(written, kind = ?kind, "Export finished");
    Ok(())
}

async fn import(config: &Config, file: &Path) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    let reader = BufReader::new(
        File::open(file).with_context(|| format!("cannot open {}", file.display()))?,
    );
    let report = queue.import_jsonl(reader).await?;
    print_json(&report)
}

async fn purge(
    config: &Config,
    id: Option<&str>,
    exhausted: bool,
    kind: Option<&str>,
) -> anyhow::Result<()> {
    let queue = open_queue(config).await?;
    if exhausted {
        let removed = queue.purge_exhausted(kind).await.map_err(Error::from)?;
        println!("Purged {removed} exhausted records");
        return Ok(());
    }
    let Some(id) = id else {
        bail!("purge needs a record id or --exhausted");
    };
    if !queue.purge(id).await.map_err(Error::from)? {
        bail!("no pending record with id {id}");
    }
    println!("Purged {id}");
    Ok(())
}

async fn run_daemon(config: &Config) -> anyhow::Result<()> {
    let controller = open_controller(config).await?;
    let scheduler = SyncScheduler::new(
        Arc::clone(&controller),
        SchedulerConfig::from(&config.sync),
    );
    let handle = scheduler.handle();
    let monitor = ConnectivityMonitor::new(
        Arc::clone(&controller),
        handle.clone(),
        Duration::from_secs(config.sync.connectivity_probe_secs.max(1)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx));
    info!(
        mode = %controller.mode(),
        db_path = %config.db_path().display(),
        "Sync daemon running"
    );

    wait_for_shutdown(&handle).await?;
    let _ = shutdown_tx.send(true);

    let stats = scheduler_task.await.context("scheduler task failed")?;
    monitor_task.await.context("connectivity monitor task failed")?;
    print_json(&stats)
}

/// Block until Ctrl-C or SIGTERM. SIGHUP requests a drain instead.
#[cfg(unix)]
async fn wait_for_shutdown(handle: &SyncHandle) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Interrupt received, shutting down");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down");
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, requesting drain");
                handle.trigger(SyncTrigger::ConnectivityRestored);
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_handle: &SyncHandle) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    Ok(())
}

fn show_config(config: &Config) -> anyhow::Result<()> {
    let mut redacted = config.clone();
    if let Some(key) = redacted.remote.api_key.as_mut() {
        *key = "<redacted>".to_string();
    }
    print!("{}", redacted.to_toml()?);
    println!("# effective backend: {}", config.backend_mode());
    Ok(())
}
