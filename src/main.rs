//! # TaskHub — in-process task queue and persistent scheduler
//!
//! Usage:
//!   taskhub run --workers 4                          # Start broker + scheduler + consumers
//!   taskhub add --name sync --task-type lidarr_sync --every 300
//!   taskhub add --name nightly --task-type cleanup_temp_files --cron "0 3 * * *"
//!   taskhub list --enabled-only
//!   taskhub pause <ID> | resume <ID> | delete <ID> | show <ID>
//!   taskhub records --status failed
//!   taskhub records --prune                          # Drop finished records past retention

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use taskhub_broker::Broker;
use taskhub_core::config::TaskHubConfig;
use taskhub_core::task::Params;
use taskhub_scheduler::{NewSchedule, ScheduleDefinition, Scheduler, TaskStatus};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "taskhub",
    version,
    about = "📬 TaskHub — in-process task queue and persistent scheduler"
)]
struct Cli {
    /// Path to the TOML config (default ~/.taskhub/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Scheduler database path (overrides the config)
    #[arg(long)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broker, the scheduler loop and N consumers until Ctrl-C.
    Run {
        #[arg(short, long, default_value = "2")]
        workers: usize,
    },

    /// Register a schedule. Exactly one of --every, --cron, --at.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        task_type: String,
        /// Run every N seconds
        #[arg(long, conflicts_with_all = ["cron", "at"])]
        every: Option<u64>,
        /// Five-field cron expression, evaluated in UTC
        #[arg(long, conflicts_with = "at")]
        cron: Option<String>,
        /// Run once at an RFC 3339 timestamp
        #[arg(long)]
        at: Option<String>,
        /// Task parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
        /// Stop after N runs (0 = unbounded)
        #[arg(long, default_value = "0")]
        max_runs: u32,
        #[arg(long)]
        description: Option<String>,
    },

    /// List schedules.
    List {
        #[arg(long)]
        enabled_only: bool,
    },

    /// Print one schedule as JSON.
    Show { id: String },

    Pause { id: String },

    Resume { id: String },

    Delete { id: String },

    /// List task ledger records.
    Records {
        /// pending, processing, completed or failed
        #[arg(long)]
        status: Option<String>,
        /// Delete completed and failed records older than `record_retention_days` first
        #[arg(long)]
        prune: bool,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "taskhub=debug,taskhub_core=debug,taskhub_broker=debug,taskhub_scheduler=debug"
    } else {
        "taskhub=info,taskhub_core=info,taskhub_broker=info,taskhub_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => TaskHubConfig::load_from(&expand_path(path))?,
        None => TaskHubConfig::load()?,
    };
    if let Some(db) = cli.db {
        config.scheduler.db_path = db;
    }

    let broker = Arc::new(Broker::new(&config.broker));
    let scheduler = Scheduler::open(&config.scheduler, Arc::clone(&broker))
        .with_context(|| format!("opening {}", config.scheduler.resolved_db_path().display()))?;

    match cli.command {
        Command::Run { workers } => run(scheduler, broker, workers).await,
        Command::Add {
            name,
            task_type,
            every,
            cron,
            at,
            params,
            max_runs,
            description,
        } => {
            let mut request = match (every, cron, at) {
                (Some(secs), None, None) => NewSchedule::interval(&name, &task_type, secs),
                (None, Some(expr), None) => NewSchedule::cron(&name, &task_type, &expr),
                (None, None, Some(at)) => {
                    NewSchedule::once(&name, &task_type, parse_timestamp(&at)?)
                }
                _ => bail!("exactly one of --every, --cron or --at is required"),
            }
            .with_max_runs(max_runs);
            if let Some(raw) = params {
                let params: Params =
                    serde_json::from_str(&raw).context("--params must be a JSON object")?;
                request = request.with_params(params);
            }
            if let Some(text) = description {
                request = request.with_description(&text);
            }

            let id = scheduler.register(request)?;
            if let Some(def) = scheduler.get(&id)? {
                println!("✅ Schedule added: {}", id);
                print_row(&def);
            }
            Ok(())
        }
        Command::List { enabled_only } => {
            let schedules = scheduler.list(enabled_only)?;
            if schedules.is_empty() {
                println!("No schedules.");
            }
            for def in &schedules {
                print_row(def);
            }
            Ok(())
        }
        Command::Show { id } => match scheduler.get(&id)? {
            Some(def) => {
                println!("{}", serde_json::to_string_pretty(&def)?);
                Ok(())
            }
            None => bail!("no schedule with id {id}"),
        },
        Command::Pause { id } => report(scheduler.pause(&id)?, "⏸️ Paused", &id),
        Command::Resume { id } => report(scheduler.resume(&id)?, "▶️ Resumed", &id),
        Command::Delete { id } => report(scheduler.delete(&id)?, "🗑️ Deleted", &id),
        Command::Records { status, prune } => {
            if prune {
                let removed = scheduler.prune_task_records()?;
                println!("🧹 Pruned {} finished task record(s)", removed);
            }
            let status = status.map(|s| s.parse::<TaskStatus>()).transpose()?;
            let records = scheduler.task_records(status)?;
            if records.is_empty() {
                println!("No task records.");
            }
            for r in &records {
                println!(
                    "{}  {:<10}  {:<24}  retries {}/{}  {}{}",
                    r.task_id,
                    r.status,
                    r.task_type,
                    r.retry_count,
                    r.max_retries,
                    r.created_at.to_rfc3339(),
                    r.error_message
                        .as_deref()
                        .map(|e| format!("  ({e})"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}

async fn run(scheduler: Scheduler, broker: Arc<Broker>, workers: usize) -> Result<()> {
    let scheduler = Arc::new(scheduler);
    broker.start_cleanup()?;
    scheduler.start()?;

    println!("📬 TaskHub v{}", env!("CARGO_PKG_VERSION"));
    println!("   👷 Workers: {}", workers.max(1));
    println!("   Press Ctrl-C to stop.\n");

    let handles: Vec<_> = (0..workers.max(1))
        .map(|n| {
            let broker = Arc::clone(&broker);
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                loop {
                    let Some(task) = broker.pop_task(None).await else {
                        continue;
                    };
                    if let Err(e) = scheduler.mark_task_started(&task.task_id) {
                        tracing::warn!("⚠️ Ledger update failed for {}: {e}", task.task_id);
                    }
                    tracing::info!(
                        "👷 Worker {} handled {} [{}] params={}",
                        n,
                        task.task_id,
                        task.task_type,
                        serde_json::Value::Object(task.params.clone())
                    );
                    if let Err(e) = scheduler.mark_task_finished(&task.task_id, Ok(())) {
                        tracing::warn!("⚠️ Ledger update failed for {}: {e}", task.task_id);
                    }
                    broker.task_done();
                }
            })
        })
        .collect();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C, shutting down...");

    scheduler.stop();
    broker.stop_cleanup();
    for handle in handles {
        handle.abort();
    }
    if !broker.is_empty() {
        tracing::warn!("⚠️ {} task(s) left in the queue", broker.queue_size());
    }
    Ok(())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("--at expects RFC 3339, got '{raw}'"))?
        .with_timezone(&Utc))
}

fn report(found: bool, action: &str, id: &str) -> Result<()> {
    if !found {
        bail!("no schedule with id {id}");
    }
    println!("{action}: {id}");
    Ok(())
}

fn print_row(def: &ScheduleDefinition) {
    println!(
        "{}  {:<20}  {:<24}  {:<22}  {}  runs {}{}  next {}",
        def.schedule_id,
        def.name,
        def.task_type,
        def.rule.to_string(),
        if def.enabled { "on " } else { "off" },
        def.run_count,
        if def.max_runs > 0 {
            format!("/{}", def.max_runs)
        } else {
            String::new()
        },
        def.next_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into())
    );
}
