use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use holdfast_counters::CounterRecord;
use holdfast_pause_control::{JobPayload, RESCHEDULE_DELAY};
use holdfast_runtime::{init_logging, Holdfast, HoldfastConfig, WorkerBinding, FLUSH_BATCH};

#[derive(Parser)]
#[command(name = "holdfast")]
#[command(about = "Pause background job classes and flush buffered counters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Turn a pause toggle on (worker name, underscored, or `search_indexing`)
    Pause { toggle: String },
    /// Turn a pause toggle off
    Unpause { toggle: String },
    /// Show pause state and queue sizes of the bound workers
    Status {
        /// Worker binding as strategy=Worker, repeatable
        #[arg(long = "bind", env = "HOLDFAST_BINDINGS", value_delimiter = ',')]
        bindings: Vec<WorkerBinding>,
    },
    /// Enqueue a job through the pause-aware dispatcher
    Enqueue {
        #[arg(long = "bind", env = "HOLDFAST_BINDINGS", value_delimiter = ',')]
        bindings: Vec<WorkerBinding>,
        worker: String,
        /// Job arguments as a JSON array
        args: String,
        /// Context entry as key=value, repeatable
        #[arg(long = "context", value_parser = parse_context)]
        context: Vec<(String, String)>,
    },
    /// Run one resume sweep
    Resume {
        #[arg(long = "bind", env = "HOLDFAST_BINDINGS", value_delimiter = ',')]
        bindings: Vec<WorkerBinding>,
    },
    /// Commit counter flushes whose delay has passed
    FlushDue {
        #[arg(long, default_value_t = FLUSH_BATCH)]
        limit: usize,
    },
    /// Add to a counter (registered via HOLDFAST_BUFFERED_ATTRIBUTES)
    Increment {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        record_type: String,
        #[arg(long)]
        record_id: i64,
        #[arg(long)]
        attribute: String,
        #[arg(allow_hyphen_values = true)]
        amount: i64,
    },
    /// Flush pending counters of the given records right away
    FlushStale {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        record_type: String,
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
    },
    /// Run resume sweeps and counter flushes until interrupted
    Daemon {
        #[arg(long = "bind", env = "HOLDFAST_BINDINGS", value_delimiter = ',')]
        bindings: Vec<WorkerBinding>,
    },
}

fn parse_context(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = HoldfastConfig::from_env().context("load configuration")?;

    match cli.command {
        Command::Pause { toggle } => {
            build(&config, &[])?.toggle.enable(&toggle)?;
            tracing::info!(toggle = %toggle, "pause toggle enabled");
        }
        Command::Unpause { toggle } => {
            let was_on = build(&config, &[])?.toggle.disable(&toggle)?;
            tracing::info!(toggle = %toggle, was_on, "pause toggle disabled");
        }
        Command::Status { bindings } => {
            for status in build(&config, &bindings)?.status()? {
                println!("{}", serde_json::to_string(&status)?);
            }
        }
        Command::Enqueue {
            bindings,
            worker,
            args,
            context,
        } => {
            let args: Vec<serde_json::Value> =
                serde_json::from_str(&args).context("job args must be a JSON array")?;
            let mut job = JobPayload::new(worker, args);
            job.context.extend(context);
            let outcome = build(&config, &bindings)?.dispatcher.enqueue(&job)?;
            let state = if outcome.is_paused() { "paused" } else { "enqueued" };
            println!("{}", serde_json::json!({ "jid": job.jid, "state": state }));
        }
        Command::Resume { bindings } => {
            let report = build(&config, &bindings)?.resume.tick()?;
            println!(
                "{}",
                serde_json::json!({
                    "resumed": report.resumed,
                    "reschedule": report.reschedule,
                    "contended": report.contended,
                    "failed": report.failed,
                })
            );
        }
        Command::FlushDue { limit } => {
            let report = build(&config, &[])?.flush_worker.run_due(limit)?;
            tracing::info!(?report, "flush run finished");
        }
        Command::Increment {
            project,
            record_type,
            record_id,
            attribute,
            amount,
        } => {
            let app = build(&config, &[])?;
            let record = CounterRecord::new(project, record_type, record_id);
            let counter = app.counters.counter_for(&record, &attribute)?;
            println!("{}", counter.increment(amount)?);
        }
        Command::FlushStale {
            project,
            record_type,
            ids,
        } => {
            let records: Vec<CounterRecord> = ids
                .into_iter()
                .map(|id| CounterRecord::new(project, record_type.clone(), id))
                .collect();
            let report = build(&config, &[])?.flush_stale.execute(&records)?;
            println!(
                "{}",
                serde_json::json!({ "checked": report.checked, "flushed": report.flushed })
            );
        }
        Command::Daemon { bindings } => {
            let app = Arc::new(build(&config, &bindings)?);
            run_daemon(app, config.tick_interval).await?;
        }
    }
    Ok(())
}

fn build(config: &HoldfastConfig, bindings: &[WorkerBinding]) -> Result<Holdfast> {
    Holdfast::build(config, bindings).context("initialise holdfast")
}

async fn run_daemon(app: Arc<Holdfast>, interval: Duration) -> Result<()> {
    tracing::info!(
        workers = app.workers.len(),
        interval_secs = interval.as_secs(),
        "holdfast daemon started"
    );
    loop {
        let ticking = app.clone();
        let outcome = tokio::task::spawn_blocking(move || ticking.tick())
            .await
            .context("tick task panicked")?;
        let delay = match outcome {
            Ok(report) => {
                for (worker, error) in &report.resume.failed {
                    tracing::warn!(worker = %worker, error = %error, "worker will be retried");
                }
                let delay = if report.resume.reschedule {
                    RESCHEDULE_DELAY
                } else {
                    interval
                };
                tracing::debug!(
                    resumed = report.resume.resumed.len(),
                    committed = report.flush.committed,
                    next_tick_ms = delay.as_millis() as u64,
                    "tick finished"
                );
                delay
            }
            Err(err) => {
                tracing::error!(error = %err, "tick failed, retrying");
                RESCHEDULE_DELAY
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                return Ok(());
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
