//! claimq CLI: operator interface to the task queue and resource pools.

use std::path::PathBuf;

use claimq::allocator::Allocator;
use claimq::config::{Config, ExecutorConfig, ExhaustionPolicy};
use claimq::engine::Driver;
use claimq::executor::CommandExecutor;
use claimq::lock::LockManager;
use claimq::model::{PoolId, Status, TaskKey};
use claimq::queue::TaskQueue;
use claimq::splitter::split_pool;
use claimq::storage::Storage;
use claimq::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "claimq", about = "File-backed task queue with exclusive resource pools")]
struct Cli {
    /// TOML config file (environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Task source file
    #[arg(long, global = true)]
    input: Option<PathBuf>,
    /// Pool file template, e.g. `pool_{pool}.csv`
    #[arg(long, global = true)]
    pools: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the driver until no task is pending
    Run {
        /// Program run once per task
        #[arg(long)]
        executor: Option<PathBuf>,
        /// Executions per batch
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Milliseconds between batches
        #[arg(long)]
        poll_interval_ms: Option<u64>,
        /// What to do when a pool has no unit left: fail | requeue
        #[arg(long)]
        on_exhausted: Option<ExhaustionPolicy>,
    },
    /// Show task counts by status and the pending tasks
    Status {
        /// Maximum pending tasks to list
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show remaining units per pool
    Pools,
    /// Put tasks back to pending
    Reset {
        /// Task keys to reset
        keys: Vec<String>,
        /// Reset every failed task
        #[arg(long, conflicts_with = "keys")]
        failed: bool,
    },
    /// Split a master pool file into one pool file per worker slot
    Split {
        /// Master pool file
        source: PathBuf,
        /// Number of pool files to write
        #[arg(long, default_value_t = 5)]
        parts: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(input) = cli.input {
        config.input_path = input;
    }
    if let Some(pools) = cli.pools {
        config.pool_path_template = pools;
    }

    match cli.command {
        Command::Run {
            executor,
            max_concurrency,
            poll_interval_ms,
            on_exhausted,
        } => {
            if let Some(n) = max_concurrency {
                config.max_concurrency = n;
            }
            if let Some(ms) = poll_interval_ms {
                config.poll_interval_ms = ms;
            }
            if let Some(policy) = on_exhausted {
                config.on_exhausted = policy;
            }
            config.validate()?;
            cmd_run(config, executor).await
        }
        Command::Status { limit } => cmd_status(&config, limit),
        Command::Pools => cmd_pools(&config),
        Command::Reset { keys, failed } => cmd_reset(&config, keys, failed),
        Command::Split { source, parts } => cmd_split(&config, source, parts),
    }
}

fn locks(config: &Config) -> LockManager {
    LockManager::new().with_timeout(config.lock_timeout())
}

fn queue(config: &Config) -> TaskQueue {
    TaskQueue::new(
        Storage::new(&config.input_path, locks(config)),
        config.columns.clone(),
        config.max_attempts,
    )
}

async fn cmd_run(config: Config, executor: Option<PathBuf>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "claimq".to_string(),
        log_level: config.log_level.clone(),
        log_file: config.log_file.clone(),
    })?;

    let executor = match (executor, config.executor.as_ref()) {
        (Some(command), Some(configured)) => CommandExecutor::from_config(&ExecutorConfig {
            command,
            ..configured.clone()
        }),
        (Some(command), None) => CommandExecutor::new(command),
        (None, Some(configured)) => CommandExecutor::from_config(configured),
        (None, None) => anyhow::bail!("no executor configured (use --executor or CLAIMQ_EXECUTOR)"),
    };

    let driver = Driver::from_config(&config, executor);

    let ctrl = driver.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    let report = driver.run().await?;

    if report.input_missing {
        println!("Task source {} not found.", config.input_path.display());
        return Ok(());
    }
    println!(
        "{} cycle(s), {} execution(s): {} done, {} failed, {} needs-retry",
        report.cycles,
        report.executions(),
        report.done,
        report.failed,
        report.needs_retry
    );
    if report.deferred + report.skipped + report.unrecorded > 0 {
        println!(
            "{} deferred, {} skipped, {} unrecorded",
            report.deferred, report.skipped, report.unrecorded
        );
    }
    if report.interrupted {
        println!("Interrupted; rerun to resume.");
    }
    Ok(())
}

fn cmd_status(config: &Config, limit: usize) -> anyhow::Result<()> {
    let queue = queue(config);
    let tasks = queue.tasks()?;

    for (status, count) in queue.counts()? {
        println!("{:<12}  {count}", status.as_str());
    }
    println!("{:<12}  {}", "total", tasks.len());

    let pending: Vec<_> = tasks.iter().filter(|t| t.status.is_pending()).collect();
    if pending.is_empty() {
        return Ok(());
    }

    println!();
    println!("{:<30}  {:<12}  {:<8}  DETAIL", "KEY", "STATUS", "ATTEMPTS");
    println!("{}", "-".repeat(80));
    for task in pending.iter().take(limit) {
        println!(
            "{:<30}  {:<12}  {:<8}  {}",
            task.key.as_str(),
            task.status.as_str(),
            task.attempts,
            task.detail.as_deref().unwrap_or("-")
        );
    }
    if pending.len() > limit {
        println!("... and {} more", pending.len() - limit);
    }
    Ok(())
}

fn cmd_pools(config: &Config) -> anyhow::Result<()> {
    let allocator = Allocator::new(config.clone(), locks(config));
    let count = if config.has_pool_placeholder() {
        config.max_concurrency
    } else {
        1
    };

    println!("{:<6}  {:<40}  REMAINING", "POOL", "FILE");
    println!("{}", "-".repeat(60));
    for slot in 0..count {
        let pool = PoolId::for_slot(slot, count);
        let remaining = match allocator.remaining(&pool)? {
            Some(n) => n.to_string(),
            None => "missing".to_string(),
        };
        println!(
            "{:<6}  {:<40}  {remaining}",
            pool.as_str(),
            config.pool_path(&pool).display().to_string()
        );
    }
    Ok(())
}

fn cmd_reset(config: &Config, keys: Vec<String>, failed: bool) -> anyhow::Result<()> {
    if keys.is_empty() && !failed {
        anyhow::bail!("give task keys to reset, or --failed");
    }
    let keys: Vec<TaskKey> = keys.iter().map(TaskKey::new).collect();
    let reset = queue(config).reset(&keys)?;

    if reset.is_empty() {
        println!("No {} tasks to reset.", Status::Failed);
        return Ok(());
    }
    for key in &reset {
        println!("Reset: {key}");
    }
    println!("\n{} task(s) back to {}", reset.len(), Status::Pending);
    Ok(())
}

fn cmd_split(config: &Config, source: PathBuf, parts: usize) -> anyhow::Result<()> {
    let summary = split_pool(&source, parts, config, &locks(config))?;

    if summary.provisioned {
        println!("{} was missing; generated placeholder rows.", source.display());
    }
    if summary.parts.is_empty() {
        println!("Nothing to split: every row is consumed or the file is empty.");
        return Ok(());
    }
    for (path, rows) in &summary.parts {
        println!("{:<40}  {rows} row(s)", path.display().to_string());
    }
    println!(
        "\n{} row(s) split into {} file(s), {} consumed row(s) dropped",
        summary.total,
        summary.parts.len(),
        summary.dropped
    );
    Ok(())
}
