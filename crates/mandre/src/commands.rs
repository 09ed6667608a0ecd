//! Subcommand implementations over a file-backed store.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Result;
use tokio::sync::watch;
use tracing::info;

use mandre_scheduler::{
    FileStore, LogSink, RetryPolicy, Scheduler, SchedulerConfig, SystemClock, Task, TaskId,
    TaskSpec, TaskStore,
};

use crate::TaskArgs;

/// A state change applied to one task by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Cancel,
    Suspend,
    Resume,
    Purge,
}

/// Open the store at `store_dir` and reconcile a scheduler over it.
async fn open_scheduler(store_dir: &Path, config: SchedulerConfig) -> Result<Scheduler> {
    let store = FileStore::open(store_dir).await.map_err(|e| {
        miette::miette!("failed to open task store at {}: {}", store_dir.display(), e)
    })?;

    Scheduler::open(
        Arc::new(store),
        Arc::new(SystemClock::new()),
        Arc::new(LogSink),
        config,
    )
    .await
    .map_err(|e| miette::miette!("failed to open scheduler: {}", e))
}

/// Instant `secs` seconds from now.
pub fn from_now(secs: u64) -> Result<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .ok_or_else(|| miette::miette!("--after {} is out of range", secs))
}

/// Apply the shared task options to `spec`.
pub fn build_spec(mut spec: TaskSpec, args: &TaskArgs) -> Result<TaskSpec> {
    if let Some(payload) = &args.payload {
        let payload = serde_json::from_str(payload)
            .map_err(|e| miette::miette!("payload is not valid JSON: {}", e))?;
        spec = spec.with_payload(payload);
    }
    if let Some(max_attempts) = args.max_attempts {
        spec = spec.with_retry_policy(RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        });
    }
    Ok(spec)
}

pub async fn run(store_dir: &Path, config: SchedulerConfig) -> Result<()> {
    let scheduler = open_scheduler(store_dir, config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    info!(
        store = %store_dir.display(),
        next_fire_at = ?scheduler.peek_next().await,
        "scheduler ready"
    );
    scheduler.run(shutdown_rx).await;
    Ok(())
}

pub async fn register(store_dir: &Path, config: SchedulerConfig, spec: TaskSpec) -> Result<()> {
    let scheduler = open_scheduler(store_dir, config).await?;
    let handle = scheduler
        .register(spec)
        .await
        .map_err(|e| miette::miette!("failed to register task: {}", e))?;

    println!("{} (next fire at {})", handle.id, handle.next_fire_at.to_rfc3339());
    Ok(())
}

pub async fn change(
    store_dir: &Path,
    config: SchedulerConfig,
    change: Change,
    id: TaskId,
) -> Result<()> {
    let scheduler = open_scheduler(store_dir, config).await?;

    let changed = match change {
        Change::Cancel => scheduler.cancel(&id).await,
        Change::Suspend => scheduler.suspend(&id).await,
        Change::Resume => scheduler.resume(&id).await,
        Change::Purge => scheduler.purge(&id).await.map(|()| true),
    }
    .map_err(|e| miette::miette!("{:?} {} failed: {}", change, id, e))?;

    match (changed, scheduler.get(&id).await) {
        (true, Some(task)) => println!("{}: {}", id, task.state),
        (true, None) => println!("{}: purged", id),
        (false, Some(task)) => println!("{}: unchanged ({})", id, task.state),
        (false, None) => println!("{}: unchanged", id),
    }
    Ok(())
}

/// Print every record in the store.
///
/// Reads the store directly rather than opening a scheduler, so listing
/// never settles tasks a running process is still delivering.
pub async fn list(store_dir: &Path, json: bool) -> Result<()> {
    let tasks = load_tasks(store_dir).await?;

    if json {
        let out = serde_json::to_string_pretty(&tasks)
            .map_err(|e| miette::miette!("failed to encode tasks: {}", e))?;
        println!("{}", out);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for task in &tasks {
        println!("{}", summary_line(task));
    }
    Ok(())
}

pub async fn gc(store_dir: &Path, config: SchedulerConfig) -> Result<()> {
    if config.retention.is_none() {
        return Err(miette::miette!(
            "no retention configured; pass --retention or set MANDRE_RETENTION_SECS"
        ));
    }
    let scheduler = open_scheduler(store_dir, config).await?;
    let removed = scheduler.collect_garbage().await;
    println!("Removed {} expired record(s)", removed);
    Ok(())
}

async fn load_tasks(store_dir: &Path) -> Result<Vec<Task>> {
    let store = FileStore::open(store_dir).await.map_err(|e| {
        miette::miette!("failed to open task store at {}: {}", store_dir.display(), e)
    })?;
    let mut tasks = store
        .list_all()
        .await
        .map_err(|e| miette::miette!("failed to read tasks: {}", e))?;
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(tasks)
}

fn summary_line(task: &Task) -> String {
    let next = task
        .next_fire_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{}  {:<9}  {:<25}  {}",
        task.id, task.state, next, task.name
    );
    if task.attempt_count > 0 {
        line.push_str(&format!(
            "  (attempt {}/{})",
            task.attempt_count, task.retry_policy.max_attempts
        ));
    }
    line
}
