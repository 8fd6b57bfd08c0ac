use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveTime};

use backman_config::BackmanConfig;
use backman_cron::{RunOutcome, SkipReason, SqliteTaskStore, TaskRepository};
use backman_types::{BackupRun, BackupTask, NewBackupTask, TIME_OF_DAY_FORMAT, TIMESTAMP_FORMAT};

use crate::TaskArgs;

/// Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, TIME_OF_DAY_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| format!("expected HH:MM or HH:MM:SS, got {s:?}"))
}

pub fn init_config(config: &BackmanConfig, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => backman_config::save_config_to(config, path)?,
        None => backman_config::save_config(config)?,
    }
    println!("Config written");
    Ok(())
}

pub fn open_store(config: &BackmanConfig) -> Result<Arc<SqliteTaskStore>> {
    let path = config.storage.resolve_db_path()?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let store = SqliteTaskStore::open(&path)
        .with_context(|| format!("Failed to open task store at {}", path.display()))?;
    Ok(Arc::new(store))
}

impl From<TaskArgs> for NewBackupTask {
    fn from(args: TaskArgs) -> Self {
        Self {
            name: args.name,
            source_path: args.source,
            destination_path: args.destination,
            department: args.department,
            task_type: args.task_type,
            remarks: args.remarks,
            scheduled_time: args.at,
            frequency: args.frequency,
        }
    }
}

pub async fn add(store: &SqliteTaskStore, args: TaskArgs) -> Result<()> {
    let task = store
        .create_task(args.into(), Local::now().naive_local())
        .await?;
    println!(
        "Created task {} ({}), next run {}",
        task.id,
        task.name,
        fmt_opt(task.next_run)
    );
    Ok(())
}

pub async fn edit(store: &SqliteTaskStore, id: i64, args: TaskArgs) -> Result<()> {
    let task = store
        .update_task(id, args.into(), Local::now().naive_local())
        .await?;
    println!("Updated task {}, next run {}", task.id, fmt_opt(task.next_run));
    Ok(())
}

pub async fn list(store: &SqliteTaskStore, json: bool) -> Result<()> {
    let tasks = store.list_tasks().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks");
        return Ok(());
    }
    println!(
        "{:>4}  {:<24} {:<8} {:<8} {:<10} {:<8} {:<19}",
        "ID", "NAME", "FREQ", "AT", "STATUS", "ACTIVE", "NEXT RUN"
    );
    for task in &tasks {
        println!(
            "{:>4}  {:<24} {:<8} {:<8} {:<10} {:<8} {:<19}",
            task.id,
            task.name,
            task.frequency,
            task.scheduled_time.format(TIME_OF_DAY_FORMAT),
            task.status,
            if task.is_active { "yes" } else { "no" },
            fmt_opt(task.next_run),
        );
    }
    Ok(())
}

pub async fn status(store: &SqliteTaskStore, id: i64, json: bool) -> Result<()> {
    let task = require_task(store, id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }
    println!("Task {}: {}", task.id, task.name);
    println!("  source:      {}", task.source_path);
    println!("  destination: {}", task.destination_path);
    if !task.department.is_empty() {
        println!("  department:  {}", task.department);
    }
    println!("  type:        {}", task.task_type);
    println!(
        "  schedule:    {} at {}",
        task.frequency,
        task.scheduled_time.format(TIME_OF_DAY_FORMAT)
    );
    println!("  active:      {}", task.is_active);
    println!("  status:      {}", task.status);
    println!("  last run:    {}", fmt_opt(task.last_run));
    println!("  next run:    {}", fmt_opt(task.next_run));
    if !task.remarks.is_empty() {
        println!("  remarks:     {}", task.remarks);
    }
    Ok(())
}

pub async fn logs(store: &SqliteTaskStore, id: i64, limit: usize, json: bool) -> Result<()> {
    let task = require_task(store, id).await?;
    let runs = store.task_logs(id, limit).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    println!("Run history of {} ({})", task.name, task.id);
    for run in &runs {
        print_run(None, run);
    }
    Ok(())
}

pub async fn recent(store: &SqliteTaskStore, limit: usize, json: bool) -> Result<()> {
    let recent = store.recent_logs(limit).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&recent)?);
        return Ok(());
    }
    for entry in &recent {
        print_run(Some(&entry.task_name), &entry.run);
    }
    Ok(())
}

pub async fn set_paused(store: &SqliteTaskStore, id: i64, paused: bool) -> Result<()> {
    if !store.set_paused(id, paused).await? {
        bail!("Task {id} not found");
    }
    println!("Task {id} {}", if paused { "paused" } else { "resumed" });
    Ok(())
}

pub async fn set_active(store: &SqliteTaskStore, id: i64, active: bool) -> Result<()> {
    if !store.set_active(id, active).await? {
        bail!("Task {id} not found");
    }
    println!("Task {id} {}", if active { "enabled" } else { "disabled" });
    Ok(())
}

pub async fn prune(store: &SqliteTaskStore, days: u32) -> Result<()> {
    let cutoff = backman_cron::retention_cutoff(Local::now().naive_local(), days);
    let removed = store.prune_logs(cutoff).await?;
    println!("Removed {removed} run log(s) older than {days} day(s)");
    Ok(())
}

/// Manual run: executes in this process, outside the daemon's worker pool.
/// The store's run claim keeps it from overlapping a daemon run of the same task.
pub async fn run(store: Arc<SqliteTaskStore>, config: &BackmanConfig, id: i64) -> Result<()> {
    let orchestrator = backman_cron::build_orchestrator(store, config);
    match orchestrator.execute_task(id).await {
        RunOutcome::Completed {
            files_copied,
            total_size_mb,
            duration,
            next_run,
        } => {
            println!(
                "Backup completed: {files_copied} files, {total_size_mb:.2} MB in {}, next run {}",
                backman_types::format_duration(duration),
                next_run.format(TIMESTAMP_FORMAT)
            );
            Ok(())
        }
        RunOutcome::Failed { error, .. } => bail!("Backup failed: {error}"),
        RunOutcome::TimedOut { timeout } => bail!(
            "Backup timed out after {}",
            backman_types::format_duration(timeout)
        ),
        RunOutcome::Skipped(reason) => bail!("Backup skipped: {}", describe_skip(&reason)),
    }
}

fn describe_skip(reason: &SkipReason) -> String {
    match reason {
        SkipReason::DuplicateRun => "task is already running".into(),
        SkipReason::Paused => "task is paused (resume it first)".into(),
        SkipReason::NotFound => "task not found".into(),
        SkipReason::Inactive => "task is inactive".into(),
        SkipReason::Unavailable(e) => format!("task store unavailable ({e})"),
    }
}

async fn require_task(store: &SqliteTaskStore, id: i64) -> Result<BackupTask> {
    store
        .get_task(id)
        .await?
        .with_context(|| format!("Task {id} not found"))
}

fn print_run(task_name: Option<&str>, run: &BackupRun) {
    let label = task_name.map(|n| format!(" [{n}]")).unwrap_or_default();
    println!(
        "#{:<5} {}{label} {:<7} {}",
        run.id,
        run.run_time.format(TIMESTAMP_FORMAT),
        run.status,
        run.message
    );
    if let (Some(files), Some(size)) = (run.files_copied, run.total_size_mb) {
        println!(
            "       {files} files, {size:.2} MB, {}",
            run.duration.as_deref().unwrap_or("-")
        );
    }
    if let Some(details) = &run.error_details {
        println!("       error: {details}");
    }
}

fn fmt_opt(ts: Option<chrono::NaiveDateTime>) -> String {
    ts.map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| "-".into())
}
