//! Wires the engine together from configuration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Local, NaiveDateTime, TimeDelta};
use tracing::{info, warn};

use backman_config::BackmanConfig;

use crate::copy::{CommandCopyExecutor, CopyTool};
use crate::notifier::LogNotifier;
use crate::orchestrator::{BackupOrchestrator, RunOutcome};
use crate::pool::WorkerPool;
use crate::repository::Result;
use crate::scheduler::Scheduler;
use crate::store::SqliteTaskStore;
use crate::tracker::RunTracker;

/// Build an orchestrator backed by `store` with the configured copy tool,
/// timeout and notifier.
pub fn build_orchestrator(store: Arc<SqliteTaskStore>, config: &BackmanConfig) -> BackupOrchestrator {
    let tool = CopyTool::from_config(&config.engine.copy_tool);
    info!(program = tool.program(), "Using copy program");
    BackupOrchestrator::new(
        store,
        Arc::new(CommandCopyExecutor::new(tool)),
        Arc::new(LogNotifier::new(config.notify.clone())),
        Arc::new(RunTracker::new()),
    )
    .with_copy_timeout(Duration::from_secs(config.engine.copy_timeout_secs))
}

/// Start of the retention window: run logs older than this may be pruned.
pub fn retention_cutoff(now: NaiveDateTime, retention_days: u32) -> NaiveDateTime {
    now.checked_sub_days(Days::new(u64::from(retention_days)))
        .unwrap_or(NaiveDateTime::MIN)
}

/// Slack on top of the copy timeout for the size scan and bookkeeping that
/// follow a copy.
pub const RECOVERY_GRACE: Duration = Duration::from_secs(10 * 60);

/// Runs opened before this instant cannot still be alive in any process:
/// every copy is bounded by `copy_timeout`.
pub fn stale_run_cutoff(now: NaiveDateTime, copy_timeout: Duration) -> NaiveDateTime {
    copy_timeout
        .checked_add(RECOVERY_GRACE)
        .and_then(|age| TimeDelta::from_std(age).ok())
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(NaiveDateTime::MIN)
}

/// The long-running daemon: scheduler, worker pool and store.
pub struct BackupService {
    store: Arc<SqliteTaskStore>,
    orchestrator: Arc<BackupOrchestrator>,
    pool: WorkerPool,
    scheduler: Scheduler,
    log_retention_days: u32,
    copy_timeout: Duration,
}

impl BackupService {
    pub fn new(store: Arc<SqliteTaskStore>, config: &BackmanConfig) -> Self {
        let orchestrator = Arc::new(build_orchestrator(store.clone(), config));
        let pool = WorkerPool::start(orchestrator.clone(), config.engine.max_concurrent_tasks);
        let scheduler = Scheduler::new(store.clone(), pool.handle());
        Self {
            store,
            orchestrator,
            pool,
            scheduler,
            log_retention_days: config.engine.log_retention_days,
            copy_timeout: Duration::from_secs(config.engine.copy_timeout_secs),
        }
    }

    /// Close runs interrupted by a previous crash, prune old logs and arm
    /// triggers. Returns the number of scheduled tasks.
    pub async fn start(&self) -> Result<usize> {
        self.recover_interrupted_runs().await?;
        self.prune_logs().await?;
        let scheduled = self.scheduler.refresh_all().await?;
        info!(scheduled, "Backup service started");
        Ok(scheduled)
    }

    /// Close runs whose owner must have died. Runs young enough to still be
    /// copying, here or in a `backman run` process, are left alone.
    pub async fn recover_interrupted_runs(&self) -> Result<usize> {
        let cutoff = stale_run_cutoff(Local::now().naive_local(), self.copy_timeout);
        let recovered = self.store.recover_interrupted_runs(cutoff).await?;
        if recovered > 0 {
            warn!(recovered, "Closed run logs left open by a dead process");
        }
        Ok(recovered)
    }

    /// Delete run logs older than the retention window.
    pub async fn prune_logs(&self) -> Result<usize> {
        let cutoff = retention_cutoff(Local::now().naive_local(), self.log_retention_days);
        let pruned = self.store.prune_logs(cutoff).await?;
        if pruned > 0 {
            info!(pruned, days = self.log_retention_days, "Pruned old run logs");
        }
        Ok(pruned)
    }

    /// Re-read task definitions after an add, edit, (de)activation or pause,
    /// and close runs that went stale since the last refresh.
    pub async fn refresh(&self) -> Result<usize> {
        self.recover_interrupted_runs().await?;
        self.scheduler.refresh_all().await
    }

    /// Queue a manual run on the worker pool.
    pub fn run_now(&self, task_id: i64) -> bool {
        self.pool.submit(task_id)
    }

    /// Run a task on the caller's task and wait for the outcome.
    pub async fn run_and_wait(&self, task_id: i64) -> RunOutcome {
        self.orchestrator.execute_task(task_id).await
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<SqliteTaskStore> {
        &self.store
    }

    pub fn running_tasks(&self) -> Vec<i64> {
        self.orchestrator.tracker().running_ids()
    }

    /// Stop triggers, then wait for in-flight runs.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backman_config::CopyToolConfig;
    use backman_types::{Frequency, NewBackupTask, RunStatus, TaskStatus};
    use chrono::NaiveTime;

    use crate::repository::TaskRepository;

    fn new_task(name: &str) -> NewBackupTask {
        NewBackupTask {
            name: name.into(),
            source_path: "/nonexistent/source".into(),
            destination_path: "/nonexistent/destination".into(),
            department: "Ops".into(),
            task_type: "full".into(),
            remarks: "nightly".into(),
            scheduled_time: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            frequency: Frequency::Daily,
        }
    }

    #[tokio::test]
    async fn test_start_recovers_and_schedules() {
        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        let now = Local::now().naive_local();
        let a = store.create_task(new_task("a"), now).await.unwrap();
        let b = store.create_task(new_task("b"), now).await.unwrap();
        store.set_paused(b.id, true).await.unwrap();
        // Older than the default copy timeout plus grace.
        store
            .begin_run(a.id, now - TimeDelta::try_hours(2).unwrap())
            .await
            .unwrap();

        let service = BackupService::new(store.clone(), &BackmanConfig::default());
        assert_eq!(service.start().await.unwrap(), 1);
        assert_eq!(service.scheduler().scheduled_ids().await, vec![a.id]);

        let task = store.get_task(a.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let logs = store.task_logs(a.id, 5).await.unwrap();
        assert_eq!(logs[0].status, RunStatus::Failed);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_leaves_live_runs_of_other_processes() {
        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        let now = Local::now().naive_local();
        let task = store.create_task(new_task("a"), now).await.unwrap();
        // Claimed a minute ago by a `backman run` that is still copying.
        let log_id = store
            .begin_run(task.id, now - TimeDelta::try_minutes(1).unwrap())
            .await
            .unwrap();

        let service = BackupService::new(store.clone(), &BackmanConfig::default());
        service.start().await.unwrap();
        assert_eq!(service.refresh().await.unwrap(), 1);

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        let logs = store.task_logs(task.id, 5).await.unwrap();
        assert_eq!(logs[0].id, log_id);
        assert_eq!(logs[0].status, RunStatus::Running);

        // The daemon refuses to start a second copy while the claim holds.
        assert_eq!(
            service.run_and_wait(task.id).await,
            RunOutcome::Skipped(crate::orchestrator::SkipReason::DuplicateRun)
        );
        service.shutdown().await;
    }

    #[test]
    fn test_stale_run_cutoff() {
        let now = chrono::NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(
            stale_run_cutoff(now, Duration::from_secs(3600)),
            now.date().and_hms_opt(10, 50, 0).unwrap()
        );
        assert_eq!(
            stale_run_cutoff(now, Duration::from_secs(u64::MAX)),
            NaiveDateTime::MIN
        );
    }

    #[test]
    fn test_retention_cutoff() {
        let now = chrono::NaiveDate::from_ymd_opt(2025, 3, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(
            retention_cutoff(now, 30),
            chrono::NaiveDate::from_ymd_opt(2025, 2, 8)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap()
        );
        assert_eq!(retention_cutoff(now, 0), now);
    }

    #[tokio::test]
    async fn test_prune_respects_retention() {
        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        let now = Local::now().naive_local();
        let task = store.create_task(new_task("a"), now).await.unwrap();
        let old = store
            .insert_run_log(task.id, now.checked_sub_days(Days::new(45)).unwrap())
            .await
            .unwrap();
        let fresh = store
            .insert_run_log(task.id, now.checked_sub_days(Days::new(2)).unwrap())
            .await
            .unwrap();
        for log_id in [old, fresh] {
            store
                .finalize_run_log(log_id, &backman_types::RunFinalization::success("ok"))
                .await
                .unwrap();
        }

        let service = BackupService::new(store.clone(), &BackmanConfig::default());
        assert_eq!(service.prune_logs().await.unwrap(), 1);
        let logs = store.task_logs(task.id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, fresh);
        service.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_and_wait_with_cp() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("ledger.csv"), vec![b'x'; 2048]).unwrap();

        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        let mut task = new_task("ledger");
        task.source_path = src.path().display().to_string();
        task.destination_path = dst.path().join("ledger").display().to_string();
        let task = store
            .create_task(task, Local::now().naive_local())
            .await
            .unwrap();

        let mut config = BackmanConfig::default();
        config.engine.copy_tool = CopyToolConfig::Cp;
        let service = BackupService::new(store.clone(), &config);

        let outcome = service.run_and_wait(task.id).await;
        assert!(
            matches!(outcome, RunOutcome::Completed { files_copied: 1, .. }),
            "{outcome:?}"
        );
        assert!(dst.path().join("ledger/ledger.csv").is_file());
        assert!(service.running_tasks().is_empty());
        service.shutdown().await;
    }
}
