//! Backup orchestrator: the single "execute task now" entry point.
//!
//! Used both by scheduler triggers and by manual runs. Each invocation walks
//! a task through `running` into `completed` or `failed`, writing an
//! append-then-finalize run log row along the way.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use tracing::{error, info, warn};

use backman_types::{BackupTask, RunFinalization, TaskStatus, format_duration};

use crate::copy::{CopyError, CopyExecutor, CopyResult, DEFAULT_COPY_TIMEOUT};
use crate::next_run::next_run;
use crate::notifier::Notifier;
use crate::repository::{RepositoryError, TaskRepository, TaskStatusUpdate};
use crate::tracker::RunTracker;

/// Why an execution request was dropped before any run log was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another execution of the same task is in flight, in this process or
    /// in another one sharing the database.
    DuplicateRun,
    NotFound,
    Inactive,
    /// Paused tasks are not run, whether a trigger or a manual request asked.
    Paused,
    /// The repository could not be read or the run could not be opened.
    Unavailable(String),
}

/// Terminal result of one `execute_task` call.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Skipped(SkipReason),
    Completed {
        files_copied: u64,
        total_size_mb: f64,
        duration: Duration,
        next_run: NaiveDateTime,
    },
    Failed {
        error: String,
        next_run: NaiveDateTime,
    },
    /// The copy exceeded its timeout. The task's next run is left as it was.
    TimedOut { timeout: Duration },
}

impl RunOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// Ties the run tracker, repository, copy executor and notifier together.
pub struct BackupOrchestrator {
    repo: Arc<dyn TaskRepository>,
    copier: Arc<dyn CopyExecutor>,
    notifier: Arc<dyn Notifier>,
    tracker: Arc<RunTracker>,
    copy_timeout: Duration,
}

impl BackupOrchestrator {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        copier: Arc<dyn CopyExecutor>,
        notifier: Arc<dyn Notifier>,
        tracker: Arc<RunTracker>,
    ) -> Self {
        Self {
            repo,
            copier,
            notifier,
            tracker,
            copy_timeout: DEFAULT_COPY_TIMEOUT,
        }
    }

    pub fn with_copy_timeout(mut self, timeout: Duration) -> Self {
        self.copy_timeout = timeout;
        self
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    /// Execute a task now. Never returns an error: every outcome is logged,
    /// persisted where a run log was opened, and reported in the return value.
    pub async fn execute_task(&self, task_id: i64) -> RunOutcome {
        let Some(_guard) = self.tracker.acquire(task_id) else {
            warn!(task_id, "Task is already running, skipping");
            return RunOutcome::Skipped(SkipReason::DuplicateRun);
        };

        let task = match self.repo.get_task(task_id).await {
            Ok(Some(task)) if !task.is_active => {
                warn!(task_id, "Task is inactive, skipping");
                return RunOutcome::Skipped(SkipReason::Inactive);
            }
            Ok(Some(task)) if task.status == TaskStatus::Paused => {
                warn!(task_id, "Task is paused, skipping");
                return RunOutcome::Skipped(SkipReason::Paused);
            }
            Ok(Some(task)) => task,
            Ok(None) => {
                error!(task_id, "Task not found");
                return RunOutcome::Skipped(SkipReason::NotFound);
            }
            Err(e) => {
                error!(task_id, "Failed to load task: {e}");
                return RunOutcome::Skipped(SkipReason::Unavailable(e.to_string()));
            }
        };

        let started = Instant::now();
        // The claim is re-checked by the store: the task may have been paused,
        // disabled or started elsewhere since it was loaded.
        let log_id = match self.repo.begin_run(task_id, local_now()).await {
            Ok(log_id) => log_id,
            Err(RepositoryError::AlreadyRunning(_)) => {
                warn!(task_id, "Task is running in another process, skipping");
                return RunOutcome::Skipped(SkipReason::DuplicateRun);
            }
            Err(RepositoryError::TaskPaused(_)) => {
                warn!(task_id, "Task is paused, skipping");
                return RunOutcome::Skipped(SkipReason::Paused);
            }
            Err(RepositoryError::TaskInactive(_)) => {
                warn!(task_id, "Task is inactive, skipping");
                return RunOutcome::Skipped(SkipReason::Inactive);
            }
            Err(RepositoryError::TaskNotFound(_)) => {
                error!(task_id, "Task not found");
                return RunOutcome::Skipped(SkipReason::NotFound);
            }
            Err(e) => {
                error!(task_id, "Failed to open run log: {e}");
                return RunOutcome::Skipped(SkipReason::Unavailable(e.to_string()));
            }
        };

        info!(task_id, task = %task.name, "Starting backup task");

        match self.run_copy(&task).await {
            Ok(Ok(result)) if result.success() => match self.measure(&task).await {
                Ok(total_size_mb) => {
                    match self
                        .complete(&task, log_id, &result, total_size_mb, started.elapsed())
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            self.fail(&task, log_id, "Backup error", e.to_string(), started.elapsed())
                                .await
                        }
                    }
                }
                Err(e) => {
                    self.fail(&task, log_id, "Backup error", e, started.elapsed())
                        .await
                }
            },
            Ok(Ok(result)) => {
                let stderr = result.stderr.trim();
                let detail = if stderr.is_empty() {
                    "Unknown error occurred".to_string()
                } else {
                    stderr.to_string()
                };
                self.fail(&task, log_id, "Backup failed", detail, started.elapsed())
                    .await
            }
            Ok(Err(CopyError::Timeout(timeout))) => {
                self.time_out(&task, log_id, timeout, started.elapsed()).await
            }
            Ok(Err(e)) => {
                self.fail(&task, log_id, "Backup error", e.to_string(), started.elapsed())
                    .await
            }
            Err(e) => {
                self.fail(&task, log_id, "Backup error", e, started.elapsed())
                    .await
            }
        }
    }

    /// Run the copy on its own task so a panic inside the executor surfaces
    /// as an error instead of unwinding through the orchestrator.
    async fn run_copy(
        &self,
        task: &BackupTask,
    ) -> Result<Result<CopyResult, CopyError>, String> {
        let copier = Arc::clone(&self.copier);
        let source = PathBuf::from(&task.source_path);
        let destination = PathBuf::from(&task.destination_path);
        let timeout = self.copy_timeout;
        tokio::spawn(async move { copier.copy(&source, &destination, timeout).await })
            .await
            .map_err(|e| format!("copy task aborted: {e}"))
    }

    /// Size the destination tree, isolated the same way as the copy.
    async fn measure(&self, task: &BackupTask) -> Result<f64, String> {
        let copier = Arc::clone(&self.copier);
        let destination = PathBuf::from(&task.destination_path);
        tokio::spawn(async move { copier.folder_size_mb(&destination).await })
            .await
            .map_err(|e| format!("size scan aborted: {e}"))
    }

    async fn complete(
        &self,
        task: &BackupTask,
        log_id: i64,
        result: &CopyResult,
        total_size_mb: f64,
        elapsed: Duration,
    ) -> Result<RunOutcome, RepositoryError> {
        let next = next_run(local_now(), task.scheduled_time, task.frequency);

        let mut outcome = RunFinalization::success(format!(
            "Backup completed successfully. {} files copied.",
            result.files_copied
        ));
        outcome.files_copied = Some(result.files_copied);
        outcome.total_size_mb = Some(total_size_mb);
        outcome.duration = Some(elapsed);

        self.repo
            .finish_run(
                task.id,
                TaskStatusUpdate::status(TaskStatus::Completed).with_next_run(next),
                log_id,
                &outcome,
            )
            .await?;

        info!(
            task_id = task.id,
            task = %task.name,
            files_copied = result.files_copied,
            total_size_mb,
            duration = %format_duration(elapsed),
            "Backup task completed successfully"
        );

        Ok(RunOutcome::Completed {
            files_copied: result.files_copied,
            total_size_mb,
            duration: elapsed,
            next_run: next,
        })
    }

    /// Failure path shared by nonzero exits and unexpected faults. The task
    /// is still rescheduled and the notifier is told.
    async fn fail(
        &self,
        task: &BackupTask,
        log_id: i64,
        prefix: &str,
        detail: String,
        elapsed: Duration,
    ) -> RunOutcome {
        let next = next_run(local_now(), task.scheduled_time, task.frequency);

        let mut outcome = RunFinalization::failed(format!("{prefix}: {detail}"));
        outcome.error_details = Some(detail.clone());
        outcome.duration = Some(elapsed);

        if let Err(e) = self
            .repo
            .finish_run(
                task.id,
                TaskStatusUpdate::status(TaskStatus::Failed).with_next_run(next),
                log_id,
                &outcome,
            )
            .await
        {
            error!(task_id = task.id, log_id, "Failed to record backup failure: {e}");
        }

        error!(task_id = task.id, task = %task.name, error = %detail, "Backup task failed");
        self.notify_failure(&task.name, &detail);

        RunOutcome::Failed {
            error: detail,
            next_run: next,
        }
    }

    /// Timeout path: the task is marked failed but its next run is not
    /// recomputed, and no notification is sent.
    async fn time_out(
        &self,
        task: &BackupTask,
        log_id: i64,
        timeout: Duration,
        elapsed: Duration,
    ) -> RunOutcome {
        let mut outcome =
            RunFinalization::failed(format!("Backup timeout after {}", format_duration(timeout)));
        outcome.duration = Some(elapsed);

        if let Err(e) = self
            .repo
            .finish_run(
                task.id,
                TaskStatusUpdate::status(TaskStatus::Failed),
                log_id,
                &outcome,
            )
            .await
        {
            error!(task_id = task.id, log_id, "Failed to record backup timeout: {e}");
        }

        error!(task_id = task.id, task = %task.name, "Backup task timed out");
        RunOutcome::TimedOut { timeout }
    }

    fn notify_failure(&self, task_name: &str, error_message: &str) {
        let notifier = Arc::clone(&self.notifier);
        let task_name = task_name.to_string();
        let error_message = error_message.to_string();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify_failure(&task_name, &error_message).await {
                warn!(task = %task_name, "Failure notification failed: {e}");
            }
        });
    }
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use backman_types::{Frequency, NewBackupTask, RunStatus};
    use chrono::NaiveTime;

    use crate::pool::PoolHandle;
    use crate::scheduler::Scheduler;
    use crate::store::SqliteTaskStore;

    enum Behavior {
        Succeed { files: u64 },
        Fail { stderr: &'static str },
        Timeout,
        Panic,
        Slow(Duration),
    }

    struct FakeCopier {
        behavior: Behavior,
        /// `None` makes the size scan panic.
        size_mb: Option<f64>,
    }

    #[async_trait]
    impl CopyExecutor for FakeCopier {
        async fn copy(
            &self,
            _source: &Path,
            _destination: &Path,
            timeout: Duration,
        ) -> Result<CopyResult, CopyError> {
            match &self.behavior {
                Behavior::Succeed { files } => Ok(CopyResult {
                    exit_code: Some(0),
                    files_copied: *files,
                    ..Default::default()
                }),
                Behavior::Fail { stderr } => Ok(CopyResult {
                    exit_code: Some(4),
                    stderr: stderr.to_string(),
                    ..Default::default()
                }),
                Behavior::Timeout => Err(CopyError::Timeout(timeout)),
                Behavior::Panic => panic!("copy backend crashed"),
                Behavior::Slow(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(CopyResult {
                        exit_code: Some(0),
                        files_copied: 1,
                        ..Default::default()
                    })
                }
            }
        }

        async fn folder_size_mb(&self, _path: &Path) -> f64 {
            match self.size_mb {
                Some(size) => size,
                None => panic!("size walk hit an unreadable entry"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_failure(&self, task_name: &str, error_message: &str) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((task_name.to_string(), error_message.to_string()));
            anyhow::bail!("smtp relay unreachable")
        }
    }

    impl RecordingNotifier {
        async fn wait_for_calls(&self, expected: usize) -> Vec<(String, String)> {
            for _ in 0..100 {
                if self.calls.lock().unwrap().len() >= expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.calls.lock().unwrap().clone()
        }
    }

    struct Harness {
        store: Arc<SqliteTaskStore>,
        notifier: Arc<RecordingNotifier>,
        orchestrator: BackupOrchestrator,
    }

    fn harness(behavior: Behavior) -> Harness {
        harness_with(
            Arc::new(SqliteTaskStore::open_in_memory().unwrap()),
            behavior,
            Some(12.34),
        )
    }

    fn harness_with(store: Arc<SqliteTaskStore>, behavior: Behavior, size_mb: Option<f64>) -> Harness {
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = BackupOrchestrator::new(
            store.clone(),
            Arc::new(FakeCopier { behavior, size_mb }),
            notifier.clone(),
            Arc::new(RunTracker::new()),
        )
        .with_copy_timeout(Duration::from_secs(90));
        Harness {
            store,
            notifier,
            orchestrator,
        }
    }

    async fn add_task(store: &SqliteTaskStore, name: &str) -> BackupTask {
        store
            .create_task(
                NewBackupTask {
                    name: name.into(),
                    source_path: "/data/src".into(),
                    destination_path: "/backup/dst".into(),
                    department: "Finance".into(),
                    task_type: "full".into(),
                    remarks: String::new(),
                    scheduled_time: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
                    frequency: Frequency::Daily,
                },
                local_now(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_completes_task_and_log() {
        let h = harness(Behavior::Succeed { files: 42 });
        let task = add_task(&h.store, "payroll").await;
        let before = local_now();

        let outcome = h.orchestrator.execute_task(task.id).await;
        let RunOutcome::Completed {
            files_copied,
            total_size_mb,
            next_run,
            ..
        } = outcome.clone()
        else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(files_copied, 42);
        assert_eq!(total_size_mb, 12.34);
        assert!(next_run > before);

        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.last_run.is_some());
        assert!(stored.next_run.unwrap() > before);

        let logs = h.store.task_logs(task.id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RunStatus::Success);
        assert_eq!(logs[0].files_copied, Some(42));
        assert_eq!(logs[0].total_size_mb, Some(12.34));
        assert!(logs[0].duration.is_some());
        assert_eq!(logs[0].message, "Backup completed successfully. 42 files copied.");

        assert!(!h.orchestrator.tracker().is_running(task.id));
        assert!(h.notifier.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_without_parseable_count_records_zero() {
        let h = harness(Behavior::Succeed { files: 0 });
        let task = add_task(&h.store, "archive").await;

        let outcome = h.orchestrator.execute_task(task.id).await;
        assert!(matches!(outcome, RunOutcome::Completed { files_copied: 0, .. }));
        let logs = h.store.task_logs(task.id, 10).await.unwrap();
        assert_eq!(logs[0].status, RunStatus::Success);
        assert_eq!(logs[0].files_copied, Some(0));
        assert!(logs[0].total_size_mb.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_copy_failure_reschedules_and_notifies() {
        let h = harness(Behavior::Fail {
            stderr: "Access denied\r\n",
        });
        let task = add_task(&h.store, "hr").await;
        let before = local_now();

        let outcome = h.orchestrator.execute_task(task.id).await;
        assert!(matches!(&outcome, RunOutcome::Failed { error, .. } if error == "Access denied"));

        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.next_run.unwrap() > before);

        let logs = h.store.task_logs(task.id, 10).await.unwrap();
        assert_eq!(logs[0].status, RunStatus::Failed);
        assert_eq!(logs[0].message, "Backup failed: Access denied");
        assert_eq!(logs[0].error_details.as_deref(), Some("Access denied"));

        // The notifier errors; the run outcome is unaffected.
        let calls = h.notifier.wait_for_calls(1).await;
        assert_eq!(calls, vec![("hr".to_string(), "Access denied".to_string())]);
        assert!(!h.orchestrator.tracker().is_running(task.id));
    }

    #[tokio::test]
    async fn test_copy_failure_without_stderr() {
        let h = harness(Behavior::Fail { stderr: "  " });
        let task = add_task(&h.store, "hr").await;
        h.orchestrator.execute_task(task.id).await;
        let logs = h.store.task_logs(task.id, 10).await.unwrap();
        assert_eq!(logs[0].error_details.as_deref(), Some("Unknown error occurred"));
    }

    #[tokio::test]
    async fn test_timeout_fails_without_rescheduling() {
        let h = harness(Behavior::Timeout);
        let task = add_task(&h.store, "media").await;
        let original_next_run = task.next_run;

        let outcome = h.orchestrator.execute_task(task.id).await;
        assert_eq!(
            outcome,
            RunOutcome::TimedOut {
                timeout: Duration::from_secs(90)
            }
        );

        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.next_run, original_next_run);

        let logs = h.store.task_logs(task.id, 10).await.unwrap();
        assert_eq!(logs[0].status, RunStatus::Failed);
        assert_eq!(logs[0].message, "Backup timeout after 00:01:30");
        assert!(logs[0].message.contains("timeout"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.notifier.calls.lock().unwrap().is_empty());
        assert!(!h.orchestrator.tracker().is_running(task.id));
    }

    #[tokio::test]
    async fn test_panicking_copy_is_finalized_as_failure() {
        let h = harness(Behavior::Panic);
        let task = add_task(&h.store, "crashy").await;

        let outcome = h.orchestrator.execute_task(task.id).await;
        assert!(matches!(&outcome, RunOutcome::Failed { error, .. } if error.contains("aborted")));

        let logs = h.store.task_logs(task.id, 10).await.unwrap();
        assert_eq!(logs[0].status, RunStatus::Failed);
        assert!(logs[0].message.starts_with("Backup error: "));
        assert_eq!(h.notifier.wait_for_calls(1).await.len(), 1);
        assert!(!h.orchestrator.tracker().is_running(task.id));
    }

    #[tokio::test]
    async fn test_panicking_size_scan_is_finalized_as_failure() {
        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        let h = harness_with(store, Behavior::Succeed { files: 3 }, None);
        let task = add_task(&h.store, "unreadable").await;

        let outcome = h.orchestrator.execute_task(task.id).await;
        assert!(
            matches!(&outcome, RunOutcome::Failed { error, .. } if error.starts_with("size scan aborted")),
            "unexpected outcome: {outcome:?}"
        );

        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        let logs = h.store.task_logs(task.id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RunStatus::Failed);
        assert!(logs[0].message.starts_with("Backup error: size scan aborted"));
        assert_eq!(h.notifier.wait_for_calls(1).await.len(), 1);
        assert!(!h.orchestrator.tracker().is_running(task.id));

        // The tracker slot was released, so the task can run again.
        assert!(!h.orchestrator.execute_task(task.id).await.is_skipped());
    }

    #[tokio::test]
    async fn test_duplicate_run_is_skipped_without_writes() {
        let h = harness(Behavior::Succeed { files: 1 });
        let task = add_task(&h.store, "busy").await;
        assert!(h.orchestrator.tracker().try_acquire(task.id));

        let outcome = h.orchestrator.execute_task(task.id).await;
        assert_eq!(outcome, RunOutcome::Skipped(SkipReason::DuplicateRun));
        assert!(h.store.task_logs(task.id, 10).await.unwrap().is_empty());
        // The rejected call must not release a guard it does not own.
        assert!(h.orchestrator.tracker().is_running(task.id));
    }

    #[tokio::test]
    async fn test_concurrent_executions_run_once() {
        let h = harness(Behavior::Slow(Duration::from_millis(200)));
        let task = add_task(&h.store, "slow").await;

        let (a, b) = tokio::join!(
            h.orchestrator.execute_task(task.id),
            h.orchestrator.execute_task(task.id)
        );
        let skipped = [&a, &b].iter().filter(|o| o.is_skipped()).count();
        assert_eq!(skipped, 1, "outcomes: {a:?} / {b:?}");
        assert_eq!(h.store.task_logs(task.id, 10).await.unwrap().len(), 1);
        assert!(!h.orchestrator.tracker().is_running(task.id));
    }

    #[tokio::test]
    async fn test_processes_sharing_a_database_run_a_task_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backman.db");
        // Separate stores and trackers, as with `backman run` next to `backman serve`.
        let daemon = harness_with(
            Arc::new(SqliteTaskStore::open(&path).unwrap()),
            Behavior::Slow(Duration::from_millis(300)),
            Some(1.0),
        );
        let manual = harness_with(
            Arc::new(SqliteTaskStore::open(&path).unwrap()),
            Behavior::Slow(Duration::from_millis(300)),
            Some(1.0),
        );
        let task = add_task(&daemon.store, "shared").await;

        let (a, b) = tokio::join!(
            daemon.orchestrator.execute_task(task.id),
            manual.orchestrator.execute_task(task.id)
        );
        let completed = [&a, &b]
            .iter()
            .filter(|o| matches!(o, RunOutcome::Completed { .. }))
            .count();
        let duplicates = [&a, &b]
            .iter()
            .filter(|o| **o == &RunOutcome::Skipped(SkipReason::DuplicateRun))
            .count();
        assert_eq!((completed, duplicates), (1, 1), "outcomes: {a:?} / {b:?}");

        let logs = manual.store.task_logs(task.id, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RunStatus::Success);
        let stored = manual.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);

        // Once released, the other process can claim the task.
        assert!(matches!(
            manual.orchestrator.execute_task(task.id).await,
            RunOutcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_pause_during_run_is_kept() {
        let h = harness(Behavior::Slow(Duration::from_millis(300)));
        let task = add_task(&h.store, "nightly").await;

        let (outcome, _) = tokio::join!(h.orchestrator.execute_task(task.id), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(h.store.set_paused(task.id, true).await.unwrap());
        });
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Paused);
        assert!(!stored.is_schedulable());
        let logs = h.store.task_logs(task.id, 10).await.unwrap();
        assert_eq!(logs[0].status, RunStatus::Success);

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let scheduler = Scheduler::new(h.store.clone(), PoolHandle::from_sender(tx));
        assert_eq!(scheduler.refresh_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_paused_task_is_not_run() {
        let h = harness(Behavior::Succeed { files: 1 });
        let task = add_task(&h.store, "on-hold").await;
        // A trigger armed before the pause still fires into the pool.
        h.store.set_paused(task.id, true).await.unwrap();

        assert_eq!(
            h.orchestrator.execute_task(task.id).await,
            RunOutcome::Skipped(SkipReason::Paused)
        );
        assert!(h.store.task_logs(task.id, 10).await.unwrap().is_empty());
        let stored = h.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Paused);
        assert!(stored.last_run.is_none());
        assert!(!h.orchestrator.tracker().is_running(task.id));

        h.store.set_paused(task.id, false).await.unwrap();
        assert!(matches!(
            h.orchestrator.execute_task(task.id).await,
            RunOutcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_and_inactive_tasks_are_skipped() {
        let h = harness(Behavior::Succeed { files: 1 });
        assert_eq!(
            h.orchestrator.execute_task(404).await,
            RunOutcome::Skipped(SkipReason::NotFound)
        );
        assert!(!h.orchestrator.tracker().is_running(404));

        let task = add_task(&h.store, "retired").await;
        h.store.set_active(task.id, false).await.unwrap();
        assert_eq!(
            h.orchestrator.execute_task(task.id).await,
            RunOutcome::Skipped(SkipReason::Inactive)
        );
        assert!(h.store.task_logs(task.id, 10).await.unwrap().is_empty());
        assert!(!h.orchestrator.tracker().is_running(task.id));
        assert!(h.notifier.calls.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_copy_timeout_is_recorded() {
        use crate::copy::{CommandCopyExecutor, CopyTool};

        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        let orchestrator = BackupOrchestrator::new(
            store.clone(),
            Arc::new(CommandCopyExecutor::new(CopyTool::Command {
                program: "sleep".into(),
                args: vec!["5".into()],
            })),
            Arc::new(RecordingNotifier::default()),
            Arc::new(RunTracker::new()),
        )
        .with_copy_timeout(Duration::from_millis(200));
        let dst = tempfile::tempdir().unwrap();
        let task = store
            .create_task(
                NewBackupTask {
                    name: "slow-share".into(),
                    source_path: "/tmp".into(),
                    destination_path: dst.path().display().to_string(),
                    department: "IT".into(),
                    task_type: "full".into(),
                    remarks: String::new(),
                    scheduled_time: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
                    frequency: Frequency::Weekly,
                },
                local_now(),
            )
            .await
            .unwrap();

        let outcome = orchestrator.execute_task(task.id).await;
        assert!(matches!(outcome, RunOutcome::TimedOut { .. }));
        let logs = store.task_logs(task.id, 10).await.unwrap();
        assert_eq!(logs[0].status, RunStatus::Failed);
        assert!(logs[0].message.contains("timeout"));
        assert!(!orchestrator.tracker().is_running(task.id));
    }
}
