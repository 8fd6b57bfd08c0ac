//! Persistence boundary the engine talks to.

use async_trait::async_trait;
use chrono::NaiveDateTime;

use backman_types::{BackupTask, ParseError, RunFinalization, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("Invalid stored value: {0}")]
    InvalidValue(#[from] ParseError),
    #[error("Invalid stored timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),
    #[error("Task {0} not found")]
    TaskNotFound(i64),
    #[error("Run log {0} not found or already finalized")]
    RunLogNotOpen(i64),
    #[error("Task {0} is already running")]
    AlreadyRunning(i64),
    #[error("Task {0} is inactive")]
    TaskInactive(i64),
    #[error("Task {0} is paused")]
    TaskPaused(i64),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Status change applied to a task together with a run log update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatusUpdate {
    pub status: TaskStatus,
    /// Left untouched when `None`.
    pub last_run: Option<NaiveDateTime>,
    /// Left untouched when `None`.
    pub next_run: Option<NaiveDateTime>,
}

impl TaskStatusUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            last_run: None,
            next_run: None,
        }
    }

    pub fn with_next_run(mut self, next_run: NaiveDateTime) -> Self {
        self.next_run = Some(next_run);
        self
    }

    pub fn with_last_run(mut self, last_run: NaiveDateTime) -> Self {
        self.last_run = Some(last_run);
        self
    }
}

/// Durable store of task definitions and run logs, keyed by task id.
///
/// Implementations must serialize conflicting writes. `begin_run` and
/// `finish_run` default to sequential calls; transactional stores should
/// override them so a status change and its log row commit together, and
/// so `begin_run` refuses a task another process is already running
/// ([`RepositoryError::AlreadyRunning`]).
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_task(&self, id: i64) -> Result<Option<BackupTask>>;

    /// All tasks with the active flag set, paused ones included.
    async fn list_active_tasks(&self) -> Result<Vec<BackupTask>>;

    async fn update_task_status(&self, id: i64, update: TaskStatusUpdate) -> Result<()>;

    /// Open a run log row in `running` state; returns its id.
    async fn insert_run_log(&self, task_id: i64, start_time: NaiveDateTime) -> Result<i64>;

    async fn finalize_run_log(&self, log_id: i64, outcome: &RunFinalization) -> Result<()>;

    /// Mark the task running and open its run log row.
    async fn begin_run(&self, task_id: i64, start_time: NaiveDateTime) -> Result<i64> {
        self.update_task_status(
            task_id,
            TaskStatusUpdate::status(TaskStatus::Running).with_last_run(start_time),
        )
        .await?;
        self.insert_run_log(task_id, start_time).await
    }

    /// Apply the terminal task status and close the run log row.
    async fn finish_run(
        &self,
        task_id: i64,
        update: TaskStatusUpdate,
        log_id: i64,
        outcome: &RunFinalization,
    ) -> Result<()> {
        self.update_task_status(task_id, update).await?;
        self.finalize_run_log(log_id, outcome).await
    }
}
