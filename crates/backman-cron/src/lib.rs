//! backman-cron: Scheduled backup execution.
//!
//! Keeps one trigger per active task, hands due tasks to a bounded worker
//! pool, and runs each backup through an external copy program while
//! recording status and run logs in SQLite.

pub mod copy;
pub mod next_run;
pub mod notifier;
pub mod orchestrator;
pub mod pool;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod tracker;

pub use copy::{CommandCopyExecutor, CopyError, CopyExecutor, CopyResult, CopyTool};
pub use next_run::{next_fire, next_run};
pub use notifier::{LogNotifier, Notifier};
pub use orchestrator::{BackupOrchestrator, RunOutcome, SkipReason};
pub use pool::{PoolHandle, WorkerPool};
pub use repository::{RepositoryError, TaskRepository, TaskStatusUpdate};
pub use scheduler::{Scheduler, TriggerRule};
pub use service::{BackupService, build_orchestrator, retention_cutoff, stale_run_cutoff};
pub use store::{RecentRun, SqliteTaskStore};
pub use tracker::{RunGuard, RunTracker};
