//! SQLite-backed task and run log storage.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use tokio::sync::Mutex;

use backman_types::{
    BackupRun, BackupTask, NewBackupTask, RunFinalization, TIME_OF_DAY_FORMAT, TIMESTAMP_FORMAT,
    TaskStatus, format_duration,
};

use crate::next_run::next_fire;
use crate::repository::{RepositoryError, Result, TaskRepository, TaskStatusUpdate};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS backup_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_name TEXT NOT NULL,
        source_path TEXT NOT NULL,
        destination_path TEXT NOT NULL,
        department TEXT NOT NULL DEFAULT '',
        task_type TEXT NOT NULL DEFAULT '',
        remarks TEXT NOT NULL DEFAULT '',
        scheduled_time TEXT NOT NULL,
        repeat_frequency TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL DEFAULT 'idle',
        paused INTEGER NOT NULL DEFAULT 0,
        last_run TEXT,
        next_run TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS backup_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL REFERENCES backup_tasks(id) ON DELETE CASCADE,
        run_time TEXT NOT NULL,
        status TEXT NOT NULL,
        log_message TEXT NOT NULL DEFAULT '',
        files_copied INTEGER,
        total_size_mb REAL,
        duration_seconds TEXT,
        error_details TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_backup_logs_task_time
        ON backup_logs (task_id, run_time DESC);";

const TASK_COLUMNS: &str = "id, task_name, source_path, destination_path, department, task_type, \
     remarks, scheduled_time, repeat_frequency, is_active, status, last_run, next_run, paused";

const LOG_COLUMNS: &str = "bl.id, bl.task_id, bl.run_time, bl.status, bl.log_message, \
     bl.files_copied, bl.total_size_mb, bl.duration_seconds, bl.error_details";

const INTERRUPTED_MESSAGE: &str = "Interrupted before completion";

/// A run log row joined with its task's name.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RecentRun {
    pub task_name: String,
    pub run: BackupRun,
}

/// Persistent storage for backup tasks and their run logs.
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;

        tracing::info!("Task store opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await?
    }

    // ─── Task Definitions ───────────────────────────────────

    /// Insert a new task. Its first due time is the next trigger firing after `now`.
    pub async fn create_task(&self, new: NewBackupTask, now: NaiveDateTime) -> Result<BackupTask> {
        let next_run = next_fire(now, new.scheduled_time, new.frequency);
        let id = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO backup_tasks
                        (task_name, source_path, destination_path, department, task_type,
                         remarks, scheduled_time, repeat_frequency, next_run, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        new.name,
                        new.source_path,
                        new.destination_path,
                        new.department,
                        new.task_type,
                        new.remarks,
                        fmt_time(new.scheduled_time),
                        new.frequency.as_str(),
                        fmt_ts(next_run),
                        fmt_ts(now),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        self.get_task(id)
            .await?
            .ok_or(RepositoryError::TaskNotFound(id))
    }

    /// Replace a task's definition and recompute its next due time.
    pub async fn update_task(
        &self,
        id: i64,
        edit: NewBackupTask,
        now: NaiveDateTime,
    ) -> Result<BackupTask> {
        let next_run = next_fire(now, edit.scheduled_time, edit.frequency);
        let changed = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "UPDATE backup_tasks SET
                        task_name = ?1, source_path = ?2, destination_path = ?3,
                        department = ?4, task_type = ?5, remarks = ?6,
                        scheduled_time = ?7, repeat_frequency = ?8, next_run = ?9
                     WHERE id = ?10",
                    rusqlite::params![
                        edit.name,
                        edit.source_path,
                        edit.destination_path,
                        edit.department,
                        edit.task_type,
                        edit.remarks,
                        fmt_time(edit.scheduled_time),
                        edit.frequency.as_str(),
                        fmt_ts(next_run),
                        id,
                    ],
                )?)
            })
            .await?;
        if changed == 0 {
            return Err(RepositoryError::TaskNotFound(id));
        }
        self.get_task(id)
            .await?
            .ok_or(RepositoryError::TaskNotFound(id))
    }

    /// All tasks, active first, soonest due first.
    pub async fn list_tasks(&self) -> Result<Vec<BackupTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM backup_tasks
                 ORDER BY is_active DESC, next_run IS NULL, next_run ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map([], TaskRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    /// Set the active flag. Returns false if the task does not exist.
    pub async fn set_active(&self, id: i64, active: bool) -> Result<bool> {
        self.with_conn(move |conn| {
            let count = conn.execute(
                "UPDATE backup_tasks SET is_active = ?1 WHERE id = ?2",
                rusqlite::params![active as i64, id],
            )?;
            Ok(count > 0)
        })
        .await
    }

    /// Pause or resume a task. Returns false if the task does not exist.
    ///
    /// The pause flag is kept apart from the run status, so a run in flight
    /// keeps its claim and finishing it does not clear the pause. A paused
    /// task reads back as [`TaskStatus::Paused`].
    pub async fn set_paused(&self, id: i64, paused: bool) -> Result<bool> {
        self.with_conn(move |conn| {
            let count = conn.execute(
                "UPDATE backup_tasks
                 SET paused = ?1,
                     status = CASE WHEN status = 'paused' THEN 'idle' ELSE status END
                 WHERE id = ?2",
                rusqlite::params![paused as i64, id],
            )?;
            Ok(count > 0)
        })
        .await
    }

    // ─── Run Logs ───────────────────────────────────────────

    /// Most recent run logs of one task, newest first.
    pub async fn task_logs(&self, task_id: i64, limit: usize) -> Result<Vec<BackupRun>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LOG_COLUMNS} FROM backup_logs bl
                 WHERE bl.task_id = ?1
                 ORDER BY bl.run_time DESC, bl.id DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![task_id, limit as i64], LogRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(LogRow::into_run).collect()
        })
        .await
    }

    /// Most recent run logs across all tasks, newest first.
    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<RecentRun>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LOG_COLUMNS}, bt.task_name FROM backup_logs bl
                 JOIN backup_tasks bt ON bl.task_id = bt.id
                 ORDER BY bl.run_time DESC, bl.id DESC
                 LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![limit as i64], |row| {
                    Ok((LogRow::from_row(row)?, row.get::<_, String>(9)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(log, task_name)| {
                    Ok(RecentRun {
                        task_name,
                        run: log.into_run()?,
                    })
                })
                .collect()
        })
        .await
    }

    /// Delete finalized run logs that started before `cutoff`. Returns the count removed.
    pub async fn prune_logs(&self, cutoff: NaiveDateTime) -> Result<usize> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM backup_logs WHERE run_time < ?1 AND status != 'running'",
                rusqlite::params![fmt_ts(cutoff)],
            )?)
        })
        .await
    }

    /// Close run logs left open by a process that died mid-run.
    ///
    /// Only logs opened before `stale_before` are touched; pick a cutoff no
    /// live run can precede (the copy timeout bounds every run). Those logs
    /// become `failed`, and tasks still claimed as `running` without any open
    /// log are released as `failed`. Returns the number of run logs closed.
    pub async fn recover_interrupted_runs(&self, stale_before: NaiveDateTime) -> Result<usize> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let closed = tx.execute(
                "UPDATE backup_logs
                 SET status = 'failed', log_message = ?1,
                     error_details = 'process exited while the run was in progress'
                 WHERE status = 'running' AND run_time < ?2",
                rusqlite::params![INTERRUPTED_MESSAGE, fmt_ts(stale_before)],
            )?;
            tx.execute(
                "UPDATE backup_tasks SET status = 'failed'
                 WHERE status = 'running'
                   AND NOT EXISTS (
                       SELECT 1 FROM backup_logs bl
                       WHERE bl.task_id = backup_tasks.id AND bl.status = 'running'
                   )",
                [],
            )?;
            tx.commit()?;
            Ok(closed)
        })
        .await
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskStore {
    async fn get_task(&self, id: i64) -> Result<Option<BackupTask>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM backup_tasks WHERE id = ?1"),
                    rusqlite::params![id],
                    TaskRow::from_row,
                )
                .optional()?;
            row.map(TaskRow::into_task).transpose()
        })
        .await
    }

    async fn list_active_tasks(&self) -> Result<Vec<BackupTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM backup_tasks WHERE is_active = 1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([], TaskRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    async fn update_task_status(&self, id: i64, update: TaskStatusUpdate) -> Result<()> {
        self.with_conn(move |conn| apply_status(conn, id, update))
            .await
    }

    async fn insert_run_log(&self, task_id: i64, start_time: NaiveDateTime) -> Result<i64> {
        self.with_conn(move |conn| open_run_log(conn, task_id, start_time))
            .await
    }

    async fn finalize_run_log(&self, log_id: i64, outcome: &RunFinalization) -> Result<()> {
        let outcome = outcome.clone();
        self.with_conn(move |conn| close_run_log(conn, log_id, &outcome))
            .await
    }

    /// Claims the task in the database, so two processes sharing the file
    /// cannot run the same task at once.
    async fn begin_run(&self, task_id: i64, start_time: NaiveDateTime) -> Result<i64> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            claim_run(&tx, task_id, start_time)?;
            let log_id = open_run_log(&tx, task_id, start_time)?;
            tx.commit()?;
            Ok(log_id)
        })
        .await
    }

    async fn finish_run(
        &self,
        task_id: i64,
        update: TaskStatusUpdate,
        log_id: i64,
        outcome: &RunFinalization,
    ) -> Result<()> {
        let outcome = outcome.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            apply_status(&tx, task_id, update)?;
            close_run_log(&tx, log_id, &outcome)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn apply_status(conn: &Connection, id: i64, update: TaskStatusUpdate) -> Result<()> {
    let count = conn.execute(
        "UPDATE backup_tasks
         SET status = ?1,
             last_run = COALESCE(?2, last_run),
             next_run = COALESCE(?3, next_run)
         WHERE id = ?4",
        rusqlite::params![
            update.status.as_str(),
            update.last_run.map(fmt_ts),
            update.next_run.map(fmt_ts),
            id,
        ],
    )?;
    if count == 0 {
        return Err(RepositoryError::TaskNotFound(id));
    }
    Ok(())
}

/// Flip the task to `running` unless another run holds it or it may not run.
fn claim_run(conn: &Connection, task_id: i64, start_time: NaiveDateTime) -> Result<()> {
    let claimed = conn.execute(
        "UPDATE backup_tasks SET status = 'running', last_run = ?2
         WHERE id = ?1 AND status != 'running' AND is_active = 1 AND paused = 0",
        rusqlite::params![task_id, fmt_ts(start_time)],
    )?;
    if claimed > 0 {
        return Ok(());
    }

    let state = conn
        .query_row(
            "SELECT status, is_active, paused FROM backup_tasks WHERE id = ?1",
            rusqlite::params![task_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? != 0,
                    row.get::<_, i64>(2)? != 0,
                ))
            },
        )
        .optional()?;
    Err(match state {
        None => RepositoryError::TaskNotFound(task_id),
        Some((status, _, _)) if status == TaskStatus::Running.as_str() => {
            RepositoryError::AlreadyRunning(task_id)
        }
        Some((_, false, _)) => RepositoryError::TaskInactive(task_id),
        Some(_) => RepositoryError::TaskPaused(task_id),
    })
}

fn open_run_log(conn: &Connection, task_id: i64, start_time: NaiveDateTime) -> Result<i64> {
    let count = conn.execute(
        "INSERT INTO backup_logs (task_id, run_time, status, log_message)
         SELECT id, ?2, 'running', 'Starting backup: ' || task_name
         FROM backup_tasks WHERE id = ?1",
        rusqlite::params![task_id, fmt_ts(start_time)],
    )?;
    if count == 0 {
        return Err(RepositoryError::TaskNotFound(task_id));
    }
    Ok(conn.last_insert_rowid())
}

fn close_run_log(conn: &Connection, log_id: i64, outcome: &RunFinalization) -> Result<()> {
    let count = conn.execute(
        "UPDATE backup_logs
         SET status = ?1, log_message = ?2, files_copied = ?3, total_size_mb = ?4,
             duration_seconds = ?5, error_details = ?6
         WHERE id = ?7 AND status = 'running'",
        rusqlite::params![
            outcome.status.as_str(),
            outcome.message,
            outcome.files_copied.map(|n| i64::try_from(n).unwrap_or(i64::MAX)),
            outcome.total_size_mb,
            outcome.duration.map(format_duration),
            outcome.error_details,
            log_id,
        ],
    )?;
    if count == 0 {
        return Err(RepositoryError::RunLogNotOpen(log_id));
    }
    Ok(())
}

/// Bring databases created before the pause flag existed up to date.
fn migrate(conn: &Connection) -> Result<()> {
    let has_paused = conn
        .prepare("SELECT 1 FROM pragma_table_info('backup_tasks') WHERE name = 'paused'")?
        .exists([])?;
    if !has_paused {
        conn.execute_batch(
            "ALTER TABLE backup_tasks ADD COLUMN paused INTEGER NOT NULL DEFAULT 0;
             UPDATE backup_tasks SET paused = 1, status = 'idle' WHERE status = 'paused';",
        )?;
    }
    Ok(())
}

fn fmt_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn fmt_time(time: NaiveTime) -> String {
    time.format(TIME_OF_DAY_FORMAT).to_string()
}

fn parse_ts(text: &str) -> Result<NaiveDateTime> {
    Ok(NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)?)
}

/// Raw `backup_tasks` row; enum and time columns are validated in `into_task`.
struct TaskRow {
    id: i64,
    name: String,
    source_path: String,
    destination_path: String,
    department: String,
    task_type: String,
    remarks: String,
    scheduled_time: String,
    frequency: String,
    is_active: bool,
    status: String,
    last_run: Option<String>,
    next_run: Option<String>,
    paused: bool,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            source_path: row.get(2)?,
            destination_path: row.get(3)?,
            department: row.get(4)?,
            task_type: row.get(5)?,
            remarks: row.get(6)?,
            scheduled_time: row.get(7)?,
            frequency: row.get(8)?,
            is_active: row.get::<_, i64>(9)? != 0,
            status: row.get(10)?,
            last_run: row.get(11)?,
            next_run: row.get(12)?,
            paused: row.get::<_, i64>(13)? != 0,
        })
    }

    fn into_task(self) -> Result<BackupTask> {
        let status: TaskStatus = self.status.parse()?;
        Ok(BackupTask {
            id: self.id,
            name: self.name,
            source_path: self.source_path,
            destination_path: self.destination_path,
            department: self.department,
            task_type: self.task_type,
            remarks: self.remarks,
            scheduled_time: NaiveTime::parse_from_str(&self.scheduled_time, TIME_OF_DAY_FORMAT)?,
            frequency: self.frequency.parse()?,
            is_active: self.is_active,
            status: if self.paused { TaskStatus::Paused } else { status },
            last_run: self.last_run.as_deref().map(parse_ts).transpose()?,
            next_run: self.next_run.as_deref().map(parse_ts).transpose()?,
        })
    }
}

/// Raw `backup_logs` row.
struct LogRow {
    id: i64,
    task_id: i64,
    run_time: String,
    status: String,
    message: String,
    files_copied: Option<i64>,
    total_size_mb: Option<f64>,
    duration: Option<String>,
    error_details: Option<String>,
}

impl LogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            run_time: row.get(2)?,
            status: row.get(3)?,
            message: row.get(4)?,
            files_copied: row.get(5)?,
            total_size_mb: row.get(6)?,
            duration: row.get(7)?,
            error_details: row.get(8)?,
        })
    }

    fn into_run(self) -> Result<BackupRun> {
        Ok(BackupRun {
            id: self.id,
            task_id: self.task_id,
            run_time: parse_ts(&self.run_time)?,
            status: self.status.parse()?,
            message: self.message,
            files_copied: self.files_copied.map(|n| u64::try_from(n).unwrap_or(0)),
            total_size_mb: self.total_size_mb,
            duration: self.duration,
            error_details: self.error_details,
        })
    }
}
