//! Bounded worker pool that executes submitted task ids.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::BackupOrchestrator;

/// Cloneable submission side of a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::UnboundedSender<i64>,
}

impl PoolHandle {
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<i64>) -> Self {
        Self { tx }
    }

    /// Queue a task for execution. Never blocks; returns false once the pool is gone.
    pub fn submit(&self, task_id: i64) -> bool {
        match self.tx.send(task_id) {
            Ok(()) => true,
            Err(_) => {
                warn!(task_id, "Worker pool is shut down, dropping execution request");
                false
            }
        }
    }
}

/// Runs `execute_task` for queued ids with at most `max_concurrent` in flight.
pub struct WorkerPool {
    handle: PoolHandle,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
}

impl WorkerPool {
    pub fn start(orchestrator: Arc<BackupOrchestrator>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(orchestrator, rx, max_concurrent, cancel.clone()));
        info!(max_concurrent, "Worker pool started");
        Self {
            handle: PoolHandle::from_sender(tx),
            cancel,
            dispatcher,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub fn submit(&self, task_id: i64) -> bool {
        self.handle.submit(task_id)
    }

    /// Stop taking queued work and wait for in-flight executions to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.dispatcher.await {
            warn!("Worker pool dispatcher ended abnormally: {e}");
        }
        info!("Worker pool stopped");
    }
}

async fn dispatch(
    orchestrator: Arc<BackupOrchestrator>,
    mut rx: mpsc::UnboundedReceiver<i64>,
    max_concurrent: usize,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent));
    let mut in_flight = JoinSet::new();

    loop {
        let task_id = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(task_id) => task_id,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let orchestrator = Arc::clone(&orchestrator);
        in_flight.spawn(async move {
            let outcome = orchestrator.execute_task(task_id).await;
            debug!(task_id, ?outcome, "Worker finished");
            drop(permit);
        });

        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use backman_types::{Frequency, NewBackupTask, RunStatus};
    use chrono::{Local, NaiveTime};

    use crate::copy::{CopyError, CopyExecutor, CopyResult};
    use crate::notifier::LogNotifier;
    use crate::store::SqliteTaskStore;
    use crate::tracker::RunTracker;

    #[derive(Default)]
    struct CountingCopier {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CopyExecutor for CountingCopier {
        async fn copy(
            &self,
            _source: &Path,
            _destination: &Path,
            _timeout: Duration,
        ) -> Result<CopyResult, CopyError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(CopyResult {
                exit_code: Some(0),
                ..Default::default()
            })
        }

        async fn folder_size_mb(&self, _path: &Path) -> f64 {
            0.0
        }
    }

    type Fixture = (
        Arc<SqliteTaskStore>,
        Arc<CountingCopier>,
        Arc<BackupOrchestrator>,
        Vec<i64>,
    );

    async fn setup(tasks: usize) -> Fixture {
        let store = Arc::new(SqliteTaskStore::open_in_memory().unwrap());
        let copier = Arc::new(CountingCopier::default());
        let orchestrator = Arc::new(BackupOrchestrator::new(
            store.clone(),
            copier.clone(),
            Arc::new(LogNotifier::default()),
            Arc::new(RunTracker::new()),
        ));
        let mut ids = Vec::new();
        for i in 0..tasks {
            let task = store
                .create_task(
                    NewBackupTask {
                        name: format!("share-{i}"),
                        source_path: format!("/data/{i}"),
                        destination_path: format!("/backup/{i}"),
                        department: "IT".into(),
                        task_type: "full".into(),
                        remarks: String::new(),
                        scheduled_time: NaiveTime::from_hms_opt(1, 0, 0).unwrap(),
                        frequency: Frequency::Daily,
                    },
                    Local::now().naive_local(),
                )
                .await
                .unwrap();
            ids.push(task.id);
        }
        (store, copier, orchestrator, ids)
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let (store, copier, orchestrator, ids) = setup(5).await;
        let pool = WorkerPool::start(orchestrator.clone(), 2);
        let handle = pool.handle();
        for id in &ids {
            assert!(handle.submit(*id));
        }

        for _ in 0..200 {
            let recent = store.recent_logs(10).await.unwrap();
            if recent.len() == 5 && recent.iter().all(|r| r.run.status == RunStatus::Success) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        pool.shutdown().await;

        let recent = store.recent_logs(10).await.unwrap();
        assert_eq!(recent.len(), 5);
        assert!(recent.iter().all(|r| r.run.status == RunStatus::Success));
        assert_eq!(copier.peak.load(Ordering::SeqCst), 2);
        assert!(orchestrator.tracker().running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_and_rejects_new_work() {
        let (store, _copier, orchestrator, ids) = setup(1).await;
        let pool = WorkerPool::start(orchestrator, 1);
        let handle = pool.handle();
        assert!(pool.submit(ids[0]));
        tokio::time::sleep(Duration::from_millis(30)).await;

        pool.shutdown().await;
        let logs = store.task_logs(ids[0], 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RunStatus::Success);

        assert!(!handle.submit(ids[0]));
    }
}
