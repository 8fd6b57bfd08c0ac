//! Run tracker: the set of task ids with an execution in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

/// Registry of currently executing task ids.
///
/// Membership is the only concurrency gate: a task id may be present at most
/// once, so at most one execution of a task is in flight. The lock is held
/// only for the set operation itself, never across a copy.
#[derive(Debug, Default)]
pub struct RunTracker {
    running: Mutex<HashSet<i64>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self) -> MutexGuard<'_, HashSet<i64>> {
        // The set has no invariant a panicking holder could break.
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert `task_id` unless it is already running. Returns whether it was inserted.
    pub fn try_acquire(&self, task_id: i64) -> bool {
        self.set().insert(task_id)
    }

    /// Remove `task_id`. Releasing an id that is not held is a no-op.
    pub fn release(&self, task_id: i64) {
        if self.set().remove(&task_id) {
            debug!(task_id, "Released run guard");
        }
    }

    /// Acquire as a guard that releases the id when dropped.
    pub fn acquire(self: &Arc<Self>, task_id: i64) -> Option<RunGuard> {
        self.try_acquire(task_id).then(|| RunGuard {
            tracker: Arc::clone(self),
            task_id,
        })
    }

    pub fn is_running(&self, task_id: i64) -> bool {
        self.set().contains(&task_id)
    }

    /// Snapshot of running ids, sorted.
    pub fn running_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.set().iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Held for the duration of one execution.
#[derive(Debug)]
pub struct RunGuard {
    tracker: Arc<RunTracker>,
    task_id: i64,
}

impl RunGuard {
    pub fn task_id(&self) -> i64 {
        self.task_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.tracker.release(self.task_id);
    }
}
