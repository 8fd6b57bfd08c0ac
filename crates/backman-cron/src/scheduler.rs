//! Task scheduler: keeps one trigger per schedulable task and submits
//! executions to the worker pool when a trigger fires.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime, NaiveTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use backman_types::Frequency;

use crate::next_run::next_fire;
use crate::pool::PoolHandle;
use crate::repository::{Result, TaskRepository};

/// When a trigger fires: every day, every Monday, or the 1st of each month
/// at a fixed local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerRule {
    pub frequency: Frequency,
    pub at: NaiveTime,
}

impl TriggerRule {
    pub fn next_fire_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        next_fire(now, self.at, self.frequency)
    }
}

struct Trigger {
    rule: TriggerRule,
    handle: JoinHandle<()>,
}

/// Manages trigger lifecycles keyed by task id.
pub struct Scheduler {
    repo: Arc<dyn TaskRepository>,
    pool: PoolHandle,
    triggers: Mutex<HashMap<i64, Trigger>>,
}

impl Scheduler {
    pub fn new(repo: Arc<dyn TaskRepository>, pool: PoolHandle) -> Self {
        Self {
            repo,
            pool,
            triggers: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild triggers from the repository.
    ///
    /// Every active, non-paused task gets a fresh trigger replacing any
    /// existing one; triggers of tasks that are gone, inactive or paused are
    /// dropped. Safe to call repeatedly. Returns the number of live triggers.
    pub async fn refresh_all(&self) -> Result<usize> {
        let tasks = self.repo.list_active_tasks().await?;
        let schedulable: Vec<_> = tasks.into_iter().filter(|t| t.is_schedulable()).collect();
        let keep: HashSet<i64> = schedulable.iter().map(|t| t.id).collect();

        let mut triggers = self.triggers.lock().await;
        triggers.retain(|task_id, trigger| {
            let retained = keep.contains(task_id);
            if !retained {
                trigger.handle.abort();
                info!(task_id, "Removed trigger");
            }
            retained
        });

        for task in schedulable {
            let rule = TriggerRule {
                frequency: task.frequency,
                at: task.scheduled_time,
            };
            let previous = triggers.remove(&task.id).map(|old| {
                old.handle.abort();
                old.rule
            });
            let handle = tokio::spawn(run_trigger(task.id, rule, self.pool.clone()));
            triggers.insert(task.id, Trigger { rule, handle });
            if previous == Some(rule) {
                debug!(task_id = task.id, "Re-armed trigger");
            } else {
                info!(
                    task_id = task.id,
                    task = %task.name,
                    frequency = %rule.frequency,
                    at = %rule.at,
                    "Scheduled task"
                );
            }
        }

        Ok(triggers.len())
    }

    pub async fn trigger_count(&self) -> usize {
        self.triggers.lock().await.len()
    }

    /// Ids with a live trigger, sorted.
    pub async fn scheduled_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.triggers.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn trigger_rule(&self, task_id: i64) -> Option<TriggerRule> {
        self.triggers.lock().await.get(&task_id).map(|t| t.rule)
    }

    /// Abort every trigger. Executions already submitted are unaffected.
    pub async fn shutdown(&self) {
        let mut triggers = self.triggers.lock().await;
        for (_, trigger) in triggers.drain() {
            trigger.handle.abort();
        }
        info!("Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for trigger in self.triggers.get_mut().values() {
            trigger.handle.abort();
        }
    }
}

async fn run_trigger(task_id: i64, rule: TriggerRule, pool: PoolHandle) {
    // Floor for the next computation so a wall clock lagging the timer
    // cannot fire the same slot twice.
    let mut last_fire: Option<NaiveDateTime> = None;
    loop {
        let wall = Local::now().naive_local();
        let now = last_fire.map_or(wall, |fired| fired.max(wall));
        let fire_at = rule.next_fire_after(now);
        let wait = (fire_at - wall).to_std().unwrap_or_default();
        debug!(task_id, %fire_at, "Trigger armed");

        tokio::time::sleep(wait).await;

        info!(task_id, "Trigger fired");
        if !pool.submit(task_id) {
            break;
        }
        last_fire = Some(fire_at);
    }
}
