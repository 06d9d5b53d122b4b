//! Maintenance work run on a rough schedule by whichever worker holds the
//! `tasks` role.
//!
//! Role arbitration is best effort, so two workers can briefly run the same
//! task. Every task must be safe to run twice.

mod prune_webhook_requests;
pub mod schedule;
mod tidy_queued_messages;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

pub use prune_webhook_requests::{MAX_WEBHOOK_ATTEMPTS, PruneWebhookRequests};
pub use tidy_queued_messages::TidyQueuedMessages;

use crate::{Result, context::WorkerContext, queue::Database};

/// Name of the worker role that gates scheduled tasks.
pub const TASKS_ROLE: &str = "tasks";

#[async_trait]
pub trait ScheduledTask: Send + Sync {
    /// Unique name, used as the key of the task's schedule record.
    fn name(&self) -> &'static str;

    async fn call(&self) -> Result<()>;

    /// When the task should next run, given that it is now `now`.
    fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        schedule::quarter_past_each_hour(now)
    }
}

/// Every built-in task.
#[must_use]
pub fn builtin(context: &WorkerContext) -> Vec<Box<dyn ScheduledTask>> {
    vec![
        Box::new(PruneWebhookRequests::new(context.clone())),
        Box::new(TidyQueuedMessages::new(context.clone())),
    ]
}

/// What happened when a due task was run.
#[derive(Debug)]
pub struct TaskRun {
    pub elapsed: Duration,
    pub outcome: Result<()>,
    pub next_run_after: DateTime<Utc>,
}

/// Runs `task` if its next run time has passed and schedules the next run,
/// whether or not the call succeeded.
///
/// Returns `None` when the task was not due. Errors are from the schedule
/// record only; the task's own failure is in [`TaskRun::outcome`].
pub async fn run_if_due(database: &Database, task: &dyn ScheduledTask) -> Result<Option<TaskRun>> {
    let repo = database.scheduled_tasks();
    let now = Utc::now();

    let record = repo.find_or_create(task.name(), task.next_run_after(now)).await?;
    if !record.is_due_at(now) {
        return Ok(None);
    }

    info!(task = task.name(), "Running task");
    let started = Instant::now();
    let outcome = task.call().await;
    let elapsed = started.elapsed();

    let next_run_after = task.next_run_after(Utc::now());
    repo.set_next_run_after(task.name(), next_run_after).await?;
    info!(task = task.name(), %next_run_after, "Scheduled next run");

    Ok(Some(TaskRun {
        elapsed,
        outcome,
        next_run_after,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::DeliveryError;

    struct CountingTask {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingTask {
        const fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl ScheduledTask for CountingTask {
        fn name(&self) -> &'static str {
            "CountingTask"
        }

        async fn call(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DeliveryError::Collaborator("boom".to_string()));
            }
            Ok(())
        }
    }

    async fn database() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_path(&dir.path().join("queue.db"), 2)
            .await
            .unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_runs_only_when_due() {
        let (_dir, db) = database().await;
        let task = CountingTask::new(false);

        let past = Utc::now() - TimeDelta::minutes(1);
        db.scheduled_tasks().find_or_create(task.name(), past).await.unwrap();

        let run = run_if_due(&db, &task).await.unwrap().unwrap();
        assert!(run.outcome.is_ok());
        assert_eq!(task.calls.load(Ordering::SeqCst), 1);

        let record = db.scheduled_tasks().find(task.name()).await.unwrap().unwrap();
        assert_eq!(record.next_run_after, run.next_run_after);
        assert!(record.next_run_after > Utc::now());

        assert!(run_if_due(&db, &task).await.unwrap().is_none());
        assert_eq!(task.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_new_task_waits_for_first_slot() {
        let (_dir, db) = database().await;
        let task = CountingTask::new(false);

        assert!(run_if_due(&db, &task).await.unwrap().is_none());
        assert_eq!(task.calls.load(Ordering::SeqCst), 0);
        assert!(db.scheduled_tasks().find(task.name()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_task_is_still_rescheduled() {
        let (_dir, db) = database().await;
        let task = CountingTask::new(true);
        db.scheduled_tasks()
            .find_or_create(task.name(), Utc::now() - TimeDelta::minutes(1))
            .await
            .unwrap();

        let run = run_if_due(&db, &task).await.unwrap().unwrap();
        assert!(run.outcome.is_err());
        assert!(run_if_due(&db, &task).await.unwrap().is_none());
    }
}
