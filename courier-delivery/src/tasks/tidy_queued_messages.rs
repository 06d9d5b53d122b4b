use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::{ScheduledTask, schedule};
use crate::{Result, context::WorkerContext};

/// Removes queued messages whose lock has outlived any plausible worker.
#[derive(Debug)]
pub struct TidyQueuedMessages {
    context: WorkerContext,
}

impl TidyQueuedMessages {
    #[must_use]
    pub const fn new(context: WorkerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ScheduledTask for TidyQueuedMessages {
    fn name(&self) -> &'static str {
        "TidyQueuedMessages"
    }

    async fn call(&self) -> Result<()> {
        let locked_before = Utc::now() - self.context.settings().lock_stale_after;
        let removed = self
            .context
            .database()
            .queued_messages()
            .delete_stale_locks(locked_before)
            .await?;

        for queued in &removed {
            info!(
                "Removing queued message {} (locked at {} by {})",
                queued.id,
                queued.locked_at.map(|at| at.to_rfc3339()).unwrap_or_default(),
                queued.locked_by.as_deref().unwrap_or_default()
            );
        }

        Ok(())
    }

    fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        schedule::quarter_to_each_hour(now)
    }
}
