use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::ScheduledTask;
use crate::{Result, context::WorkerContext};

/// Requests with this many attempts will not be retried.
pub const MAX_WEBHOOK_ATTEMPTS: i64 = 5;

/// Deletes webhook requests that are exhausted or past retention.
#[derive(Debug)]
pub struct PruneWebhookRequests {
    context: WorkerContext,
}

impl PruneWebhookRequests {
    #[must_use]
    pub const fn new(context: WorkerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ScheduledTask for PruneWebhookRequests {
    fn name(&self) -> &'static str {
        "PruneWebhookRequests"
    }

    async fn call(&self) -> Result<()> {
        let created_before = Utc::now() - self.context.settings().webhook_retention;
        let removed = self
            .context
            .database()
            .webhook_requests()
            .prune(MAX_WEBHOOK_ATTEMPTS, created_before)
            .await?;

        info!(removed, "Pruned webhook requests");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeDelta;
    use courier_common::identity::ProcessIdentity;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        DeliverySettings, MemoryMessageStore,
        queue::{Database, NewWebhookRequest},
        testing::StaticResolver,
    };

    #[tokio::test]
    async fn test_prunes_exhausted_and_expired() {
        let dir = tempfile::tempdir().unwrap();
        let database = Database::open_path(&dir.path().join("queue.db"), 2)
            .await
            .unwrap();
        let context = WorkerContext::new(
            ProcessIdentity::new("mx1.example.com", 42),
            database,
            Arc::new(MemoryMessageStore::new()),
            Arc::new(StaticResolver::default()),
            DeliverySettings::default(),
        );
        let repo = context.database().webhook_requests();

        let mut ids = Vec::new();
        for event in ["MessageSent", "MessageBounced", "MessageHeld"] {
            let request = repo
                .create(&NewWebhookRequest {
                    server_id: 1,
                    webhook_id: None,
                    url: "https://hooks.example.com".to_string(),
                    event: event.to_string(),
                    uuid: event.to_lowercase(),
                    payload: "{}".to_string(),
                })
                .await
                .unwrap();
            ids.push(request.id);
        }
        sqlx::query("UPDATE webhook_requests SET attempts = 5 WHERE id = ?")
            .bind(ids[0])
            .execute(context.database().pool())
            .await
            .unwrap();
        sqlx::query("UPDATE webhook_requests SET created_at = ? WHERE id = ?")
            .bind(Utc::now() - TimeDelta::days(8))
            .bind(ids[1])
            .execute(context.database().pool())
            .await
            .unwrap();

        PruneWebhookRequests::new(context.clone()).call().await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 1);
        assert!(repo.find(ids[2]).await.unwrap().is_some());
    }
}
