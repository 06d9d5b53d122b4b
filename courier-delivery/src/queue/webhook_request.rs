use chrono::{DateTime, TimeDelta, Utc};
use sqlx::SqlitePool;

use super::locking::{self, Lockable};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct WebhookRequest {
    pub id: i64,
    pub server_id: i64,
    pub webhook_id: Option<i64>,
    pub url: String,
    pub event: String,
    pub uuid: String,
    /// JSON body as it will be posted.
    pub payload: String,
    pub attempts: i64,
    pub retry_after: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Last delivery error.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Lockable for WebhookRequest {
    const TABLE: &'static str = "webhook_requests";

    fn id(&self) -> i64 {
        self.id
    }

    fn attempts(&self) -> i64 {
        self.attempts
    }

    fn retry_after(&self) -> Option<DateTime<Utc>> {
        self.retry_after
    }

    fn locked_at(&self) -> Option<DateTime<Utc>> {
        self.locked_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWebhookRequest {
    pub server_id: i64,
    pub webhook_id: Option<i64>,
    pub url: String,
    pub event: String,
    pub uuid: String,
    pub payload: String,
}

pub struct WebhookRequestRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> WebhookRequestRepository<'a> {
    #[must_use]
    pub const fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewWebhookRequest) -> Result<WebhookRequest, StoreError> {
        let request = sqlx::query_as::<_, WebhookRequest>(
            "INSERT INTO webhook_requests
                (server_id, webhook_id, url, event, uuid, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(new.server_id)
        .bind(new.webhook_id)
        .bind(&new.url)
        .bind(&new.event)
        .bind(&new.uuid)
        .bind(&new.payload)
        .bind(Utc::now())
        .fetch_one(self.pool)
        .await?;

        Ok(request)
    }

    pub async fn find(&self, id: i64) -> Result<Option<WebhookRequest>, StoreError> {
        let request =
            sqlx::query_as::<_, WebhookRequest>("SELECT * FROM webhook_requests WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool)
                .await?;

        Ok(request)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM webhook_requests")
            .fetch_one(self.pool)
            .await?;

        Ok(count)
    }

    /// Claims at most one unlocked request that is due now.
    pub async fn claim_next(&self, token: &str) -> Result<Vec<WebhookRequest>, StoreError> {
        self.claim_ready_at(token, Utc::now()).await
    }

    /// Claims at most one unlocked request that is ready at `now`.
    pub async fn claim_ready_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookRequest>, StoreError> {
        locking::claim(self.pool, token, &[], now, 1).await
    }

    pub async fn record_error(&self, request: &WebhookRequest, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE webhook_requests SET error = ? WHERE id = ?")
            .bind(error)
            .bind(request.id)
            .execute(self.pool)
            .await?;

        Ok(())
    }

    pub async fn retry_later(
        &self,
        request: &WebhookRequest,
        delay: Option<TimeDelta>,
    ) -> Result<DateTime<Utc>, StoreError> {
        locking::retry_later(self.pool, request, delay).await
    }

    pub async fn unlock(&self, request: &WebhookRequest) -> Result<(), StoreError> {
        locking::unlock(self.pool, request).await
    }

    pub async fn delete(&self, request: &WebhookRequest) -> Result<(), StoreError> {
        locking::delete(self.pool, request).await
    }

    /// Deletes requests that have used up `max_attempts` or were created
    /// before `created_before`. Returns how many were removed.
    pub async fn prune(
        &self,
        max_attempts: i64,
        created_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let removed = sqlx::query("DELETE FROM webhook_requests WHERE attempts >= ? OR created_at < ?")
            .bind(max_attempts)
            .bind(created_before)
            .execute(self.pool)
            .await?
            .rows_affected();

        Ok(removed)
    }
}
