//! Queued message rows: one per message awaiting delivery.

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::SqlitePool;

use super::locking::{self, Condition, Lockable};
use crate::{
    error::StoreError,
    model::{Message, MessageScope, Route, RouteEndpoint, RouteMode},
};

/// Claims skip rows whose retry time is less than this far in the past.
pub const MESSAGE_READY_WINDOW: TimeDelta = TimeDelta::seconds(30);

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QueuedMessage {
    pub id: i64,
    pub server_id: i64,
    pub message_id: i64,
    /// Recipient domain.
    pub domain: String,
    /// Pinned egress address.
    pub ip_address_id: Option<i64>,
    pub route_id: Option<i64>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
    pub attempts: i64,
    /// Queued by hand, e.g. released from hold.
    pub manual: bool,
    /// Rows sharing a key can go out over one connection.
    pub batch_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Lockable for QueuedMessage {
    const TABLE: &'static str = "queued_messages";

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
pub struct NewQueuedMessage {
    pub server_id: i64,
    pub message_id: i64,
    pub domain: String,
    pub ip_address_id: Option<i64>,
    pub route_id: Option<i64>,
    pub manual: bool,
    pub batch_key: Option<String>,
}

impl NewQueuedMessage {
    #[must_use]
    pub fn for_message(message: &Message, route: Option<&Route>) -> Self {
        Self {
            server_id: message.server_id,
            message_id: message.id,
            domain: message.recipient_domain().to_string(),
            ip_address_id: None,
            route_id: message.route_id,
            manual: false,
            batch_key: batch_key(message, route),
        }
    }
}

/// Groups messages that can share a connection: outgoing mail by recipient
/// domain, incoming mail by route and endpoint.
#[must_use]
pub fn batch_key(message: &Message, route: Option<&Route>) -> Option<String> {
    match message.scope {
        MessageScope::Outgoing => Some(format!("outgoing-{}", message.recipient_domain())),
        MessageScope::Incoming => {
            let route_id = route.map_or(String::new(), |route| route.id.to_string());
            let (endpoint_id, endpoint_type) = match route.map(|route| &route.mode) {
                Some(RouteMode::Endpoint(endpoint)) => match endpoint {
                    RouteEndpoint::Smtp(smtp) => (smtp.id.to_string(), "SMTPEndpoint"),
                    RouteEndpoint::Http(http) => (http.id.to_string(), "HTTPEndpoint"),
                    RouteEndpoint::Address(address) => (address.id.to_string(), "AddressEndpoint"),
                    RouteEndpoint::Unsupported(_) => (String::new(), ""),
                },
                _ => (String::new(), ""),
            };
            Some(format!("incoming-rt:{route_id}-ep:{endpoint_id}-{endpoint_type}"))
        }
        MessageScope::Other(_) => None,
    }
}

pub struct QueuedMessageRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> QueuedMessageRepository<'a> {
    #[must_use]
    pub const fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewQueuedMessage) -> Result<QueuedMessage, StoreError> {
        let queued = sqlx::query_as::<_, QueuedMessage>(
            "INSERT INTO queued_messages
                (server_id, message_id, domain, ip_address_id, route_id, manual, batch_key, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(new.server_id)
        .bind(new.message_id)
        .bind(&new.domain)
        .bind(new.ip_address_id)
        .bind(new.route_id)
        .bind(new.manual)
        .bind(&new.batch_key)
        .bind(Utc::now())
        .fetch_one(self.pool)
        .await?;

        Ok(queued)
    }

    pub async fn find(&self, id: i64) -> Result<Option<QueuedMessage>, StoreError> {
        let queued = sqlx::query_as::<_, QueuedMessage>("SELECT * FROM queued_messages WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        Ok(queued)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM queued_messages")
            .fetch_one(self.pool)
            .await?;

        Ok(count)
    }

    /// Claims one ready row pinned to no egress address or to one of
    /// `ip_address_ids`.
    pub async fn claim_next(
        &self,
        token: &str,
        ip_address_ids: &[i64],
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        locking::claim(
            self.pool,
            token,
            &[Condition::NullOrAnyOf("ip_address_id", ip_address_ids)],
            Utc::now() - MESSAGE_READY_WINDOW,
            1,
        )
        .await
    }

    /// Claims up to `limit` more ready rows that can share a connection with
    /// `queued`, which must already be locked.
    pub async fn claim_batch(
        &self,
        token: &str,
        queued: &QueuedMessage,
        limit: i64,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        if !queued.is_locked() {
            return Err(StoreError::NotLocked(queued.id));
        }

        let Some(batch_key) = queued.batch_key.as_deref() else {
            return Ok(Vec::new());
        };

        locking::claim(
            self.pool,
            token,
            &[
                Condition::TextIs("batch_key", batch_key),
                Condition::Is("ip_address_id", queued.ip_address_id),
            ],
            Utc::now() - MESSAGE_READY_WINDOW,
            limit,
        )
        .await
    }

    pub async fn unlock(&self, queued: &QueuedMessage) -> Result<(), StoreError> {
        locking::unlock(self.pool, queued).await
    }

    pub async fn retry_later(
        &self,
        queued: &QueuedMessage,
        delay: Option<TimeDelta>,
    ) -> Result<DateTime<Utc>, StoreError> {
        locking::retry_later(self.pool, queued, delay).await
    }

    pub async fn delete(&self, queued: &QueuedMessage) -> Result<(), StoreError> {
        locking::delete(self.pool, queued).await
    }

    /// Deletes rows locked before `locked_before` and returns them.
    pub async fn delete_stale_locks(
        &self,
        locked_before: DateTime<Utc>,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        let stale = sqlx::query_as::<_, QueuedMessage>(
            "DELETE FROM queued_messages WHERE locked_at IS NOT NULL AND locked_at < ? RETURNING *",
        )
        .bind(locked_before)
        .fetch_all(self.pool)
        .await?;

        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        model::{HttpEndpoint, MessageScope},
        queue::Database,
        testing,
    };

    async fn database() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_path(&dir.path().join("queue.db"), 4)
            .await
            .unwrap();
        (dir, db)
    }

    fn new_row(message_id: i64, batch_key: Option<&str>) -> NewQueuedMessage {
        NewQueuedMessage {
            server_id: 1,
            message_id,
            domain: "example.com".to_string(),
            ip_address_id: None,
            route_id: None,
            manual: false,
            batch_key: batch_key.map(str::to_string),
        }
    }

    async fn set_retry_after(db: &Database, id: i64, retry_after: DateTime<Utc>) {
        sqlx::query("UPDATE queued_messages SET retry_after = ? WHERE id = ?")
            .bind(retry_after)
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[test]
    fn test_batch_keys() {
        let mut message = testing::message(1, "bob@example.com");
        message.scope = MessageScope::Outgoing;
        assert_eq!(batch_key(&message, None).as_deref(), Some("outgoing-example.com"));

        message.scope = MessageScope::Incoming;
        let route = Route {
            id: 4,
            name: "support".to_string(),
            mode: RouteMode::Endpoint(RouteEndpoint::Http(HttpEndpoint::new(9, "https://example.com/hook"))),
        };
        assert_eq!(
            batch_key(&message, Some(&route)).as_deref(),
            Some("incoming-rt:4-ep:9-HTTPEndpoint")
        );

        message.scope = MessageScope::Other("internal".to_string());
        assert_eq!(batch_key(&message, None), None);
    }

    #[tokio::test]
    async fn test_claim_respects_ready_window() {
        let (_dir, db) = database().await;
        let repo = db.queued_messages();

        let due_long_ago = repo.create(&new_row(1, None)).await.unwrap();
        let due_just_now = repo.create(&new_row(2, None)).await.unwrap();
        set_retry_after(&db, due_long_ago.id, Utc::now() - TimeDelta::minutes(5)).await;
        set_retry_after(&db, due_just_now.id, Utc::now() - TimeDelta::seconds(5)).await;

        let claimed = repo.claim_next("worker-a 01", &[]).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due_long_ago.id);
        assert_eq!(claimed[0].locked_by.as_deref(), Some("worker-a 01"));

        assert!(repo.claim_next("worker-a 02", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_filters_egress_addresses() {
        let (_dir, db) = database().await;
        let repo = db.queued_messages();

        let mut pinned = new_row(1, None);
        pinned.ip_address_id = Some(7);
        let pinned = repo.create(&pinned).await.unwrap();

        assert!(repo.claim_next("worker-a 01", &[3]).await.unwrap().is_empty());

        let claimed = repo.claim_next("worker-a 02", &[3, 7]).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, pinned.id);
    }

    #[tokio::test]
    async fn test_retry_later_and_unlock() {
        let (_dir, db) = database().await;
        let repo = db.queued_messages();

        repo.create(&new_row(1, None)).await.unwrap();
        let claimed = repo.claim_next("worker-a 01", &[]).await.unwrap().remove(0);
        assert!(claimed.is_locked());

        let before = Utc::now();
        repo.retry_later(&claimed, None).await.unwrap();

        let retried = repo.find(claimed.id).await.unwrap().unwrap();
        assert_eq!(retried.attempts, 1);
        assert!(!retried.is_locked());
        assert_eq!(retried.locked_by, None);

        let retry_after = retried.retry_after.unwrap();
        assert!(retry_after >= before + TimeDelta::minutes(5));
        assert!(retry_after <= Utc::now() + TimeDelta::minutes(5));
        assert!(!retried.is_ready());

        repo.unlock(&retried).await.unwrap();
        let unlocked = repo.find(claimed.id).await.unwrap().unwrap();
        assert_eq!(unlocked.attempts, 1);
        assert_eq!(unlocked.retry_after, retried.retry_after);
    }

    #[tokio::test]
    async fn test_claim_batch() {
        let (_dir, db) = database().await;
        let repo = db.queued_messages();

        for message_id in 1..=3 {
            repo.create(&new_row(message_id, Some("outgoing-example.com")))
                .await
                .unwrap();
        }
        repo.create(&new_row(4, Some("outgoing-example.org")))
            .await
            .unwrap();
        let mut pinned = new_row(5, Some("outgoing-example.com"));
        pinned.ip_address_id = Some(2);
        repo.create(&pinned).await.unwrap();

        let first = repo.claim_next("worker-a 01", &[2]).await.unwrap().remove(0);

        let unlocked = repo.find(2).await.unwrap().unwrap();
        assert!(matches!(
            repo.claim_batch("worker-a 01", &unlocked, 100).await,
            Err(StoreError::NotLocked(2))
        ));

        let batch = repo.claim_batch("worker-a 01b", &first, 100).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|row| row.message_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_delete_stale_locks() {
        let (_dir, db) = database().await;
        let repo = db.queued_messages();

        repo.create(&new_row(1, None)).await.unwrap();
        repo.create(&new_row(2, None)).await.unwrap();
        repo.claim_next("worker-a 01", &[]).await.unwrap();

        sqlx::query("UPDATE queued_messages SET locked_at = ? WHERE message_id = 1")
            .bind(Utc::now() - TimeDelta::days(2))
            .execute(db.pool())
            .await
            .unwrap();

        let removed = repo
            .delete_stale_locks(Utc::now() - TimeDelta::days(1))
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].message_id, 1);
        assert_eq!(repo.count().await.unwrap(), 1);
    }
}
