//! Advisory leadership markers.
//!
//! One row per role. This is not a lock in any strict sense: two workers can
//! briefly both believe they hold a role when one steals it from a holder that
//! was only slow, so whatever runs under a role must be idempotent.

use chrono::{TimeDelta, Utc};
use sqlx::SqlitePool;

use crate::error::StoreError;

/// A holder that has not renewed for this long can be displaced.
pub const STALE_ROLE_AFTER: TimeDelta = TimeDelta::minutes(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleAcquisition {
    /// We already held the role and refreshed it.
    Renewed,
    /// The previous holder had gone stale.
    Stolen,
    /// Nobody held the role.
    Created,
    /// Someone else holds it.
    NotAcquired,
}

impl RoleAcquisition {
    #[must_use]
    pub const fn is_acquired(self) -> bool {
        !matches!(self, Self::NotAcquired)
    }
}

pub struct WorkerRoleRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> WorkerRoleRepository<'a> {
    #[must_use]
    pub const fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Renews, steals or creates `role` for `worker`, in that order.
    pub async fn acquire(&self, role: &str, worker: &str) -> Result<RoleAcquisition, StoreError> {
        let now = Utc::now();

        let renewed = sqlx::query("UPDATE worker_roles SET acquired_at = ? WHERE role = ? AND worker = ?")
            .bind(now)
            .bind(role)
            .bind(worker)
            .execute(self.pool)
            .await?
            .rows_affected();
        if renewed > 0 {
            return Ok(RoleAcquisition::Renewed);
        }

        let stolen = sqlx::query(
            "UPDATE worker_roles SET acquired_at = ?, worker = ?
             WHERE role = ? AND (acquired_at IS NULL OR acquired_at < ?)",
        )
        .bind(now)
        .bind(worker)
        .bind(role)
        .bind(now - STALE_ROLE_AFTER)
        .execute(self.pool)
        .await?
        .rows_affected();
        if stolen > 0 {
            return Ok(RoleAcquisition::Stolen);
        }

        let created = sqlx::query(
            "INSERT INTO worker_roles (role, worker, acquired_at) VALUES (?, ?, ?)
             ON CONFLICT(role) DO NOTHING",
        )
        .bind(role)
        .bind(worker)
        .bind(now)
        .execute(self.pool)
        .await?
        .rows_affected();

        Ok(if created > 0 {
            RoleAcquisition::Created
        } else {
            RoleAcquisition::NotAcquired
        })
    }

    /// Gives up `role` if `worker` holds it. Returns whether anything was
    /// released.
    pub async fn release(&self, role: &str, worker: &str) -> Result<bool, StoreError> {
        let released = sqlx::query("DELETE FROM worker_roles WHERE role = ? AND worker = ?")
            .bind(role)
            .bind(worker)
            .execute(self.pool)
            .await?
            .rows_affected();

        Ok(released > 0)
    }

    /// Current holder of `role`.
    pub async fn holder(&self, role: &str) -> Result<Option<String>, StoreError> {
        let worker = sqlx::query_scalar::<_, Option<String>>(
            "SELECT worker FROM worker_roles WHERE role = ?",
        )
        .bind(role)
        .fetch_optional(self.pool)
        .await?;

        Ok(worker.flatten())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::queue::Database;

    async fn database() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_path(&dir.path().join("queue.db"), 2)
            .await
            .unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_acquire_lifecycle() {
        let (_dir, db) = database().await;
        let roles = db.worker_roles();

        assert_eq!(roles.acquire("tasks", "host:a pid:1").await.unwrap(), RoleAcquisition::Created);
        assert_eq!(roles.acquire("tasks", "host:a pid:1").await.unwrap(), RoleAcquisition::Renewed);
        assert_eq!(
            roles.acquire("tasks", "host:b pid:2").await.unwrap(),
            RoleAcquisition::NotAcquired
        );
        assert_eq!(roles.holder("tasks").await.unwrap().as_deref(), Some("host:a pid:1"));
    }

    #[tokio::test]
    async fn test_stale_holder_is_displaced() {
        let (_dir, db) = database().await;
        let roles = db.worker_roles();

        roles.acquire("tasks", "host:a pid:1").await.unwrap();
        sqlx::query("UPDATE worker_roles SET acquired_at = ?")
            .bind(Utc::now() - TimeDelta::minutes(6))
            .execute(db.pool())
            .await
            .unwrap();

        assert_eq!(roles.acquire("tasks", "host:b pid:2").await.unwrap(), RoleAcquisition::Stolen);
        assert_eq!(roles.holder("tasks").await.unwrap().as_deref(), Some("host:b pid:2"));
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let (_dir, db) = database().await;
        let roles = db.worker_roles();

        roles.acquire("tasks", "host:a pid:1").await.unwrap();
        assert!(!roles.release("tasks", "host:b pid:2").await.unwrap());
        assert!(roles.release("tasks", "host:a pid:1").await.unwrap());
        assert_eq!(roles.holder("tasks").await.unwrap(), None);
        assert_eq!(roles.acquire("tasks", "host:b pid:2").await.unwrap(), RoleAcquisition::Created);
    }
}
