//! The SQLite-backed work queues.
//!
//! Queued messages and webhook requests share one claim-and-backoff contract
//! ([`Lockable`]). Worker roles arbitrate which process runs scheduled tasks,
//! and scheduled task records hold each task's next run time.

mod locking;
mod queued_message;
mod scheduled_task;
mod schema;
mod webhook_request;
mod worker_role;

use std::{path::Path, str::FromStr, time::Duration};

use courier_common::config::DatabaseConfig;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::{debug, info};

pub use locking::{
    Condition, INITIAL_RETRY_PERIOD, Lockable, MAX_RETRY_DELAY, claim, delete, retry_delay,
    retry_later, unlock,
};
pub use queued_message::{
    MESSAGE_READY_WINDOW, NewQueuedMessage, QueuedMessage, QueuedMessageRepository, batch_key,
};
pub use scheduled_task::{ScheduledTaskRecord, ScheduledTaskRepository};
pub use schema::MIGRATIONS;
pub use webhook_request::{NewWebhookRequest, WebhookRequest, WebhookRequestRepository};
pub use worker_role::{RoleAcquisition, STALE_ROLE_AFTER, WorkerRoleRepository};

use crate::error::StoreError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared connection pool for the queue database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the database at `config.url`, sized for `threads` workers, and
    /// applies pending migrations.
    pub async fn connect(config: &DatabaseConfig, threads: u32) -> Result<Self, StoreError> {
        info!(url = %config.url, "Opening queue database");

        let options = SqliteConnectOptions::from_str(&config.url)?;
        Self::open(options, config.pool_size(threads)).await
    }

    /// Opens (creating if needed) a database file.
    pub async fn open_path(path: &Path, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().filename(path);
        Self::open(options, max_connections).await
    }

    async fn open(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[must_use]
    pub const fn queued_messages(&self) -> QueuedMessageRepository<'_> {
        QueuedMessageRepository::new(&self.pool)
    }

    #[must_use]
    pub const fn webhook_requests(&self) -> WebhookRequestRepository<'_> {
        WebhookRequestRepository::new(&self.pool)
    }

    #[must_use]
    pub const fn worker_roles(&self) -> WorkerRoleRepository<'_> {
        WorkerRoleRepository::new(&self.pool)
    }

    #[must_use]
    pub const fn scheduled_tasks(&self) -> ScheduledTaskRepository<'_> {
        ScheduledTaskRepository::new(&self.pool)
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        )
        .fetch_one(&self.pool)
        .await?;

        if exists == 0 {
            return Ok(0);
        }

        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_one(&self.pool)
                .await?;

        Ok(version)
    }

    /// Applies every migration newer than the current schema version, each in
    /// its own transaction.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let current = usize::try_from(self.schema_version().await?).unwrap_or_default();

        if current >= MIGRATIONS.len() {
            debug!(version = current, "Queue database is up to date");
            return Ok(());
        }

        info!(
            from = current,
            to = MIGRATIONS.len(),
            "Migrating queue database"
        );

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        for (index, migration) in MIGRATIONS.iter().enumerate().skip(current) {
            let version = index + 1;
            debug!(version, "Applying migration");

            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration)
                .execute(&mut *tx)
                .await
                .map_err(|source| StoreError::Migration { version, source })?;
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(i64::try_from(version).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }

        info!(version = MIGRATIONS.len(), "Queue database migration complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_applied() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_path(&dir.path().join("queue.db"), 2)
            .await
            .unwrap();

        assert_eq!(db.schema_version().await.unwrap(), MIGRATIONS.len() as i64);

        // A second run is a no-op.
        db.migrate().await.unwrap();
        assert_eq!(db.schema_version().await.unwrap(), MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn test_connect_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("courier.db").display()),
            ..DatabaseConfig::default()
        };

        let db = Database::connect(&config, 2).await.unwrap();
        assert_eq!(db.pool().options().get_max_connections(), 5);
    }
}
