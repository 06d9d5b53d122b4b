use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ScheduledTaskRecord {
    pub id: i64,
    pub name: String,
    pub next_run_after: DateTime<Utc>,
}

impl ScheduledTaskRecord {
    #[must_use]
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.next_run_after <= now
    }
}

pub struct ScheduledTaskRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ScheduledTaskRepository<'a> {
    #[must_use]
    pub const fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, name: &str) -> Result<Option<ScheduledTaskRecord>, StoreError> {
        let record = sqlx::query_as::<_, ScheduledTaskRecord>(
            "SELECT * FROM scheduled_tasks WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Inserts a record for `name` unless one exists, and returns whichever
    /// record is now stored.
    pub async fn find_or_create(
        &self,
        name: &str,
        next_run_after: DateTime<Utc>,
    ) -> Result<ScheduledTaskRecord, StoreError> {
        sqlx::query(
            "INSERT INTO scheduled_tasks (name, next_run_after) VALUES (?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(next_run_after)
        .execute(self.pool)
        .await?;

        let record = sqlx::query_as::<_, ScheduledTaskRecord>(
            "SELECT * FROM scheduled_tasks WHERE name = ?",
        )
        .bind(name)
        .fetch_one(self.pool)
        .await?;

        Ok(record)
    }

    pub async fn set_next_run_after(
        &self,
        name: &str,
        next_run_after: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE scheduled_tasks SET next_run_after = ? WHERE name = ?")
            .bind(next_run_after)
            .bind(name)
            .execute(self.pool)
            .await?;

        Ok(())
    }
}
