//! Claim-and-backoff over any queue table.
//!
//! A claim is one conditional `UPDATE` that stamps unlocked, ready rows with
//! the claimer's token and the claim time, followed by a select of the rows
//! carrying exactly that stamp. Whatever the second statement returns is what
//! the claimer owns; a racing claimer's `UPDATE` finds those rows locked and
//! skips them.

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, sqlite::SqliteRow};

use crate::error::StoreError;

/// Base delay before the first retry.
pub const INITIAL_RETRY_PERIOD: TimeDelta = TimeDelta::minutes(5);

const BACKOFF_FACTOR: f64 = 1.3;

/// Longest deferral ever stored, keeping `retry_after` within four-digit years.
pub const MAX_RETRY_DELAY: TimeDelta = TimeDelta::days(36_500);

/// A row that can be claimed, unlocked and retried.
pub trait Lockable: for<'r> FromRow<'r, SqliteRow> + Send + Unpin {
    const TABLE: &'static str;

    fn id(&self) -> i64;

    fn attempts(&self) -> i64;

    fn retry_after(&self) -> Option<DateTime<Utc>>;

    fn locked_at(&self) -> Option<DateTime<Utc>>;

    fn is_locked(&self) -> bool {
        self.locked_at().is_some()
    }

    /// Ready to process: never deferred, or the deferral has passed.
    fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.retry_after().is_none_or(|retry_after| retry_after <= now)
    }

    fn is_ready(&self) -> bool {
        self.is_ready_at(Utc::now())
    }
}

/// A scope filter applied to a claim, on top of unlocked and ready.
#[derive(Debug, Clone, Copy)]
pub enum Condition<'a> {
    /// `column IS NULL OR column IN (values)`
    NullOrAnyOf(&'static str, &'a [i64]),
    /// `column IS value`, so `None` matches NULL.
    Is(&'static str, Option<i64>),
    /// `column = value`
    TextIs(&'static str, &'a str),
}

impl<'a> Condition<'a> {
    fn push(self, query: &mut QueryBuilder<'a, Sqlite>) {
        match self {
            Self::NullOrAnyOf(column, values) => {
                query.push(format!(" AND ({column} IS NULL"));
                if !values.is_empty() {
                    query.push(format!(" OR {column} IN ("));
                    let mut separated = query.separated(", ");
                    for value in values {
                        separated.push_bind(*value);
                    }
                    separated.push_unseparated(")");
                }
                query.push(")");
            }
            Self::Is(column, value) => {
                query.push(format!(" AND {column} IS ")).push_bind(value);
            }
            Self::TextIs(column, value) => {
                query.push(format!(" AND {column} = ")).push_bind(value);
            }
        }
    }
}

/// Claims up to `limit` unlocked rows whose `retry_after` is unset or not
/// after `ready_before`, and returns the rows this claim won.
///
/// Matches [`Lockable::is_ready_at`] for the same instant.
pub async fn claim<'a, T: Lockable>(
    pool: &SqlitePool,
    token: &'a str,
    conditions: &[Condition<'a>],
    ready_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<T>, StoreError> {
    let now = Utc::now();

    let mut query: QueryBuilder<'a, Sqlite> =
        QueryBuilder::new(format!("UPDATE {} SET locked_by = ", T::TABLE));
    query
        .push_bind(token)
        .push(", locked_at = ")
        .push_bind(now)
        .push(format!(
            " WHERE locked_at IS NULL AND id IN (SELECT id FROM {} WHERE locked_at IS NULL \
             AND (retry_after IS NULL OR retry_after <= ",
            T::TABLE
        ))
        .push_bind(ready_before)
        .push(")");

    for condition in conditions {
        condition.push(&mut query);
    }

    query.push(" ORDER BY id LIMIT ").push_bind(limit).push(")");

    let claimed = query.build().execute(pool).await?.rows_affected();
    if claimed == 0 {
        return Ok(Vec::new());
    }

    let rows = sqlx::query_as::<_, T>(&format!(
        "SELECT * FROM {} WHERE locked_by = ? AND locked_at = ? ORDER BY id",
        T::TABLE
    ))
    .bind(token)
    .bind(now)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Clears the lock, leaving `retry_after` and `attempts` untouched.
pub async fn unlock<T: Lockable>(pool: &SqlitePool, row: &T) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "UPDATE {} SET locked_by = NULL, locked_at = NULL WHERE id = ?",
        T::TABLE
    ))
    .bind(row.id())
    .execute(pool)
    .await?;

    Ok(())
}

/// Releases the row and defers it by `delay`, or by the backoff schedule for
/// its attempt count. Increments `attempts`.
///
/// A row that has already been deleted is left alone.
pub async fn retry_later<T: Lockable>(
    pool: &SqlitePool,
    row: &T,
    delay: Option<TimeDelta>,
) -> Result<DateTime<Utc>, StoreError> {
    let delay = delay
        .unwrap_or_else(|| retry_delay(row.attempts()))
        .min(MAX_RETRY_DELAY);
    let now = Utc::now();
    let retry_after = now.checked_add_signed(delay).unwrap_or(now);

    sqlx::query(&format!(
        "UPDATE {} SET locked_by = NULL, locked_at = NULL, retry_after = ?, attempts = ? WHERE id = ?",
        T::TABLE
    ))
    .bind(retry_after)
    .bind(row.attempts() + 1)
    .bind(row.id())
    .execute(pool)
    .await?;

    Ok(retry_after)
}

pub async fn delete<T: Lockable>(pool: &SqlitePool, row: &T) -> Result<(), StoreError> {
    sqlx::query(&format!("DELETE FROM {} WHERE id = ?", T::TABLE))
        .bind(row.id())
        .execute(pool)
        .await?;

    Ok(())
}

/// `5 minutes * 1.3^attempts`, capped at [`MAX_RETRY_DELAY`].
#[must_use]
pub fn retry_delay(attempts: i64) -> TimeDelta {
    let exponent = i32::try_from(attempts.max(0)).unwrap_or(i32::MAX);
    #[allow(clippy::cast_precision_loss)]
    let millis = INITIAL_RETRY_PERIOD.num_milliseconds() as f64 * BACKOFF_FACTOR.powi(exponent);

    #[allow(clippy::cast_precision_loss)]
    let max_millis = MAX_RETRY_DELAY.num_milliseconds() as f64;
    if !millis.is_finite() || millis >= max_millis {
        return MAX_RETRY_DELAY;
    }

    #[allow(clippy::cast_possible_truncation)]
    let millis = millis.round() as i64;
    TimeDelta::try_milliseconds(millis).unwrap_or(MAX_RETRY_DELAY)
}
