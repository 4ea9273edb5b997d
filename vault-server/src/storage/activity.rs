//! Activity log rows.

use crate::activity::ActivityEntry;
use crate::pool::{Lease, PoolResult};

/// A persisted activity entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActivityRow {
    /// Row id.
    pub id: i64,
    /// Event time (Unix seconds).
    pub occurred_at: i64,
    /// Severity 1..=5.
    pub severity: i64,
    /// Component that logged the event.
    pub logged_by: String,
    /// Event category.
    pub category: String,
    /// Free-form details.
    pub details: String,
    /// Related user, if any.
    pub user_concerned: Option<String>,
    /// Related host, if any.
    pub host_concerned: Option<String>,
}

/// Append a batch of entries inside the lease's transaction.
pub async fn insert_batch(lease: &mut Lease, entries: &[ActivityEntry]) -> PoolResult<u64> {
    let mut written = 0;
    for entry in entries {
        written += lease
            .execute(
                sqlx::query(
                    "INSERT INTO activity_logs
                        (occurred_at, severity, logged_by, category, details, user_concerned, host_concerned)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .bind(entry.occurred_at)
                .bind(i64::from(entry.severity))
                .bind(entry.logged_by.as_str())
                .bind(entry.category.as_str())
                .bind(entry.details.as_str())
                .bind(entry.user_concerned.as_deref())
                .bind(entry.host_concerned.as_deref()),
            )
            .await?;
    }
    Ok(written)
}

/// Most recent entries, newest first.
pub async fn recent(lease: &mut Lease, limit: i64) -> PoolResult<Vec<ActivityRow>> {
    lease
        .fetch_all(
            sqlx::query_as::<_, ActivityRow>(
                "SELECT id, occurred_at, severity, logged_by, category, details, user_concerned, host_concerned
                 FROM activity_logs ORDER BY id DESC LIMIT ?1",
            )
            .bind(limit),
        )
        .await
}
