use crate::model::{LedgerKey, NotificationKind, NotificationRecord};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Atomically claim the ledger row for `key`. Returns true when this call
/// created the row, false when another actor already holds it (pending,
/// delivered, or abandoned). This is the idempotency gate: concurrent
/// enqueue attempts for the same key cannot both observe "absent".
#[instrument(skip_all)]
pub async fn reserve_notification(pool: &Pool, key: &LedgerKey) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO notifications (recipient_id, kind, day) VALUES (?, ?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(key.recipient_id)
    .bind(key.kind.as_str())
    .bind(key.day)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Re-arm an undelivered row for another round of attempts (administrative
/// re-enqueue after abandonment). Compare-and-swap on the delivered flag:
/// never resurrects a row that already went out.
#[instrument(skip_all)]
pub async fn rearm_notification(pool: &Pool, key: &LedgerKey) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE notifications SET retry_count = 0, last_error = NULL, updated_at = datetime('now') \
         WHERE COALESCE(recipient_id, 0) = COALESCE(?, 0) AND kind = ? AND day = ? AND delivered = 0",
    )
    .bind(key.recipient_id)
    .bind(key.kind.as_str())
    .bind(key.day)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn mark_delivered(pool: &Pool, key: &LedgerKey, job_count: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO notifications (recipient_id, kind, day, job_count, delivered, updated_at) \
         VALUES (?, ?, ?, ?, 1, datetime('now')) \
         ON CONFLICT (COALESCE(recipient_id, 0), kind, day) \
         DO UPDATE SET delivered = 1, job_count = excluded.job_count, updated_at = datetime('now')",
    )
    .bind(key.recipient_id)
    .bind(key.kind.as_str())
    .bind(key.day)
    .bind(job_count)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_failure(pool: &Pool, key: &LedgerKey, error: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO notifications (recipient_id, kind, day, retry_count, last_error, updated_at) \
         VALUES (?, ?, ?, 1, ?, datetime('now')) \
         ON CONFLICT (COALESCE(recipient_id, 0), kind, day) \
         DO UPDATE SET retry_count = notifications.retry_count + 1, \
                       last_error = excluded.last_error, updated_at = datetime('now')",
    )
    .bind(key.recipient_id)
    .bind(key.kind.as_str())
    .bind(key.day)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn has_delivered_today(
    pool: &Pool,
    recipient_id: i64,
    kind: NotificationKind,
    day: chrono::NaiveDate,
) -> Result<bool> {
    let row = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM notifications \
         WHERE recipient_id = ? AND kind = ? AND day = ? AND delivered = 1",
    )
    .bind(recipient_id)
    .bind(kind.as_str())
    .bind(day)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Timestamp of the most recent successful broadcast of `kind`. Used as the
/// catalog checkpoint for global eligibility.
#[instrument(skip_all)]
pub async fn last_broadcast_delivery(
    pool: &Pool,
    kind: NotificationKind,
) -> Result<Option<DateTime<Utc>>> {
    let ts = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT updated_at FROM notifications \
         WHERE recipient_id IS NULL AND kind = ? AND delivered = 1 \
         ORDER BY datetime(updated_at) DESC LIMIT 1",
    )
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(ts)
}

#[instrument(skip_all)]
pub async fn last_recipient_delivery(
    pool: &Pool,
    recipient_id: i64,
    kind: NotificationKind,
) -> Result<Option<DateTime<Utc>>> {
    let ts = sqlx::query_scalar::<_, DateTime<Utc>>(
        "SELECT updated_at FROM notifications \
         WHERE recipient_id = ? AND kind = ? AND delivered = 1 \
         ORDER BY datetime(updated_at) DESC LIMIT 1",
    )
    .bind(recipient_id)
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(ts)
}

/// Undelivered rows with at least one failed attempt, newest first. Feeds
/// the operational view of deliveries needing human attention.
#[instrument(skip_all)]
pub async fn recent_failures(pool: &Pool, limit: i64) -> Result<Vec<NotificationRecord>> {
    let rows = sqlx::query(
        "SELECT id, recipient_id, kind, day, job_count, delivered, retry_count, last_error, \
                created_at, updated_at \
         FROM notifications WHERE delivered = 0 AND retry_count > 0 \
         ORDER BY datetime(updated_at) DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(record_from_row).collect()
}

/// Age-based retention cleanup of delivered rows. Administrative concern;
/// returns the number of purged records.
#[instrument(skip_all)]
pub async fn purge_delivered_older_than(pool: &Pool, days: i64) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM notifications WHERE delivered = 1 AND day < date('now', '-' || ? || ' days')",
    )
    .bind(days)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

fn record_from_row(row: SqliteRow) -> Result<NotificationRecord> {
    let kind_raw: String = row.get("kind");
    let kind = NotificationKind::parse(&kind_raw)
        .ok_or_else(|| anyhow!("unknown notification kind in ledger: {kind_raw}"))?;
    Ok(NotificationRecord {
        id: row.get("id"),
        recipient_id: row.get("recipient_id"),
        kind,
        day: row.get("day"),
        job_count: row.get("job_count"),
        delivered: row.get::<i64, _>("delivered") != 0,
        retry_count: row.get("retry_count"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
