use super::model::{PurchaseRow, QuestionRow, SyncJobRow};
use crate::model::{ContentItem, PurchaseRecord, SyncJob};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

// An upsert never clears `synced`; only `mark_pack_synced` can.
const UPSERT_PURCHASE: &str = "INSERT INTO purchased_packs \
    (user_id, pack_id, transaction_id, purchased_at, synced) VALUES (?, ?, ?, ?, ?) \
    ON CONFLICT(user_id, pack_id) DO UPDATE SET \
    transaction_id = excluded.transaction_id, \
    purchased_at = excluded.purchased_at, \
    synced = MAX(purchased_packs.synced, excluded.synced)";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// In-memory pool pinned to a single connection so every query sees the same
/// database. Used by tests and dry runs.
pub async fn memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{}?{}", expanded_path, query)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all, fields(user_id = %record.user_id, pack_id = %record.pack_id))]
pub async fn upsert_purchase(pool: &Pool, record: &PurchaseRecord) -> Result<()> {
    sqlx::query(UPSERT_PURCHASE)
        .bind(&record.user_id)
        .bind(&record.pack_id)
        .bind(&record.transaction_id)
        .bind(record.purchased_at)
        .bind(record.synced)
        .execute(pool)
        .await
        .context("failed to upsert purchased pack")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_purchases(pool: &Pool, user_id: &str) -> Result<Vec<PurchaseRecord>> {
    let rows: Vec<PurchaseRow> = sqlx::query_as(
        "SELECT user_id, pack_id, transaction_id, purchased_at, synced \
         FROM purchased_packs WHERE user_id = ? ORDER BY purchased_at ASC, pack_id ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(PurchaseRecord::from).collect())
}

#[instrument(skip_all)]
pub async fn is_pack_purchased(pool: &Pool, user_id: &str, pack_id: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM purchased_packs WHERE user_id = ? AND pack_id = ?)",
    )
    .bind(user_id)
    .bind(pack_id)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

#[instrument(skip_all, fields(user_id = %user_id, pack_id = %pack_id, synced = synced))]
pub async fn mark_pack_synced(
    pool: &Pool,
    user_id: &str,
    pack_id: &str,
    synced: bool,
) -> Result<()> {
    sqlx::query("UPDATE purchased_packs SET synced = ? WHERE user_id = ? AND pack_id = ?")
        .bind(synced)
        .bind(user_id)
        .bind(pack_id)
        .execute(pool)
        .await
        .context("failed to update pack sync status")?;
    Ok(())
}

#[instrument(skip_all, fields(item_id = %item.id))]
pub async fn upsert_content_item(pool: &Pool, item: &ContentItem) -> Result<()> {
    let content = serde_json::to_string(&item.content)?;
    let tags = serde_json::to_string(&item.tags)?;
    sqlx::query(
        "INSERT OR REPLACE INTO questions \
            (id, pack_id, subject, grade, topic, question_type, cognitive_level, marks, \
             difficulty, question_text, content, tags, image_path, version, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&item.id)
    .bind(&item.pack_id)
    .bind(&item.subject)
    .bind(item.grade)
    .bind(&item.topic)
    .bind(&item.question_type)
    .bind(&item.cognitive_level)
    .bind(item.marks)
    .bind(&item.difficulty)
    .bind(&item.question_text)
    .bind(content)
    .bind(tags)
    .bind(&item.image_path)
    .bind(item.version)
    .bind(item.created_at)
    .execute(pool)
    .await
    .context("failed to upsert question")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_content_for_pack(pool: &Pool, pack_id: &str) -> Result<Vec<ContentItem>> {
    let rows: Vec<QuestionRow> = sqlx::query_as(
        "SELECT id, pack_id, subject, grade, topic, question_type, cognitive_level, marks, \
                difficulty, question_text, content, tags, image_path, version, created_at \
         FROM questions WHERE pack_id = ? ORDER BY id ASC",
    )
    .bind(pack_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(ContentItem::try_from).collect()
}

/// True once any purchase of the pack has every question stored locally.
#[instrument(skip_all)]
pub async fn is_pack_complete(pool: &Pool, pack_id: &str) -> Result<bool> {
    let complete: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM purchased_packs WHERE pack_id = ? AND synced = 1)",
    )
    .bind(pack_id)
    .fetch_one(pool)
    .await?;
    Ok(complete)
}

pub async fn count_content(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM questions")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Store a new purchase and queue the content download for it atomically.
#[instrument(skip_all, fields(user_id = %record.user_id, pack_id = %record.pack_id))]
pub async fn record_purchase(pool: &Pool, record: &PurchaseRecord) -> Result<i64> {
    let mut tx = pool.begin().await?;
    sqlx::query(UPSERT_PURCHASE)
        .bind(&record.user_id)
        .bind(&record.pack_id)
        .bind(&record.transaction_id)
        .bind(record.purchased_at)
        .bind(record.synced)
        .execute(&mut *tx)
        .await?;
    let job_id = enqueue_sync_job_tx(&mut tx, &record.user_id, &record.pack_id).await?;
    tx.commit().await?;
    Ok(job_id)
}

#[instrument(skip_all)]
pub async fn enqueue_sync_job(pool: &Pool, user_id: &str, pack_id: &str) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_sync_job_tx(&mut tx, user_id, pack_id).await?;
    tx.commit().await?;
    Ok(id)
}

async fn enqueue_sync_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: &str,
    pack_id: &str,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO sync_jobs (user_id, pack_id, enqueued_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(user_id)
    .bind(pack_id)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn next_sync_job(pool: &Pool) -> Result<Option<SyncJob>> {
    let row: Option<SyncJobRow> = sqlx::query_as(
        "SELECT id, user_id, pack_id, enqueued_at FROM sync_jobs ORDER BY id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(SyncJob::from))
}

#[instrument(skip_all)]
pub async fn delete_sync_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM sync_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn count_sync_jobs(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn load_trial_state_json(pool: &Pool, user_id: &str) -> Result<Option<String>> {
    let json: Option<String> =
        sqlx::query_scalar("SELECT state_json FROM trial_state WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(json)
}

#[instrument(skip_all)]
pub async fn save_trial_state_json(pool: &Pool, user_id: &str, json: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO trial_state (user_id, state_json, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET state_json = excluded.state_json, updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(json)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to persist trial state")?;
    Ok(())
}
