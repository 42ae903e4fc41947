//! Row models returned by repository queries.
//!
//! Questions keep their string map and tags as JSON text columns; decoding
//! happens here so repositories stay focused on SQL.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::model::{ContentItem, PurchaseRecord, SyncJob};

#[derive(Debug, Clone, FromRow)]
pub struct PurchaseRow {
    pub user_id: String,
    pub pack_id: String,
    pub transaction_id: String,
    pub purchased_at: DateTime<Utc>,
    pub synced: bool,
}

impl From<PurchaseRow> for PurchaseRecord {
    fn from(row: PurchaseRow) -> Self {
        PurchaseRecord {
            user_id: row.user_id,
            pack_id: row.pack_id,
            transaction_id: row.transaction_id,
            purchased_at: row.purchased_at,
            synced: row.synced,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct QuestionRow {
    pub id: String,
    pub pack_id: String,
    pub subject: Option<String>,
    pub grade: i64,
    pub topic: Option<String>,
    pub question_type: Option<String>,
    pub cognitive_level: Option<String>,
    pub marks: i64,
    pub difficulty: Option<String>,
    pub question_text: String,
    pub content: String,
    pub tags: String,
    pub image_path: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<QuestionRow> for ContentItem {
    type Error = anyhow::Error;

    fn try_from(row: QuestionRow) -> Result<Self> {
        let content = serde_json::from_str(&row.content)
            .with_context(|| format!("question {} has malformed content", row.id))?;
        let tags = serde_json::from_str(&row.tags)
            .with_context(|| format!("question {} has malformed tags", row.id))?;
        Ok(ContentItem {
            id: row.id,
            pack_id: row.pack_id,
            subject: row.subject,
            grade: row.grade,
            topic: row.topic,
            question_type: row.question_type,
            cognitive_level: row.cognitive_level,
            marks: row.marks,
            difficulty: row.difficulty,
            question_text: row.question_text,
            content,
            tags,
            image_path: row.image_path,
            version: row.version,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncJobRow {
    pub id: i64,
    pub user_id: String,
    pub pack_id: String,
    pub enqueued_at: DateTime<Utc>,
}

impl From<SyncJobRow> for SyncJob {
    fn from(row: SyncJobRow) -> Self {
        SyncJob {
            id: row.id,
            user_id: row.user_id,
            pack_id: row.pack_id,
            enqueued_at: row.enqueued_at,
        }
    }
}
