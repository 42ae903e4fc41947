use anyhow::Result;
use async_trait::async_trait;

use crate::db::{self, Pool};
use crate::model::{ContentItem, PurchaseRecord, SyncJob};

/// Local persistence used by the sync services. All writes are upserts.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn upsert_purchase(&self, record: &PurchaseRecord) -> Result<()>;

    async fn purchases_for_user(&self, user_id: &str) -> Result<Vec<PurchaseRecord>>;

    async fn is_pack_purchased(&self, user_id: &str, pack_id: &str) -> Result<bool>;

    async fn mark_pack_synced(&self, user_id: &str, pack_id: &str, synced: bool) -> Result<()>;

    async fn upsert_content(&self, item: &ContentItem) -> Result<()>;

    async fn content_for_pack(&self, pack_id: &str) -> Result<Vec<ContentItem>>;

    /// Whether the pack's content is known to be fully stored.
    async fn is_pack_complete(&self, pack_id: &str) -> Result<bool>;

    /// Upsert the purchase and queue a content sync job for it in one transaction.
    async fn record_purchase(&self, record: &PurchaseRecord) -> Result<i64>;

    /// Queue a content download for a pack outside of a purchase.
    async fn enqueue_job(&self, user_id: &str, pack_id: &str) -> Result<i64>;

    async fn next_job(&self) -> Result<Option<SyncJob>>;

    async fn delete_job(&self, id: i64) -> Result<()>;

    async fn load_trial_state(&self, user_id: &str) -> Result<Option<String>>;

    async fn save_trial_state(&self, user_id: &str, json: &str) -> Result<()>;
}

/// `LocalStore` backed by the SQLite repositories.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn upsert_purchase(&self, record: &PurchaseRecord) -> Result<()> {
        db::upsert_purchase(&self.pool, record).await
    }

    async fn purchases_for_user(&self, user_id: &str) -> Result<Vec<PurchaseRecord>> {
        db::list_purchases(&self.pool, user_id).await
    }

    async fn is_pack_purchased(&self, user_id: &str, pack_id: &str) -> Result<bool> {
        db::is_pack_purchased(&self.pool, user_id, pack_id).await
    }

    async fn mark_pack_synced(&self, user_id: &str, pack_id: &str, synced: bool) -> Result<()> {
        db::mark_pack_synced(&self.pool, user_id, pack_id, synced).await
    }

    async fn upsert_content(&self, item: &ContentItem) -> Result<()> {
        db::upsert_content_item(&self.pool, item).await
    }

    async fn content_for_pack(&self, pack_id: &str) -> Result<Vec<ContentItem>> {
        db::list_content_for_pack(&self.pool, pack_id).await
    }

    async fn is_pack_complete(&self, pack_id: &str) -> Result<bool> {
        db::is_pack_complete(&self.pool, pack_id).await
    }

    async fn record_purchase(&self, record: &PurchaseRecord) -> Result<i64> {
        db::record_purchase(&self.pool, record).await
    }

    async fn enqueue_job(&self, user_id: &str, pack_id: &str) -> Result<i64> {
        db::enqueue_sync_job(&self.pool, user_id, pack_id).await
    }

    async fn next_job(&self) -> Result<Option<SyncJob>> {
        db::next_sync_job(&self.pool).await
    }

    async fn delete_job(&self, id: i64) -> Result<()> {
        db::delete_sync_job(&self.pool, id).await
    }

    async fn load_trial_state(&self, user_id: &str) -> Result<Option<String>> {
        db::load_trial_state_json(&self.pool, user_id).await
    }

    async fn save_trial_state(&self, user_id: &str, json: &str) -> Result<()> {
        db::save_trial_state_json(&self.pool, user_id, json).await
    }
}
