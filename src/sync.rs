//! Decides where "what does this user own" is answered from, and keeps the
//! local store in step with the remote document service.
//!
//! Lookup order for a plain sync:
//! 1. a cache entry younger than the rate-limit window,
//! 2. purchases already in the local store,
//! 3. a full remote fetch (purchase list, then every pack's questions).
//!
//! Calls for the same user are serialized, so a second caller waits for the
//! first and is then answered from the entry it left in the cache. A user's
//! lock is dropped from the registry once nobody holds or waits on it.
//!
//! Only packs whose content is complete are kept in the per-pack cache.

use chrono::Duration;
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::cache::{Clock, SyncCache, SyncCacheEntry, SystemClock};
use crate::error::{SyncError, SyncResult};
use crate::identity::{require_user, IdentityProvider};
use crate::jobs;
use crate::media::MediaDir;
use crate::model::{ContentItem, PurchaseRecord};
use crate::remote::{self, paths, DocumentStore};
use crate::store::LocalStore;

pub struct SyncCoordinator {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn DocumentStore>,
    cache: SyncCache,
    clock: Arc<dyn Clock>,
    media: Option<MediaDir>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncCoordinator {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn DocumentStore>,
        rate_limit_window: Duration,
    ) -> Self {
        Self {
            identity,
            store,
            remote,
            cache: SyncCache::new(rate_limit_window),
            clock: Arc::new(SystemClock),
            media: None,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Download question images into `media` during remote fetches.
    pub fn with_media(mut self, media: MediaDir) -> Self {
        self.media = Some(media);
        self
    }

    pub fn cache(&self) -> &SyncCache {
        &self.cache
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the user's lock when the registry and `lock` are its only owners.
    async fn release_user_lock(&self, user_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.user_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            locks.remove(user_id);
        }
    }

    /// Number of questions available for the signed-in user.
    #[instrument(skip_all)]
    pub async fn sync_purchased_packs(&self) -> SyncResult<usize> {
        let user_id = require_user(self.identity.as_ref()).await?;
        let lock = self.user_lock(&user_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.sync_locked(&user_id).await
        };
        self.release_user_lock(&user_id, lock).await;
        result
    }

    async fn sync_locked(&self, user_id: &str) -> SyncResult<usize> {
        if let Some(entry) = self.cache.fresh(user_id, self.clock.now()).await {
            debug!(user_id, item_count = entry.item_count, "serving purchased packs from cache");
            return Ok(entry.item_count);
        }

        match self.store.purchases_for_user(user_id).await {
            Ok(local) if !local.is_empty() => return self.serve_local(user_id, local).await,
            Ok(_) => {}
            Err(err) => warn!(?err, user_id, "local purchase lookup failed; fetching remotely"),
        }

        self.fetch_remote(user_id).await
    }

    /// Drop the user's cache entry and refetch everything from the remote.
    #[instrument(skip_all)]
    pub async fn force_refresh(&self) -> SyncResult<usize> {
        let user_id = require_user(self.identity.as_ref()).await?;
        let lock = self.user_lock(&user_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.cache.invalidate(&user_id).await;
            self.fetch_remote(&user_id).await
        };
        self.release_user_lock(&user_id, lock).await;
        result
    }

    /// Forget everything cached in memory, e.g. on logout.
    pub async fn clear_cache(&self) {
        self.cache.clear().await;
        debug!("sync cache cleared");
    }

    async fn serve_local(&self, user_id: &str, purchases: Vec<PurchaseRecord>) -> SyncResult<usize> {
        let now = self.clock.now();
        let mut items = Vec::new();
        for purchase in &purchases {
            let pack_items = self
                .store
                .content_for_pack(&purchase.pack_id)
                .await
                .map_err(SyncError::sync_failed)?;
            if purchase.synced {
                self.cache
                    .put_pack_questions(&purchase.pack_id, pack_items.clone(), now)
                    .await;
            }
            items.extend(pack_items);
        }
        info!(
            user_id,
            packs = purchases.len(),
            items = items.len(),
            "using local purchased packs"
        );
        let entry = SyncCacheEntry::new(now, purchases, items);
        let count = entry.item_count;
        self.cache.put(user_id, entry).await;
        Ok(count)
    }

    async fn fetch_remote(&self, user_id: &str) -> SyncResult<usize> {
        info!(user_id, "fetching purchased packs from remote");
        let mut purchases = remote::list_purchases(self.remote.as_ref(), user_id)
            .await
            .map_err(SyncError::sync_failed)?;

        // New rows start unsynced whatever the remote says; the upsert keeps
        // an existing row's flag.
        for purchase in purchases.iter_mut() {
            purchase.synced = false;
            self.store
                .upsert_purchase(purchase)
                .await
                .map_err(SyncError::store_write)?;
        }

        let docs = self.remote.as_ref();
        let store = self.store.as_ref();
        let media = self.media.as_ref();
        let reports = join_all(
            purchases
                .iter()
                .map(|p| jobs::sync_pack_content(docs, store, media, user_id, &p.pack_id)),
        )
        .await;

        let now = self.clock.now();
        let mut items: Vec<ContentItem> = Vec::new();
        let mut complete_packs = 0;
        for (purchase, report) in purchases.iter_mut().zip(reports) {
            match report {
                Ok(report) => {
                    if report.marked_synced {
                        purchase.synced = true;
                        complete_packs += 1;
                        self.cache
                            .put_pack_questions(&report.pack_id, report.stored.clone(), now)
                            .await;
                    } else {
                        self.cache.invalidate_pack(&report.pack_id).await;
                    }
                    items.extend(report.stored);
                }
                Err(err) => {
                    warn!(?err, user_id, pack_id = %purchase.pack_id, "pack content fetch failed")
                }
            }
        }

        info!(
            user_id,
            packs = purchases.len(),
            complete_packs,
            items = items.len(),
            "remote sync completed"
        );
        // Flags of packs completed by earlier syncs live in the store.
        let purchases = match self.store.purchases_for_user(user_id).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(?err, user_id, "could not reread purchases; caching fetched flags");
                purchases
            }
        };
        let entry = SyncCacheEntry::new(now, purchases, items);
        let count = entry.item_count;
        self.cache.put(user_id, entry).await;
        Ok(count)
    }

    /// Questions of a pack from memory, falling back to the local store.
    #[instrument(skip(self))]
    pub async fn questions_for_pack(&self, pack_id: &str) -> SyncResult<Vec<ContentItem>> {
        let now = self.clock.now();
        if let Some(items) = self.cache.pack_questions(pack_id, now).await {
            debug!(pack_id, "using cached questions");
            return Ok(items);
        }
        let items = self
            .store
            .content_for_pack(pack_id)
            .await
            .map_err(SyncError::sync_failed)?;
        if items.is_empty() {
            debug!(pack_id, "no questions stored for pack");
            return Ok(items);
        }
        match self.store.is_pack_complete(pack_id).await {
            Ok(true) => self.cache.put_pack_questions(pack_id, items.clone(), now).await,
            Ok(false) => debug!(pack_id, "pack incomplete; not caching"),
            Err(err) => warn!(?err, pack_id, "pack completeness lookup failed"),
        }
        Ok(items)
    }

    pub async fn is_pack_purchased(&self, pack_id: &str) -> SyncResult<bool> {
        let user_id = require_user(self.identity.as_ref()).await?;
        self.store
            .is_pack_purchased(&user_id, pack_id)
            .await
            .map_err(SyncError::sync_failed)
    }

    /// Write a small test document and return its id.
    #[instrument(skip_all)]
    pub async fn check_connection(&self) -> SyncResult<String> {
        let user_id = self
            .identity
            .current_user_id()
            .await
            .unwrap_or_else(|| "anonymous".to_string());
        let check_id = uuid::Uuid::new_v4().to_string();
        let fields = json!({
            "timestamp": self.clock.now().timestamp_millis(),
            "testType": "smartexam_sync_test",
            "userId": user_id,
        });
        self.remote
            .write_document(&paths::connection_check(&check_id), fields)
            .await
            .map_err(SyncError::sync_failed)?;
        info!(%check_id, "document service connection ok");
        Ok(check_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::identity::Session;
    use crate::remote::Document;
    use crate::store::SqliteStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;

    /// A remote with no purchases that answers after a short pause.
    struct SlowEmptyDocs;

    #[async_trait]
    impl DocumentStore for SlowEmptyDocs {
        async fn read_collection(&self, _path: &str) -> Result<Vec<Document>> {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(Vec::new())
        }

        async fn read_document(&self, _path: &str) -> Result<Option<Document>> {
            Ok(None)
        }

        async fn write_document(&self, _path: &str, _fields: Value) -> Result<()> {
            Ok(())
        }

        async fn fetch_media(&self, _path: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    async fn coordinator(user: &str) -> SyncCoordinator {
        let store = SqliteStore::new(db::memory_pool().await.unwrap());
        SyncCoordinator::new(
            Arc::new(Session::signed_in(user)),
            Arc::new(store),
            Arc::new(SlowEmptyDocs),
            Duration::minutes(30),
        )
    }

    #[tokio::test]
    async fn user_locks_are_released_after_each_call() {
        let coordinator = coordinator("u1").await;

        assert_eq!(coordinator.sync_purchased_packs().await.unwrap(), 0);
        assert!(coordinator.user_locks.lock().await.is_empty());

        let (a, b, c) = tokio::join!(
            coordinator.force_refresh(),
            coordinator.force_refresh(),
            coordinator.sync_purchased_packs()
        );
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (0, 0, 0));
        assert!(coordinator.user_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn waiting_caller_keeps_the_lock_registered() {
        let coordinator = coordinator("u1").await;
        let lock = coordinator.user_lock("u1").await;
        let held = lock.lock().await;

        let waiter = coordinator.sync_purchased_packs();
        tokio::pin!(waiter);
        // Let the call register itself and block on the held lock.
        tokio::select! {
            _ = &mut waiter => panic!("sync ran while the user lock was held"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
        }
        assert_eq!(coordinator.user_locks.lock().await.len(), 1);

        drop(held);
        assert_eq!(waiter.await.unwrap(), 0);
        // `lock` is still ours, so the waiter left the entry in place.
        assert_eq!(coordinator.user_locks.lock().await.len(), 1);
        coordinator.release_user_lock("u1", lock).await;
        assert!(coordinator.user_locks.lock().await.is_empty());
    }
}
