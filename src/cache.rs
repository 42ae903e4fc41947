//! Process-lifetime cache of what each user owns.
//!
//! User entries and pack question lists share one TTL. Nothing here is
//! persisted, and losing an entry only costs a refetch.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::model::{ContentItem, PurchaseRecord};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCacheEntry {
    pub last_sync: DateTime<Utc>,
    pub purchases: Vec<PurchaseRecord>,
    pub items: Vec<ContentItem>,
    /// Count reported by the sync that produced this entry.
    pub item_count: usize,
}

impl SyncCacheEntry {
    pub fn new(
        last_sync: DateTime<Utc>,
        purchases: Vec<PurchaseRecord>,
        items: Vec<ContentItem>,
    ) -> Self {
        let item_count = items.len();
        Self {
            last_sync,
            purchases,
            items,
            item_count,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_sync < ttl
    }
}

/// Questions of a complete pack as read at `cached_at`.
#[derive(Debug, Clone)]
struct PackEntry {
    cached_at: DateTime<Utc>,
    items: Vec<ContentItem>,
}

#[derive(Debug)]
pub struct SyncCache {
    ttl: Duration,
    users: RwLock<HashMap<String, SyncCacheEntry>>,
    packs: RwLock<HashMap<String, PackEntry>>,
}

impl SyncCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            users: RwLock::new(HashMap::new()),
            packs: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The user's entry if it is younger than the TTL. Stale entries are evicted.
    pub async fn fresh(&self, user_id: &str, now: DateTime<Utc>) -> Option<SyncCacheEntry> {
        {
            let users = self.users.read().await;
            match users.get(user_id) {
                Some(entry) if entry.is_fresh(now, self.ttl) => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        let mut users = self.users.write().await;
        if users
            .get(user_id)
            .is_some_and(|entry| !entry.is_fresh(now, self.ttl))
        {
            users.remove(user_id);
        }
        None
    }

    pub async fn put(&self, user_id: &str, entry: SyncCacheEntry) {
        self.users.write().await.insert(user_id.to_string(), entry);
    }

    pub async fn invalidate(&self, user_id: &str) {
        self.users.write().await.remove(user_id);
    }

    /// Cached questions of a pack if younger than the TTL. Stale lists are evicted.
    pub async fn pack_questions(
        &self,
        pack_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Vec<ContentItem>> {
        {
            let packs = self.packs.read().await;
            match packs.get(pack_id) {
                Some(entry) if now - entry.cached_at < self.ttl => return Some(entry.items.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.packs.write().await.remove(pack_id);
        None
    }

    /// Only complete packs belong here; a partial list would outlive the
    /// content that completes it.
    pub async fn put_pack_questions(
        &self,
        pack_id: &str,
        items: Vec<ContentItem>,
        now: DateTime<Utc>,
    ) {
        self.packs.write().await.insert(
            pack_id.to_string(),
            PackEntry {
                cached_at: now,
                items,
            },
        );
    }

    pub async fn invalidate_pack(&self, pack_id: &str) {
        self.packs.write().await.remove(pack_id);
    }

    /// Drops every user entry and every cached pack.
    pub async fn clear(&self) {
        self.users.write().await.clear();
        self.packs.write().await.clear();
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }
}
