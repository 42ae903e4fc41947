#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use smartexam_sync::cache::Clock;
use smartexam_sync::db;
use smartexam_sync::model::{ContentItem, PurchaseRecord, SyncJob};
use smartexam_sync::remote::{paths, Document, DocumentStore};
use smartexam_sync::store::{LocalStore, SqliteStore};

pub async fn setup_store() -> SqliteStore {
    SqliteStore::new(db::memory_pool().await.unwrap())
}

/// In-memory document service keyed by full document path.
#[derive(Clone, Default)]
pub struct FakeDocs {
    docs: Arc<Mutex<BTreeMap<String, Value>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    reads: Arc<Mutex<Vec<String>>>,
    writes: Arc<Mutex<Vec<(String, Value)>>>,
    media: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    collection_calls: Arc<AtomicUsize>,
    latency: Option<std::time::Duration>,
}

impl FakeDocs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn put(&self, path: &str, fields: Value) {
        self.docs.lock().await.insert(path.to_string(), fields);
    }

    pub async fn get(&self, path: &str) -> Option<Value> {
        self.docs.lock().await.get(path).cloned()
    }

    pub async fn remove(&self, path: &str) {
        self.docs.lock().await.remove(path);
    }

    pub async fn put_media(&self, path: &str, bytes: &[u8]) {
        self.media.lock().await.insert(path.to_string(), bytes.to_vec());
    }

    /// Reads and writes of `path` fail from now on.
    pub async fn fail(&self, path: &str) {
        self.failing.lock().await.insert(path.to_string());
    }

    pub async fn heal(&self, path: &str) {
        self.failing.lock().await.remove(path);
    }

    /// Every read or write made so far.
    pub async fn calls(&self) -> usize {
        self.collection_calls.load(Ordering::SeqCst)
            + self.reads.lock().await.len()
            + self.writes.lock().await.len()
    }

    pub fn collection_calls(&self) -> usize {
        self.collection_calls.load(Ordering::SeqCst)
    }

    pub async fn reads(&self) -> Vec<String> {
        self.reads.lock().await.clone()
    }

    pub async fn writes(&self) -> Vec<(String, Value)> {
        self.writes.lock().await.clone()
    }

    pub async fn seed_purchase(&self, user_id: &str, pack_id: &str) {
        self.put(
            &paths::purchased_pack(user_id, pack_id),
            json!({
                "packId": pack_id,
                "transactionId": format!("txn-{pack_id}"),
                "purchasedAt": 1_700_000_000_000i64,
                "synced": true,
            }),
        )
        .await;
    }

    /// Manifest plus one question document per id.
    pub async fn seed_pack(&self, pack_id: &str, question_ids: &[&str]) {
        self.put(
            &paths::pack(pack_id),
            json!({ "title": format!("Pack {pack_id}"), "questionIds": question_ids }),
        )
        .await;
        for id in question_ids {
            self.put(&paths::question(id), question_doc(&question(id, pack_id)))
                .await;
        }
    }

    async fn check(&self, path: &str) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.lock().await.contains(path) {
            return Err(anyhow!("injected failure for {path}"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FakeDocs {
    async fn read_collection(&self, path: &str) -> Result<Vec<Document>> {
        self.collection_calls.fetch_add(1, Ordering::SeqCst);
        self.check(path).await?;
        let prefix = format!("{path}/");
        let docs = self.docs.lock().await;
        Ok(docs
            .iter()
            .filter_map(|(key, fields)| {
                let id = key.strip_prefix(&prefix)?;
                (!id.contains('/')).then(|| Document {
                    id: id.to_string(),
                    fields: fields.clone(),
                })
            })
            .collect())
    }

    async fn read_document(&self, path: &str) -> Result<Option<Document>> {
        self.reads.lock().await.push(path.to_string());
        self.check(path).await?;
        let id = path.rsplit('/').next().unwrap_or(path).to_string();
        Ok(self
            .docs
            .lock()
            .await
            .get(path)
            .map(|fields| Document {
                id,
                fields: fields.clone(),
            }))
    }

    async fn write_document(&self, path: &str, fields: Value) -> Result<()> {
        self.writes
            .lock()
            .await
            .push((path.to_string(), fields.clone()));
        self.check(path).await?;
        self.docs.lock().await.insert(path.to_string(), fields);
        Ok(())
    }

    async fn fetch_media(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.reads.lock().await.push(path.to_string());
        self.check(path).await?;
        Ok(self.media.lock().await.get(path).cloned())
    }
}

pub fn question(id: &str, pack_id: &str) -> ContentItem {
    ContentItem {
        id: id.to_string(),
        pack_id: pack_id.to_string(),
        subject: Some("Mathematics".into()),
        grade: 12,
        topic: Some("Algebra".into()),
        question_type: Some("MULTIPLE_CHOICE".into()),
        cognitive_level: Some("APPLICATION".into()),
        marks: 3,
        difficulty: Some("MEDIUM".into()),
        question_text: format!("Question {id}"),
        content: BTreeMap::from([("a".to_string(), "1".to_string())]),
        tags: vec!["algebra".into()],
        image_path: None,
        version: 1,
        created_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
    }
}

/// Wire form of a question as the document service stores it.
pub fn question_doc(item: &ContentItem) -> Value {
    json!({
        "packId": item.pack_id,
        "subject": item.subject,
        "grade": item.grade,
        "topic": item.topic,
        "type": item.question_type,
        "cognitiveLevel": item.cognitive_level,
        "marks": item.marks,
        "difficulty": item.difficulty,
        "questionText": item.question_text,
        "content": item.content,
        "tags": item.tags,
        "imagePath": item.image_path,
        "version": item.version,
        "createdAt": item.created_at.timestamp_millis(),
    })
}

pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Starts on a whole millisecond so remote round trips are exact.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: std::sync::Mutex::new(Utc.timestamp_millis_opt(1_760_000_000_000).unwrap()),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Wraps a store and counts how often purchases or pack content are read.
/// Writes of the synced flag can be made to fail.
pub struct CountingStore {
    inner: SqliteStore,
    reads: AtomicUsize,
    fail_flag_writes: AtomicBool,
}

impl CountingStore {
    pub fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            fail_flag_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_flag_writes(&self) {
        self.fail_flag_writes.store(true, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &SqliteStore {
        &self.inner
    }
}

#[async_trait]
impl LocalStore for CountingStore {
    async fn upsert_purchase(&self, record: &PurchaseRecord) -> Result<()> {
        self.inner.upsert_purchase(record).await
    }

    async fn purchases_for_user(&self, user_id: &str) -> Result<Vec<PurchaseRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.purchases_for_user(user_id).await
    }

    async fn is_pack_purchased(&self, user_id: &str, pack_id: &str) -> Result<bool> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.is_pack_purchased(user_id, pack_id).await
    }

    async fn mark_pack_synced(&self, user_id: &str, pack_id: &str, synced: bool) -> Result<()> {
        if self.fail_flag_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("injected failure updating {pack_id}"));
        }
        self.inner.mark_pack_synced(user_id, pack_id, synced).await
    }

    async fn upsert_content(&self, item: &ContentItem) -> Result<()> {
        self.inner.upsert_content(item).await
    }

    async fn content_for_pack(&self, pack_id: &str) -> Result<Vec<ContentItem>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.content_for_pack(pack_id).await
    }

    async fn is_pack_complete(&self, pack_id: &str) -> Result<bool> {
        self.inner.is_pack_complete(pack_id).await
    }

    async fn record_purchase(&self, record: &PurchaseRecord) -> Result<i64> {
        self.inner.record_purchase(record).await
    }

    async fn enqueue_job(&self, user_id: &str, pack_id: &str) -> Result<i64> {
        self.inner.enqueue_job(user_id, pack_id).await
    }

    async fn next_job(&self) -> Result<Option<SyncJob>> {
        self.inner.next_job().await
    }

    async fn delete_job(&self, id: i64) -> Result<()> {
        self.inner.delete_job(id).await
    }

    async fn load_trial_state(&self, user_id: &str) -> Result<Option<String>> {
        self.inner.load_trial_state(user_id).await
    }

    async fn save_trial_state(&self, user_id: &str, json: &str) -> Result<()> {
        self.inner.save_trial_state(user_id, json).await
    }
}
