use crate::error::SyncError;
use crate::media::MediaDir;
use crate::model::ContentItem;
use crate::remote::{self, DocumentStore};
use crate::store::LocalStore;
use anyhow::Result;
use futures::future::join_all;
use tracing::{info, instrument, warn};

/// Outcome of downloading one pack.
#[derive(Debug, Default)]
pub struct PackSyncReport {
    pub pack_id: String,
    pub stored: Vec<ContentItem>,
    /// `ItemFetchFailed` or `StoreWriteFailed` per question that did not land,
    /// plus a `StoreWriteFailed` when the synced flag could not be written.
    pub failed: Vec<SyncError>,
    pub marked_synced: bool,
}

impl PackSyncReport {
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed
            .iter()
            .filter_map(|err| match err {
                SyncError::ItemFetchFailed { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Fetch the pack manifest, then every listed question concurrently.
///
/// Each question succeeds or fails on its own and nothing is retried. The
/// purchase is flagged synced only when every question was stored. An error
/// is returned only when the manifest itself cannot be read.
///
/// With a `media` dir, each stored question's image is downloaded too. Image
/// failures are logged and do not count against the pack.
#[instrument(skip(docs, store, media))]
pub async fn sync_pack_content(
    docs: &dyn DocumentStore,
    store: &dyn LocalStore,
    media: Option<&MediaDir>,
    user_id: &str,
    pack_id: &str,
) -> Result<PackSyncReport> {
    let manifest = remote::fetch_manifest(docs, pack_id).await?;

    let fetches = manifest.question_ids.iter().map(|id| async move {
        let item = remote::fetch_question(docs, id, pack_id)
            .await
            .map_err(|err| SyncError::item_fetch(id.as_str(), err))?;
        store
            .upsert_content(&item)
            .await
            .map_err(SyncError::store_write)?;
        if let Some(media) = media {
            if let Err(err) = media.fetch_image(docs, &item).await {
                warn!(?err, item_id = %item.id, "question image not downloaded");
            }
        }
        Ok::<_, SyncError>(item)
    });

    let mut report = PackSyncReport {
        pack_id: pack_id.to_string(),
        ..Default::default()
    };
    for result in join_all(fetches).await {
        match result {
            Ok(item) => report.stored.push(item),
            Err(err) => {
                warn!(%err, pack_id, "question not synced");
                report.failed.push(err);
            }
        }
    }

    if report.failed.is_empty() {
        match store.mark_pack_synced(user_id, pack_id, true).await {
            Ok(()) => report.marked_synced = true,
            Err(err) => {
                let err = SyncError::store_write(err);
                warn!(%err, pack_id, "pack content stored but synced flag not written");
                report.failed.push(err);
            }
        }
    }
    info!(
        pack_id,
        stored = report.stored.len(),
        failed = report.failed.len(),
        synced = report.marked_synced,
        "pack content sync finished"
    );
    Ok(report)
}

/// Run the oldest queued content sync job. Returns false when the queue is empty.
///
/// The job is removed whatever the outcome; a pack that did not fully land
/// keeps `synced = false` until the next refresh.
#[instrument(skip_all)]
pub async fn process_next_job(
    docs: &dyn DocumentStore,
    store: &dyn LocalStore,
    media: Option<&MediaDir>,
) -> Result<bool> {
    let Some(job) = store.next_job().await? else {
        return Ok(false);
    };
    match sync_pack_content(docs, store, media, &job.user_id, &job.pack_id).await {
        Ok(report) if report.marked_synced => {
            info!(job_id = job.id, pack_id = %job.pack_id, "content sync job succeeded");
        }
        Ok(report) => {
            warn!(
                job_id = job.id,
                pack_id = %job.pack_id,
                failed = ?report.failed_ids(),
                "content sync job finished with missing questions"
            );
        }
        Err(err) => {
            warn!(?err, job_id = job.id, pack_id = %job.pack_id, "content sync job failed");
        }
    }
    store.delete_job(job.id).await?;
    Ok(true)
}

/// Process jobs until the queue is empty; returns how many ran.
pub async fn drain_jobs(
    docs: &dyn DocumentStore,
    store: &dyn LocalStore,
    media: Option<&MediaDir>,
) -> Result<usize> {
    let mut processed = 0;
    while process_next_job(docs, store, media).await? {
        processed += 1;
    }
    Ok(processed)
}
