use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::{SyncError, SyncResult};
use crate::identity::{require_user, IdentityProvider};
use crate::model::PurchaseRecord;
use crate::remote::{self, model::UserDoc, paths, DocumentStore};
use crate::store::LocalStore;

/// Records completed purchases and queues their content for download.
pub struct PurchaseRecorder {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn DocumentStore>,
}

impl PurchaseRecorder {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            identity,
            store,
            remote,
        }
    }

    /// Accept a purchase. `Ok(true)` means the purchase is stored and its
    /// content sync is queued, not that the content has arrived.
    #[instrument(skip(self))]
    pub async fn record_purchase(&self, pack_id: &str, transaction_id: &str) -> SyncResult<bool> {
        let user_id = require_user(self.identity.as_ref()).await?;
        if pack_id.trim().is_empty() {
            return Err(SyncError::SyncFailed("pack id must be non-empty".into()));
        }
        let record = PurchaseRecord::new(&user_id, pack_id, transaction_id);

        let user_doc = UserDoc {
            user_id: user_id.clone(),
            created_at: record.purchased_at.timestamp_millis(),
        };
        let fields = remote::encode(&user_doc).map_err(SyncError::sync_failed)?;
        self.remote
            .write_document(&paths::user(&user_id), fields)
            .await
            .map_err(SyncError::sync_failed)?;
        remote::write_purchase(self.remote.as_ref(), &record)
            .await
            .map_err(SyncError::sync_failed)?;

        let job_id = self
            .store
            .record_purchase(&record)
            .await
            .map_err(SyncError::store_write)?;
        info!(%user_id, pack_id, job_id, "purchase recorded; content sync queued");
        Ok(true)
    }
}
