//! Trial lifecycle with local persistence and server reconciliation.
//!
//! Local state is the JSON form of [`TrialStateData`] kept in the local store.
//! The server copy lives at `trials/{uid}`. When both exist, the one with the
//! newer `last_sync` wins; local metadata is merged over the server's.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::cache::{Clock, SystemClock};
use crate::error::{SyncError, SyncResult};
use crate::identity::{require_user, IdentityProvider};
use crate::model::TrialState;
use crate::remote::model::{millis_to_datetime, TrialDoc};
use crate::remote::{self, paths, DocumentStore};
use crate::store::LocalStore;

const APP_VERSION: i64 = 1;
const DEFAULT_TRIAL_LENGTH_DAYS: i64 = 3650;
/// Metadata key holding when the terms were accepted, in epoch ms.
pub const TERMS_ACCEPTED_KEY: &str = "terms_accepted";

/// Lowercase hex SHA-256 of a device id. Only the hash leaves the device.
pub fn device_hash(device_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialStateData {
    pub state: TrialState,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
    pub device_hash: String,
    pub server_verified: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl TrialStateData {
    /// No trial, stamped as synced at `at`.
    pub fn none(at: Option<DateTime<Utc>>) -> Self {
        Self {
            state: TrialState::None,
            trial_start: None,
            trial_end: None,
            last_sync: at,
            device_hash: String::new(),
            server_verified: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn active(start: DateTime<Utc>, length: Duration, device_hash: &str) -> Self {
        Self {
            state: TrialState::Active,
            trial_start: Some(start),
            trial_end: Some(start + length),
            last_sync: Some(start),
            device_hash: device_hash.to_string(),
            server_verified: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!((self.trial_start, self.trial_end), (Some(start), Some(end)) if end > start)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state == TrialState::Active && self.trial_end.is_some_and(|end| now < end)
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.trial_end {
            Some(end) if self.is_active(now) => end - now,
            _ => Duration::zero(),
        }
    }

    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        self.remaining(now).num_days()
    }

    pub fn hours_remaining(&self, now: DateTime<Utc>) -> i64 {
        self.remaining(now).num_hours()
    }

    fn from_doc(doc: TrialDoc, now: DateTime<Utc>) -> Self {
        let state = doc
            .state
            .as_deref()
            .and_then(TrialState::parse_state)
            .unwrap_or(TrialState::None);
        let ts = |ms: i64| (ms > 0).then(|| millis_to_datetime(ms));
        Self {
            state,
            trial_start: ts(doc.trial_start),
            trial_end: ts(doc.trial_end),
            last_sync: Some(doc.last_sync.map(millis_to_datetime).unwrap_or(now)),
            device_hash: doc.device_hash.unwrap_or_default(),
            server_verified: true,
            metadata: doc.metadata,
        }
    }

    fn to_doc(&self, now: DateTime<Utc>) -> TrialDoc {
        let ms = |ts: Option<DateTime<Utc>>| ts.map(|t| t.timestamp_millis()).unwrap_or(0);
        TrialDoc {
            state: Some(self.state.as_str().to_string()),
            trial_start: ms(self.trial_start),
            trial_end: ms(self.trial_end),
            device_hash: Some(self.device_hash.clone()),
            last_sync: Some(now.timestamp_millis()),
            app_version: APP_VERSION,
            metadata: self.metadata.clone(),
        }
    }
}

/// Whether a trial may move from `from` (absent = never stored) to `to`.
pub fn is_valid_transition(from: Option<TrialState>, to: TrialState) -> bool {
    let Some(from) = from else {
        return true;
    };
    if from == TrialState::None || from == to {
        return true;
    }
    match from {
        TrialState::Active => matches!(
            to,
            TrialState::Expired
                | TrialState::Converted
                | TrialState::Suspended
                | TrialState::Cancelled
        ),
        TrialState::Expired => to == TrialState::Converted,
        TrialState::Suspended => matches!(to, TrialState::Active | TrialState::Cancelled),
        TrialState::Converted | TrialState::Cancelled | TrialState::None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Server,
    Local,
}

/// Pick between the local and server copies of a trial.
pub fn resolve_conflict(
    local: &TrialStateData,
    server: &TrialStateData,
) -> (TrialStateData, Resolution) {
    if server.last_sync > local.last_sync {
        let mut metadata = server.metadata.clone();
        metadata.extend(local.metadata.clone());
        let resolved = TrialStateData {
            server_verified: true,
            metadata,
            ..server.clone()
        };
        (resolved, Resolution::Server)
    } else {
        (local.clone(), Resolution::Local)
    }
}

pub struct TrialStateManager {
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    sync_interval: Duration,
    trial_length: Duration,
}

impl TrialStateManager {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn DocumentStore>,
        sync_interval: Duration,
    ) -> Self {
        Self {
            identity,
            store,
            remote,
            clock: Arc::new(SystemClock),
            sync_interval,
            trial_length: Duration::days(DEFAULT_TRIAL_LENGTH_DAYS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_trial_length(mut self, trial_length: Duration) -> Self {
        self.trial_length = trial_length;
        self
    }

    /// Local state is re-checked against the server when it was never synced,
    /// is older than the sync interval, or was never confirmed by the server.
    pub fn should_sync(&self, state: &TrialStateData) -> bool {
        match state.last_sync {
            None => true,
            Some(last) => self.clock.now() - last > self.sync_interval || !state.server_verified,
        }
    }

    #[instrument(skip(self))]
    pub async fn get_trial_state(&self) -> SyncResult<TrialStateData> {
        let Some(user_id) = self.signed_in_user().await else {
            return Ok(TrialStateData::none(None));
        };
        match self.load_local(&user_id).await {
            Some(local) if local.is_valid() => {
                if self.should_sync(&local) {
                    self.reconcile(&user_id, local).await
                } else {
                    debug!(%user_id, state = %local.state, "using local trial state");
                    Ok(local)
                }
            }
            _ => self.fetch_from_server(&user_id).await,
        }
    }

    /// Validate the transition, store locally, then push to the server.
    #[instrument(skip(self, new_state), fields(to = %new_state.state))]
    pub async fn update_trial_state(&self, new_state: TrialStateData) -> SyncResult<TrialStateData> {
        let user_id = require_user(self.identity.as_ref()).await?;
        let current = self.load_local(&user_id).await;
        let from = current.as_ref().map(|s| s.state);
        if !is_valid_transition(from, new_state.state) {
            return Err(SyncError::InvalidTransition {
                from: from.unwrap_or(TrialState::None),
                to: new_state.state,
            });
        }
        self.store_local(&user_id, &new_state).await?;
        self.push_to_server(&user_id, &new_state).await?;
        info!(%user_id, state = %new_state.state, "trial state updated");
        Ok(new_state)
    }

    /// Start a trial bound to `device_id` after the terms were accepted.
    ///
    /// Only a user without any trial may start one; the current state is
    /// reconciled with the server first. The server record is written before
    /// anything is stored locally, and the local copy is then marked verified.
    #[instrument(skip_all)]
    pub async fn start_trial(&self, device_id: &str) -> SyncResult<TrialStateData> {
        let user_id = require_user(self.identity.as_ref()).await?;
        let current = self.get_trial_state().await?;
        if current.state != TrialState::None {
            return Err(SyncError::InvalidTransition {
                from: current.state,
                to: TrialState::Active,
            });
        }

        let now = self.clock.now();
        let mut state = TrialStateData::active(now, self.trial_length, &device_hash(device_id));
        state
            .metadata
            .insert(TERMS_ACCEPTED_KEY.to_string(), Value::from(now.timestamp_millis()));
        self.push_to_server(&user_id, &state).await?;

        state.server_verified = true;
        self.store_local(&user_id, &state).await?;
        info!(%user_id, trial_end = ?state.trial_end, "trial started");
        Ok(state)
    }

    /// Whether the locally stored trial was started on this device.
    pub async fn is_device_valid_for_trial(&self, device_id: &str) -> SyncResult<bool> {
        let user_id = require_user(self.identity.as_ref()).await?;
        let valid = match self.load_local(&user_id).await {
            Some(state) if !state.device_hash.is_empty() => {
                state.device_hash == device_hash(device_id)
            }
            _ => false,
        };
        if !valid {
            debug!(%user_id, "trial is not bound to this device");
        }
        Ok(valid)
    }

    pub async fn force_sync_with_server(&self) -> SyncResult<TrialStateData> {
        let Some(user_id) = self.signed_in_user().await else {
            return Ok(TrialStateData::none(None));
        };
        self.fetch_from_server(&user_id).await
    }

    async fn signed_in_user(&self) -> Option<String> {
        require_user(self.identity.as_ref()).await.ok()
    }

    async fn load_local(&self, user_id: &str) -> Option<TrialStateData> {
        let json = match self.store.load_trial_state(user_id).await {
            Ok(json) => json?,
            Err(err) => {
                warn!(?err, user_id, "failed to read local trial state");
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(?err, user_id, "discarding unreadable local trial state");
                None
            }
        }
    }

    async fn store_local(&self, user_id: &str, state: &TrialStateData) -> SyncResult<()> {
        let json = serde_json::to_string(state).map_err(SyncError::store_write)?;
        self.store
            .save_trial_state(user_id, &json)
            .await
            .map_err(SyncError::store_write)
    }

    async fn read_server(&self, user_id: &str) -> anyhow::Result<Option<TrialStateData>> {
        let Some(doc) = self.remote.read_document(&paths::trial(user_id)).await? else {
            return Ok(None);
        };
        let doc: TrialDoc = remote::decode(&doc)?;
        Ok(Some(TrialStateData::from_doc(doc, self.clock.now())))
    }

    async fn push_to_server(&self, user_id: &str, state: &TrialStateData) -> SyncResult<()> {
        let fields =
            remote::encode(&state.to_doc(self.clock.now())).map_err(SyncError::sync_failed)?;
        self.remote
            .write_document(&paths::trial(user_id), fields)
            .await
            .map_err(SyncError::sync_failed)
    }

    async fn fetch_from_server(&self, user_id: &str) -> SyncResult<TrialStateData> {
        match self.read_server(user_id).await {
            Ok(Some(server)) => {
                self.store_local(user_id, &server).await?;
                Ok(server)
            }
            Ok(None) => {
                let none = TrialStateData::none(Some(self.clock.now()));
                self.store_local(user_id, &none).await?;
                Ok(none)
            }
            Err(err) => {
                warn!(?err, user_id, "failed to fetch trial state from server");
                self.load_local(user_id)
                    .await
                    .ok_or_else(|| SyncError::sync_failed(err))
            }
        }
    }

    async fn reconcile(&self, user_id: &str, local: TrialStateData) -> SyncResult<TrialStateData> {
        let server = match self.read_server(user_id).await {
            Ok(server) => server,
            Err(err) => {
                warn!(?err, user_id, "trial reconciliation failed; keeping local state");
                return Ok(local);
            }
        };
        let Some(server) = server else {
            return self.handle_missing_server_record(user_id, local).await;
        };

        let (resolved, resolution) = resolve_conflict(&local, &server);
        match resolution {
            Resolution::Server => self.store_local(user_id, &resolved).await?,
            Resolution::Local => {
                if let Err(err) = self.push_to_server(user_id, &resolved).await {
                    warn!(%err, user_id, "failed to push newer local trial state");
                }
            }
        }
        debug!(user_id, ?resolution, state = %resolved.state, "trial state reconciled");
        Ok(resolved)
    }

    /// A verified local trial is re-published; an unverified one is reset.
    async fn handle_missing_server_record(
        &self,
        user_id: &str,
        local: TrialStateData,
    ) -> SyncResult<TrialStateData> {
        if local.server_verified && local.trial_start.is_some() {
            self.push_to_server(user_id, &local).await?;
            return Ok(local);
        }
        warn!(user_id, "no server trial record for unverified local trial; resetting");
        let reset = TrialStateData::none(Some(self.clock.now()));
        self.store_local(user_id, &reset).await?;
        Ok(reset)
    }
}
