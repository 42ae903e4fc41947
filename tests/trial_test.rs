mod common;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use common::{setup_store, FakeDocs, ManualClock};
use smartexam_sync::cache::Clock;
use smartexam_sync::error::SyncError;
use smartexam_sync::identity::Session;
use smartexam_sync::model::TrialState;
use smartexam_sync::remote::paths;
use smartexam_sync::store::{LocalStore, SqliteStore};
use smartexam_sync::trial::{device_hash, TrialStateData, TrialStateManager, TERMS_ACCEPTED_KEY};

struct Harness {
    docs: Arc<FakeDocs>,
    store: Arc<SqliteStore>,
    clock: Arc<ManualClock>,
    trials: TrialStateManager,
}

async fn harness(session: Session) -> Harness {
    let docs = Arc::new(FakeDocs::new());
    let store = Arc::new(setup_store().await);
    let clock = ManualClock::new();
    let trials = TrialStateManager::new(
        Arc::new(session),
        store.clone(),
        docs.clone(),
        Duration::minutes(60),
    )
    .with_clock(clock.clone());
    Harness {
        docs,
        store,
        clock,
        trials,
    }
}

async fn signed_in() -> Harness {
    harness(Session::signed_in("u1")).await
}

impl Harness {
    async fn save_local(&self, state: &TrialStateData) {
        self.store
            .save_trial_state("u1", &serde_json::to_string(state).unwrap())
            .await
            .unwrap();
    }

    async fn local(&self) -> Option<TrialStateData> {
        self.store
            .load_trial_state("u1")
            .await
            .unwrap()
            .map(|json| serde_json::from_str(&json).unwrap())
    }

    async fn put_server(&self, state: &str, start: DateTime<Utc>, last_sync: DateTime<Utc>) {
        self.docs
            .put(
                &paths::trial("u1"),
                json!({
                    "state": state,
                    "trial_start": start.timestamp_millis(),
                    "trial_end": (start + Duration::days(14)).timestamp_millis(),
                    "device_hash": "device-1",
                    "last_sync": last_sync.timestamp_millis(),
                    "app_version": 1,
                    "metadata": { "plan": "pro" },
                }),
            )
            .await;
    }

    fn active_now(&self) -> TrialStateData {
        TrialStateData::active(self.clock.now(), Duration::days(14), "device-1")
    }
}

#[tokio::test]
async fn signed_out_user_has_no_trial() {
    let h = harness(Session::default()).await;

    let state = h.trials.get_trial_state().await.unwrap();
    assert_eq!(state.state, TrialState::None);
    assert_eq!(h.docs.calls().await, 0);

    assert!(matches!(
        h.trials.update_trial_state(h.active_now()).await,
        Err(SyncError::NotAuthenticated)
    ));
}

#[tokio::test]
async fn missing_server_record_yields_stored_none_state() {
    let h = signed_in().await;

    let state = h.trials.get_trial_state().await.unwrap();
    assert_eq!(state.state, TrialState::None);
    assert_eq!(state.last_sync, Some(h.clock.now()));
    assert_eq!(h.local().await, Some(state));
}

#[tokio::test]
async fn server_record_is_adopted_when_nothing_is_local() {
    let h = signed_in().await;
    let start = h.clock.now() - Duration::days(3);
    h.put_server("ACTIVE", start, h.clock.now()).await;

    let state = h.trials.get_trial_state().await.unwrap();
    assert_eq!(state.state, TrialState::Active);
    assert!(state.server_verified);
    assert_eq!(state.days_remaining(h.clock.now()), 11);
    assert_eq!(state.metadata["plan"], "pro");
    assert_eq!(h.local().await, Some(state));
}

#[tokio::test]
async fn update_persists_locally_and_publishes() {
    let h = signed_in().await;
    let mut active = h.active_now();
    active.metadata.insert("source".into(), json!("onboarding"));

    let stored = h.trials.update_trial_state(active.clone()).await.unwrap();
    assert_eq!(stored, active);
    assert_eq!(h.local().await, Some(active.clone()));

    let doc = h.docs.get(&paths::trial("u1")).await.unwrap();
    assert_eq!(doc["state"], "ACTIVE");
    assert_eq!(doc["device_hash"], "device-1");
    assert_eq!(doc["app_version"], 1);
    assert_eq!(doc["metadata"]["source"], "onboarding");
    assert_eq!(
        doc["trial_end"],
        active.trial_end.unwrap().timestamp_millis()
    );
}

#[tokio::test]
async fn invalid_transition_is_refused() {
    let h = signed_in().await;
    let mut converted = h.active_now();
    converted.state = TrialState::Converted;
    h.save_local(&converted).await;

    let err = h
        .trials
        .update_trial_state(h.active_now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::InvalidTransition {
            from: TrialState::Converted,
            to: TrialState::Active
        }
    ));
    assert!(h.docs.writes().await.is_empty());
    assert_eq!(h.local().await, Some(converted));
}

#[tokio::test]
async fn newer_server_state_wins() {
    let h = signed_in().await;
    let active = h.active_now();
    h.trials.update_trial_state(active.clone()).await.unwrap();
    h.put_server(
        "EXPIRED",
        active.trial_start.unwrap(),
        h.clock.now() + Duration::minutes(10),
    )
    .await;

    let state = h.trials.get_trial_state().await.unwrap();
    assert_eq!(state.state, TrialState::Expired);
    assert!(state.server_verified);
    assert_eq!(state.metadata["plan"], "pro");
    assert_eq!(h.local().await, Some(state));
}

#[tokio::test]
async fn newer_local_state_is_pushed() {
    let h = signed_in().await;
    let mut local = h.active_now();
    local.server_verified = true;
    local.state = TrialState::Suspended;
    h.save_local(&local).await;
    h.put_server("ACTIVE", local.trial_start.unwrap(), h.clock.now() - Duration::hours(1))
        .await;
    h.clock.advance(Duration::minutes(61));

    let state = h.trials.get_trial_state().await.unwrap();
    assert_eq!(state, local);
    let doc = h.docs.get(&paths::trial("u1")).await.unwrap();
    assert_eq!(doc["state"], "SUSPENDED");
}

#[tokio::test]
async fn recently_verified_local_state_skips_the_server() {
    let h = signed_in().await;
    let mut local = h.active_now();
    local.server_verified = true;
    h.save_local(&local).await;
    h.clock.advance(Duration::minutes(30));

    assert_eq!(h.trials.get_trial_state().await.unwrap(), local);
    assert_eq!(h.docs.calls().await, 0);
}

#[tokio::test]
async fn unverified_local_trial_without_server_record_is_reset() {
    let h = signed_in().await;
    h.save_local(&h.active_now()).await;

    let state = h.trials.get_trial_state().await.unwrap();
    assert_eq!(state.state, TrialState::None);
    assert_eq!(h.local().await.unwrap().state, TrialState::None);
}

#[tokio::test]
async fn verified_local_trial_without_server_record_is_republished() {
    let h = signed_in().await;
    let mut local = h.active_now();
    local.server_verified = true;
    h.save_local(&local).await;
    h.clock.advance(Duration::minutes(61));

    let state = h.trials.get_trial_state().await.unwrap();
    assert_eq!(state, local);
    let doc = h.docs.get(&paths::trial("u1")).await.unwrap();
    assert_eq!(doc["state"], "ACTIVE");
}

#[tokio::test]
async fn unreachable_server_falls_back_to_local() {
    let h = signed_in().await;
    h.docs.fail(&paths::trial("u1")).await;

    assert!(matches!(
        h.trials.force_sync_with_server().await,
        Err(SyncError::SyncFailed(_))
    ));

    let local = h.active_now();
    h.save_local(&local).await;
    assert_eq!(h.trials.get_trial_state().await.unwrap(), local);
    assert_eq!(h.trials.force_sync_with_server().await.unwrap(), local);
}

#[tokio::test]
async fn starting_a_trial_publishes_then_stores_a_verified_copy() {
    let mut h = signed_in().await;
    h.trials = h.trials.with_trial_length(Duration::days(3650));
    let now = h.clock.now();

    let state = h.trials.start_trial("device-1").await.unwrap();
    assert_eq!(state.state, TrialState::Active);
    assert!(state.server_verified);
    assert_eq!(state.trial_start, Some(now));
    assert_eq!(state.trial_end, Some(now + Duration::days(3650)));
    assert_eq!(state.device_hash, device_hash("device-1"));
    assert_eq!(state.metadata[TERMS_ACCEPTED_KEY], now.timestamp_millis());
    assert_eq!(h.local().await, Some(state.clone()));

    let doc = h.docs.get(&paths::trial("u1")).await.unwrap();
    assert_eq!(doc["state"], "ACTIVE");
    assert_eq!(doc["device_hash"], device_hash("device-1"));
    assert_eq!(doc["trial_end"], (now + Duration::days(3650)).timestamp_millis());
    assert_eq!(doc["app_version"], 1);
    assert_eq!(doc["metadata"][TERMS_ACCEPTED_KEY], now.timestamp_millis());

    assert!(h.trials.is_device_valid_for_trial("device-1").await.unwrap());
    assert!(!h.trials.is_device_valid_for_trial("device-2").await.unwrap());
}

#[tokio::test]
async fn failed_trial_publish_stores_nothing() {
    let h = signed_in().await;
    h.docs.put(&paths::trial("u1"), json!({ "state": "NONE" })).await;
    h.trials.get_trial_state().await.unwrap();
    h.docs.fail(&paths::trial("u1")).await;

    // Reading the server now fails too, so the stored NONE state is used.
    let err = h.trials.start_trial("device-1").await.unwrap_err();
    assert!(matches!(err, SyncError::SyncFailed(_)), "{err}");
    assert_eq!(h.local().await.unwrap().state, TrialState::None);
    assert!(!h.trials.is_device_valid_for_trial("device-1").await.unwrap());
}

#[tokio::test]
async fn trial_cannot_be_started_twice() {
    let h = signed_in().await;
    let first = h.trials.start_trial("device-1").await.unwrap();
    h.clock.advance(Duration::days(1));

    let err = h.trials.start_trial("device-2").await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::InvalidTransition {
            from: TrialState::Active,
            to: TrialState::Active
        }
    ));
    assert_eq!(h.local().await.unwrap().trial_start, first.trial_start);
    assert!(h.trials.is_device_valid_for_trial("device-1").await.unwrap());
}

#[tokio::test]
async fn existing_server_trial_blocks_a_new_start_on_a_fresh_install() {
    let h = signed_in().await;
    let start = h.clock.now() - Duration::days(20);
    h.put_server("EXPIRED", start, h.clock.now()).await;

    assert!(matches!(
        h.trials.start_trial("device-9").await,
        Err(SyncError::InvalidTransition {
            from: TrialState::Expired,
            ..
        })
    ));
    let doc = h.docs.get(&paths::trial("u1")).await.unwrap();
    assert_eq!(doc["state"], "EXPIRED");
}

#[tokio::test]
async fn device_check_needs_a_signed_in_user_with_a_trial() {
    let h = harness(Session::default()).await;
    assert!(matches!(
        h.trials.is_device_valid_for_trial("device-1").await,
        Err(SyncError::NotAuthenticated)
    ));

    let h = signed_in().await;
    assert!(!h.trials.is_device_valid_for_trial("device-1").await.unwrap());
}
