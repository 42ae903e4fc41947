use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A pack the user owns. `synced` flips to true once every question of the
/// pack is present in the local store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurchaseRecord {
    pub user_id: String,
    pub pack_id: String,
    pub transaction_id: String,
    pub purchased_at: DateTime<Utc>,
    pub synced: bool,
}

impl PurchaseRecord {
    pub fn new(user_id: &str, pack_id: &str, transaction_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            pack_id: pack_id.to_string(),
            transaction_id: transaction_id.to_string(),
            purchased_at: Utc::now(),
            synced: false,
        }
    }
}

/// A single question belonging to a pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentItem {
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
    pub content: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub image_path: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// List of question ids making up a pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackManifest {
    pub pack_id: String,
    pub title: Option<String>,
    pub question_ids: Vec<String>,
}

/// Queued request to download the content of a freshly purchased pack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncJob {
    pub id: i64,
    pub user_id: String,
    pub pack_id: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialState {
    None,
    Active,
    Expired,
    Converted,
    Suspended,
    Cancelled,
}

impl TrialState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialState::None => "NONE",
            TrialState::Active => "ACTIVE",
            TrialState::Expired => "EXPIRED",
            TrialState::Converted => "CONVERTED",
            TrialState::Suspended => "SUSPENDED",
            TrialState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse_state(value: &str) -> Option<Self> {
        match value {
            "NONE" => Some(TrialState::None),
            "ACTIVE" => Some(TrialState::Active),
            "EXPIRED" => Some(TrialState::Expired),
            "CONVERTED" => Some(TrialState::Converted),
            "SUSPENDED" => Some(TrialState::Suspended),
            "CANCELLED" => Some(TrialState::Cancelled),
            _ => None,
        }
    }

    /// Converted and cancelled trials never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrialState::Converted | TrialState::Cancelled)
    }
}

impl std::fmt::Display for TrialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
