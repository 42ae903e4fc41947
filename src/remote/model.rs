//! Wire shapes of the documents stored in the remote service.
//!
//! Timestamps travel as epoch milliseconds and field names are camelCase,
//! except for trial documents which use snake_case keys.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::model::{ContentItem, PackManifest, PurchaseRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: Value,
}

#[derive(Debug, Deserialize)]
pub struct CollectionResponse {
    #[serde(default)]
    pub documents: Vec<Document>,
}

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// `users/{uid}/purchased_packs/{packId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseDoc {
    #[serde(default)]
    pub pack_id: Option<String>,
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub purchased_at: i64,
    #[serde(default)]
    pub synced: bool,
}

impl PurchaseDoc {
    pub fn from_record(record: &PurchaseRecord) -> Self {
        Self {
            pack_id: Some(record.pack_id.clone()),
            transaction_id: record.transaction_id.clone(),
            purchased_at: record.purchased_at.timestamp_millis(),
            synced: record.synced,
        }
    }

    /// The document id is authoritative for the pack id.
    pub fn into_record(self, user_id: &str, doc_id: &str) -> PurchaseRecord {
        PurchaseRecord {
            user_id: user_id.to_string(),
            pack_id: doc_id.to_string(),
            transaction_id: self.transaction_id,
            purchased_at: millis_to_datetime(self.purchased_at),
            synced: self.synced,
        }
    }
}

/// `question_packs/{packId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackDoc {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub question_ids: Vec<String>,
}

impl PackDoc {
    pub fn into_manifest(self, pack_id: &str) -> PackManifest {
        PackManifest {
            pack_id: pack_id.to_string(),
            title: self.title,
            question_ids: self.question_ids,
        }
    }
}

/// `questions/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct QuestionDoc {
    pub pack_id: Option<String>,
    pub subject: Option<String>,
    pub grade: i64,
    pub topic: Option<String>,
    #[serde(rename = "type")]
    pub question_type: Option<String>,
    pub cognitive_level: Option<String>,
    pub marks: i64,
    pub difficulty: Option<String>,
    pub question_text: String,
    pub content: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub image_path: Option<String>,
    pub version: i64,
    pub created_at: i64,
}

impl QuestionDoc {
    /// Questions without a pack reference are attributed to the pack that listed them.
    pub fn into_item(self, id: &str, listing_pack_id: &str) -> ContentItem {
        ContentItem {
            id: id.to_string(),
            pack_id: self
                .pack_id
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| listing_pack_id.to_string()),
            subject: self.subject,
            grade: self.grade,
            topic: self.topic,
            question_type: self.question_type,
            cognitive_level: self.cognitive_level,
            marks: self.marks,
            difficulty: self.difficulty,
            question_text: self.question_text,
            content: self.content,
            tags: self.tags,
            image_path: self.image_path,
            version: self.version,
            created_at: millis_to_datetime(self.created_at),
        }
    }
}

/// `users/{uid}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserDoc {
    pub user_id: String,
    pub created_at: i64,
}

/// `trials/{uid}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialDoc {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub trial_start: i64,
    #[serde(default)]
    pub trial_end: i64,
    #[serde(default)]
    pub device_hash: Option<String>,
    #[serde(default)]
    pub last_sync: Option<i64>,
    #[serde(default)]
    pub app_version: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn question_doc_tolerates_missing_fields() {
        let doc: QuestionDoc = serde_json::from_value(json!({
            "questionText": "Name the capital of France",
            "type": "SHORT_ANSWER",
            "marks": 2,
            "createdAt": 1_700_000_000_000i64
        }))
        .unwrap();
        let item = doc.into_item("q7", "geo-1");
        assert_eq!(item.id, "q7");
        assert_eq!(item.pack_id, "geo-1");
        assert_eq!(item.question_type.as_deref(), Some("SHORT_ANSWER"));
        assert_eq!(item.marks, 2);
        assert!(item.tags.is_empty());
        assert_eq!(item.created_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn purchase_doc_takes_pack_id_from_document_id() {
        let doc: PurchaseDoc = serde_json::from_value(json!({
            "packId": "stale",
            "transactionId": "GPA.1234",
            "purchasedAt": 1_700_000_000_000i64,
            "synced": false
        }))
        .unwrap();
        let record = doc.into_record("u1", "p1");
        assert_eq!(record.pack_id, "p1");
        assert_eq!(record.user_id, "u1");
        assert_eq!(record.transaction_id, "GPA.1234");
        assert!(!record.synced);
    }
}
