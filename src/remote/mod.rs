use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::{ContentItem, PackManifest, PurchaseRecord};

pub mod model;

pub use model::Document;
use model::{CollectionResponse, PackDoc, PurchaseDoc, QuestionDoc};

/// Document paths used by the app.
pub mod paths {
    pub fn user(user_id: &str) -> String {
        format!("users/{}", user_id)
    }

    pub fn purchased_packs(user_id: &str) -> String {
        format!("users/{}/purchased_packs", user_id)
    }

    pub fn purchased_pack(user_id: &str, pack_id: &str) -> String {
        format!("users/{}/purchased_packs/{}", user_id, pack_id)
    }

    pub fn pack(pack_id: &str) -> String {
        format!("question_packs/{}", pack_id)
    }

    pub fn question(id: &str) -> String {
        format!("questions/{}", id)
    }

    pub fn trial(user_id: &str) -> String {
        format!("trials/{}", user_id)
    }

    pub fn connection_check(id: &str) -> String {
        format!("sync_tests/{}", id)
    }
}

/// Document-oriented access to the remote backend.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read_collection(&self, path: &str) -> Result<Vec<Document>>;

    /// `Ok(None)` when the document does not exist.
    async fn read_document(&self, path: &str) -> Result<Option<Document>>;

    async fn write_document(&self, path: &str, fields: Value) -> Result<()>;

    /// Raw bytes of a stored file such as a question image; `Ok(None)` when absent.
    async fn fetch_media(&self, path: &str) -> Result<Option<Vec<u8>>>;
}

pub fn decode<T: DeserializeOwned>(doc: &Document) -> Result<T> {
    serde_json::from_value(doc.fields.clone())
        .with_context(|| format!("malformed document {}", doc.id))
}

pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to encode document")
}

/// Purchases recorded for `user_id`. Documents that fail to decode are skipped.
pub async fn list_purchases(
    docs: &dyn DocumentStore,
    user_id: &str,
) -> Result<Vec<PurchaseRecord>> {
    let documents = docs
        .read_collection(&paths::purchased_packs(user_id))
        .await
        .context("failed to list purchased packs")?;
    let mut records = Vec::with_capacity(documents.len());
    for doc in &documents {
        match decode::<PurchaseDoc>(doc) {
            Ok(purchase) => records.push(purchase.into_record(user_id, &doc.id)),
            Err(err) => warn!(?err, doc_id = %doc.id, "skipping purchased pack document"),
        }
    }
    Ok(records)
}

pub async fn fetch_manifest(docs: &dyn DocumentStore, pack_id: &str) -> Result<PackManifest> {
    let doc = docs
        .read_document(&paths::pack(pack_id))
        .await
        .with_context(|| format!("failed to fetch pack {}", pack_id))?
        .ok_or_else(|| anyhow!("pack {} not found", pack_id))?;
    Ok(decode::<PackDoc>(&doc)?.into_manifest(pack_id))
}

pub async fn fetch_question(
    docs: &dyn DocumentStore,
    id: &str,
    pack_id: &str,
) -> Result<ContentItem> {
    let doc = docs
        .read_document(&paths::question(id))
        .await?
        .ok_or_else(|| anyhow!("question {} not found", id))?;
    Ok(decode::<QuestionDoc>(&doc)?.into_item(id, pack_id))
}

pub async fn write_purchase(docs: &dyn DocumentStore, record: &PurchaseRecord) -> Result<()> {
    let fields = encode(&PurchaseDoc::from_record(record))?;
    docs.write_document(
        &paths::purchased_pack(&record.user_id, &record.pack_id),
        fields,
    )
    .await
    .context("failed to write purchased pack")
}

const DEFAULT_USER_AGENT: &str = "smartexam-sync/0.1";

/// REST client for the document service.
///
/// Collections and documents live under `v1/documents/{path}`; reads are
/// `GET`, writes are `PUT` with a `{"fields": ...}` body. Files are plain
/// `GET`s under `v1/media/{path}`.
#[derive(Clone)]
pub struct RestDocumentClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for RestDocumentClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestDocumentClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RestDocumentClient {
    pub fn new(base_url: Url, token: String) -> Result<Self> {
        let http = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.remote.base_url).context("invalid remote.base_url")?;
        Self::new(base_url, cfg.remote.token.clone())
    }

    fn endpoint(&self, root: &str, path: &str) -> Result<Url> {
        let path = path.trim_matches('/');
        if path.is_empty() || path.split('/').any(|s| s.is_empty() || s == "..") {
            return Err(anyhow!("invalid document path '{}'", path));
        }
        self.base_url
            .join(&format!("v1/{}/{}", root, path))
            .context("invalid document service base URL")
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Request> {
        let mut builder = self
            .http
            .request(method, self.endpoint("documents", path)?)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.build().context("failed to build document request")
    }

    pub fn build_media_request(&self, path: &str) -> Result<reqwest::Request> {
        self.http
            .get(self.endpoint("media", path)?)
            .header("Authorization", format!("Bearer {}", self.token))
            .build()
            .context("failed to build media request")
    }

    /// Execute a request; `Ok(None)` for 404, error for any other non-2xx.
    async fn execute(&self, request: reqwest::Request) -> Result<Option<reqwest::Response>> {
        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, %url, "document request");

        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach document service")?;
        let status = res.status();
        debug!(%method, %url, %status, "document response");

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, "rate limited by document service: {}", body);
            return Err(anyhow!("received 429 from document service: {}", body));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(anyhow!("document service rejected credentials ({})", status));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, %status, "document service error: {}", body);
            return Err(anyhow!("document service error {}: {}", status, body));
        }
        Ok(Some(res))
    }

    async fn execute_text(&self, request: reqwest::Request) -> Result<Option<String>> {
        let Some(res) = self.execute(request).await? else {
            return Ok(None);
        };
        let body = res
            .text()
            .await
            .context("failed to read document service response")?;
        Ok(Some(body))
    }
}

#[async_trait]
impl DocumentStore for RestDocumentClient {
    async fn read_collection(&self, path: &str) -> Result<Vec<Document>> {
        let request = self.build_request(Method::GET, path, None)?;
        let Some(body) = self.execute_text(request).await? else {
            return Ok(Vec::new());
        };
        let payload: CollectionResponse =
            serde_json::from_str(&body).context("invalid collection response JSON")?;
        Ok(payload.documents)
    }

    async fn read_document(&self, path: &str) -> Result<Option<Document>> {
        let request = self.build_request(Method::GET, path, None)?;
        let Some(body) = self.execute_text(request).await? else {
            return Ok(None);
        };
        let doc: Document =
            serde_json::from_str(&body).context("invalid document response JSON")?;
        Ok(Some(doc))
    }

    async fn write_document(&self, path: &str, fields: Value) -> Result<()> {
        let body = json!({ "fields": fields });
        let request = self.build_request(Method::PUT, path, Some(&body))?;
        match self.execute(request).await? {
            Some(_) => Ok(()),
            None => Err(anyhow!("document parent for {} not found", path)),
        }
    }

    async fn fetch_media(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let request = self.build_media_request(path)?;
        let Some(res) = self.execute(request).await? else {
            return Ok(None);
        };
        let bytes = res.bytes().await.context("failed to read media body")?;
        Ok(Some(bytes.to_vec()))
    }
}
