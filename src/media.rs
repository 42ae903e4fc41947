//! Local copies of question images.
use anyhow::{anyhow, Context, Result};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, instrument};

use crate::model::ContentItem;
use crate::remote::DocumentStore;

/// Images land at `<root>/assets/<remote path>`.
#[derive(Debug, Clone)]
pub struct MediaDir {
    root: PathBuf,
}

impl MediaDir {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Local path for a remote image path. Absolute paths and `..` are rejected.
    pub fn local_path(&self, remote_path: &str) -> Result<PathBuf> {
        let relative = Path::new(remote_path.trim_start_matches('/'));
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if remote_path.trim().is_empty() || !plain {
            return Err(anyhow!("invalid media path '{}'", remote_path));
        }
        Ok(self.root.join("assets").join(relative))
    }

    pub async fn save(&self, remote_path: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.local_path(remote_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create media dir: {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Download the item's image, if it has one. Already present files are kept.
    #[instrument(skip_all, fields(item_id = %item.id))]
    pub async fn fetch_image(
        &self,
        docs: &dyn DocumentStore,
        item: &ContentItem,
    ) -> Result<Option<PathBuf>> {
        let remote_path = item.image_path.as_deref().filter(|p| !p.trim().is_empty());
        let Some(remote_path) = remote_path else {
            return Ok(None);
        };
        let path = self.local_path(remote_path)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "image already present");
            return Ok(Some(path));
        }
        let bytes = docs
            .fetch_media(remote_path)
            .await?
            .ok_or_else(|| anyhow!("image {} not found", remote_path))?;
        self.save(remote_path, &bytes).await.map(Some)
    }
}
