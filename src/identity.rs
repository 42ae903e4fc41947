use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{SyncError, SyncResult};

/// Resolves the signed-in user, if any.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user_id(&self) -> Option<String>;
}

/// Current user id or `NotAuthenticated`. Blank ids count as signed out.
pub async fn require_user(identity: &dyn IdentityProvider) -> SyncResult<String> {
    identity
        .current_user_id()
        .await
        .filter(|id| !id.trim().is_empty())
        .ok_or(SyncError::NotAuthenticated)
}

/// In-process session holding the signed-in user id.
#[derive(Debug, Default)]
pub struct Session {
    user_id: RwLock<Option<String>>,
}

impl Session {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: RwLock::new(Some(user_id.into())),
        }
    }

    pub async fn sign_in(&self, user_id: impl Into<String>) {
        *self.user_id.write().await = Some(user_id.into());
    }

    pub async fn sign_out(&self) {
        *self.user_id.write().await = None;
    }
}

#[async_trait]
impl IdentityProvider for Session {
    async fn current_user_id(&self) -> Option<String> {
        self.user_id.read().await.clone()
    }
}
