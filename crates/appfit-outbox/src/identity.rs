//! Identity context attached to outgoing events.

use crate::persistence::write_atomic;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The (user, device) pair an event is attributed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityContext {
    /// Authenticated user, if the host has identified one.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Stable per-installation identifier.
    #[serde(default)]
    pub anonymous_id: Option<String>,
}

/// Source of the identity context.
///
/// Implementations never fail outward: storage problems are logged and the
/// last known values are served.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Current authenticated user id.
    async fn user_id(&self) -> Option<String>;

    /// Current anonymous id.
    async fn anonymous_id(&self) -> Option<String>;

    /// Replace (or clear) the authenticated user id.
    async fn save_user_id(&self, user_id: Option<String>);

    /// Create the anonymous id if none exists yet. Idempotent.
    async fn generate_anonymous_id(&self);

    /// Resolve both ids at once.
    async fn context(&self) -> IdentityContext {
        IdentityContext {
            user_id: self.user_id().await,
            anonymous_id: self.anonymous_id().await,
        }
    }
}

/// Identity kept only in memory.
#[derive(Debug, Default)]
pub struct InMemoryIdentity {
    state: RwLock<IdentityContext>,
}

impl InMemoryIdentity {
    /// Create an empty identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an identity with fixed values.
    pub fn with_context(context: IdentityContext) -> Self {
        Self {
            state: RwLock::new(context),
        }
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentity {
    async fn user_id(&self) -> Option<String> {
        self.state.read().await.user_id.clone()
    }

    async fn anonymous_id(&self) -> Option<String> {
        self.state.read().await.anonymous_id.clone()
    }

    async fn save_user_id(&self, user_id: Option<String>) {
        self.state.write().await.user_id = user_id;
    }

    async fn generate_anonymous_id(&self) {
        let mut state = self.state.write().await;
        if state.anonymous_id.is_none() {
            state.anonymous_id = Some(Uuid::new_v4().to_string());
        }
    }

    async fn context(&self) -> IdentityContext {
        self.state.read().await.clone()
    }
}

/// Identity persisted as JSON next to the event cache.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    state: Mutex<IdentityContext>,
}

impl FileIdentityStore {
    /// Open the identity file, starting empty if it is missing or unreadable.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<IdentityContext>(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Discarding unreadable identity file");
                    IdentityContext::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => IdentityContext::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read identity file");
                IdentityContext::default()
            }
        };

        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Get the identity file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn persist(&self, state: &IdentityContext) {
        let payload = match serde_json::to_vec_pretty(state) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode identity");
                return;
            }
        };

        if let Err(e) = write_atomic(&self.path, &payload).await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist identity");
        }
    }
}

#[async_trait]
impl IdentityProvider for FileIdentityStore {
    async fn user_id(&self) -> Option<String> {
        self.state.lock().await.user_id.clone()
    }

    async fn anonymous_id(&self) -> Option<String> {
        self.state.lock().await.anonymous_id.clone()
    }

    async fn save_user_id(&self, user_id: Option<String>) {
        // Held across the write so concurrent updates reach disk in order.
        let mut state = self.state.lock().await;
        if state.user_id == user_id {
            return;
        }
        state.user_id = user_id;
        self.persist(&state).await;
        debug!(identified = state.user_id.is_some(), "Saved user id");
    }

    async fn generate_anonymous_id(&self) {
        let mut state = self.state.lock().await;
        if state.anonymous_id.is_some() {
            return;
        }
        let anonymous_id = Uuid::new_v4().to_string();
        info!(anonymous_id = %anonymous_id, "Generated anonymous id");
        state.anonymous_id = Some(anonymous_id);
        self.persist(&state).await;
    }

    async fn context(&self) -> IdentityContext {
        self.state.lock().await.clone()
    }
}
