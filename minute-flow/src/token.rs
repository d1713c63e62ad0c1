use crate::error::FeedError;
use async_trait::async_trait;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use smol_str::SmolStr;
use std::{path::PathBuf, sync::Arc};
use tracing::info;

/// Backing store of upstream access tokens, keyed by token owner.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, owner: &str) -> Result<String, FeedError>;
}

/// In-memory token cache in front of a [`TokenSource`].
///
/// Tokens are fetched on first use and only re-fetched by an explicit [`TokenCache::refresh`].
/// Readers never wait on a fetch.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    tokens: RwLock<FnvHashMap<SmolStr, String>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("owners", &self.tokens.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            tokens: RwLock::new(FnvHashMap::default()),
        }
    }

    /// Cached token for `owner`, fetching it from the source on first use.
    pub async fn get(&self, owner: &str) -> Result<String, FeedError> {
        let cached = self.tokens.read().get(owner).cloned();
        if let Some(token) = cached {
            return Ok(token);
        }

        self.refresh(owner).await
    }

    /// Re-fetch the token for `owner` and replace the cached value.
    pub async fn refresh(&self, owner: &str) -> Result<String, FeedError> {
        let token = self.source.fetch(owner).await?;
        if token.is_empty() {
            return Err(FeedError::Token {
                owner: SmolStr::new(owner),
                reason: "empty access token".to_string(),
            });
        }

        self.tokens
            .write()
            .insert(SmolStr::new(owner), token.clone());
        info!(owner, "refreshed cached access token");

        Ok(token)
    }

    pub fn is_cached(&self, owner: &str) -> bool {
        self.tokens.read().contains_key(owner)
    }
}

#[derive(Deserialize)]
struct StoredToken {
    access_token: String,
}

/// [`TokenSource`] reading a JSON object of `{"<owner>": {"access_token": "..."}}`.
///
/// The file is re-read on every fetch, so an external login process can rotate tokens.
#[derive(Debug, Clone)]
pub struct JsonFileTokenSource {
    path: PathBuf,
}

impl JsonFileTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenSource for JsonFileTokenSource {
    async fn fetch(&self, owner: &str) -> Result<String, FeedError> {
        let error = |reason: String| FeedError::Token {
            owner: SmolStr::new(owner),
            reason,
        };

        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|e| error(format!("{}: {e}", self.path.display())))?;

        let mut tokens = serde_json::from_slice::<FnvHashMap<String, StoredToken>>(&raw)
            .map_err(|e| error(format!("{}: {e}", self.path.display())))?;

        tokens
            .remove(owner)
            .map(|stored| stored.access_token)
            .ok_or_else(|| error("token not found".to_string()))
    }
}
