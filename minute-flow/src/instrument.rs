use crate::error::FeedError;
use async_trait::async_trait;
use derive_more::{Constructor, Display};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::path::PathBuf;

/// Opaque upstream instrument key, eg/ "NSE_EQ|INE002A01018".
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct InstrumentKey(pub SmolStr);

impl InstrumentKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(SmolStr::new(key))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for InstrumentKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Immutable instrument identity: upstream key plus display symbol.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Constructor, Deserialize, Serialize)]
pub struct Instrument {
    #[serde(rename = "instrument_key")]
    pub key: InstrumentKey,
    pub symbol: SmolStr,
}

/// Source of the instrument list, read once per connection cycle.
#[async_trait]
pub trait InstrumentDirectory: Send + Sync {
    async fn instruments(&self) -> Result<Vec<Instrument>, FeedError>;
}

/// Fixed in-memory instrument list.
#[derive(Debug, Clone, Default, Constructor)]
pub struct StaticDirectory {
    instruments: Vec<Instrument>,
}

#[async_trait]
impl InstrumentDirectory for StaticDirectory {
    async fn instruments(&self) -> Result<Vec<Instrument>, FeedError> {
        Ok(self.instruments.clone())
    }
}

/// Instrument list stored as a JSON array of `{"instrument_key", "symbol"}` objects.
///
/// The file is re-read on every call so edits are picked up on the next reconnect.
#[derive(Debug, Clone, Constructor)]
pub struct JsonFileDirectory {
    path: PathBuf,
}

#[async_trait]
impl InstrumentDirectory for JsonFileDirectory {
    async fn instruments(&self) -> Result<Vec<Instrument>, FeedError> {
        let raw = tokio::fs::read(&self.path).await.map_err(|error| {
            FeedError::Directory(format!("{}: {error}", self.path.display()))
        })?;

        serde_json::from_slice(&raw)
            .map_err(|error| FeedError::Directory(format!("{}: {error}", self.path.display())))
    }
}
