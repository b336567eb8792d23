//! Source backend contract.
//!
//! A source is a named key-value accessor. Payloads cross this object-safe
//! boundary as `serde_json::Value`; typed encode/decode happens in the facade.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::tasks::TaskLauncher;

/// Change notification delivered to a watch callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Update,
    Delete,
}

/// Callback invoked synchronously by a watch task for every change.
pub type WatchCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// The key is absent. Persistent sources have already written the default back.
    #[error("key '{key}' not found")]
    NotFound { key: String },
    #[error("operation on key '{key}' timed out after {after:?}")]
    Timeout { key: String, after: Duration },
    #[error("failed to encode or decode key '{key}': {message}")]
    Codec { key: String, message: String },
    #[error("backend failure for key '{key}': {source}")]
    Backend {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("source does not support watching")]
    WatchUnsupported,
}

impl SourceError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[async_trait]
pub trait Source: Send + Sync {
    /// Diagnostic name of the backend (e.g. `memory`, `file`, `kv`).
    fn name(&self) -> &str;

    /// Whether missing keys are seeded with the caller's default on `scan`.
    fn is_persistent(&self) -> bool {
        false
    }

    /// Replace `target` with the stored value of `key`.
    ///
    /// On entry `target` holds the caller's default. When the key is missing the
    /// source returns [`SourceError::NotFound`] and leaves `target` untouched; a
    /// persistent source writes `target` back under `key` first.
    async fn scan(&self, key: &str, target: &mut Value) -> Result<(), SourceError>;

    async fn has(&self, key: &str) -> Result<bool, SourceError>;

    /// Start watching `key`. Watch tasks run on `tasks` until `cancel` fires.
    async fn watch(
        &self,
        tasks: &TaskLauncher,
        cancel: CancellationToken,
        key: &str,
        callback: WatchCallback,
    ) -> Result<(), SourceError> {
        let _ = (tasks, cancel, key, callback);
        Err(SourceError::WatchUnsupported)
    }
}

/// Serialization of stored payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    Yaml,
}

impl Format {
    /// Encode `value` for storage.
    ///
    /// # Errors
    /// Returns [`SourceError::Codec`] if the value cannot be serialized.
    pub fn encode(self, key: &str, value: &Value) -> Result<Vec<u8>, SourceError> {
        let encoded = match self {
            Self::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            Self::Yaml => serde_saphyr::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| e.to_string()),
        };
        encoded.map_err(|message| SourceError::Codec {
            key: key.to_owned(),
            message,
        })
    }

    /// Decode a stored payload.
    ///
    /// # Errors
    /// Returns [`SourceError::Codec`] if the payload is malformed.
    pub fn decode(self, key: &str, raw: &[u8]) -> Result<Value, SourceError> {
        let decoded = match self {
            Self::Json => serde_json::from_slice(raw).map_err(|e| e.to_string()),
            Self::Yaml => std::str::from_utf8(raw)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_saphyr::from_str(text).map_err(|e| e.to_string())),
        };
        decoded.map_err(|message| SourceError::Codec {
            key: key.to_owned(),
            message,
        })
    }

    /// Pick a format from a file extension; anything but `json` is YAML.
    #[must_use]
    pub fn from_extension(ext: Option<&str>) -> Self {
        match ext {
            Some(e) if e.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}
