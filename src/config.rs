//! Engine configuration.

use crate::chain::ChainPolicyConfig;
use crate::error::{HistoryError, Result};
use crate::storage::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for [`EditHistory`](crate::EditHistory).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Directory of the on-disk store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    pub chain: ChainPolicyConfig,

    pub retry: RetryConfig,

    /// How long a mutating operation waits for its keys.
    pub lock_timeout_ms: u64,

    /// How long a [`HistoryClient`](crate::HistoryClient) waits for a reply.
    pub request_timeout_ms: u64,

    /// Edits verified per batch.
    pub verify_batch_size: usize,

    /// Reconstructed contents kept in memory. Zero disables the cache.
    pub reconstruction_cache_size: usize,

    /// Store quota in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_store_bytes: Option<u64>,

    pub worker_threads: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./edit-history"),
            create_if_missing: true,
            chain: ChainPolicyConfig::default(),
            retry: RetryConfig::default(),
            lock_timeout_ms: 30_000,
            request_timeout_ms: 60_000,
            verify_batch_size: 50,
            reconstruction_cache_size: 256,
            max_store_bytes: None,
            worker_threads: 2,
        }
    }
}

impl HistoryConfig {
    /// Default configuration rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.verify_batch_size == 0 {
            return Err(HistoryError::Validation("verify_batch_size must be positive".into()));
        }
        if self.worker_threads == 0 {
            return Err(HistoryError::Validation("worker_threads must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(HistoryError::Validation("retry.max_attempts must be positive".into()));
        }
        let ratio = self.chain.max_patch_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(HistoryError::Validation(format!(
                "chain.max_patch_ratio must be in (0, 1], got {ratio}"
            )));
        }
        if self.chain.small_content_bytes > self.chain.medium_content_bytes {
            return Err(HistoryError::Validation(
                "chain.small_content_bytes exceeds chain.medium_content_bytes".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
