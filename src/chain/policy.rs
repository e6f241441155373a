//! Full-versus-diff decision for new edits.

use super::MAX_CHAIN_LENGTH;
use crate::patch::Patcher;
use crate::types::EditRecord;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Tunable thresholds for the chain policy.
///
/// Caps are exclusive: a diff is written only while the resulting chain
/// length stays below the cap for the predecessor's size tier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainPolicyConfig {
    /// Predecessors below this many bytes use `small_max_chain`.
    pub small_content_bytes: usize,
    /// Predecessors below this many bytes use `medium_max_chain`.
    pub medium_content_bytes: usize,
    pub small_max_chain: u32,
    pub medium_max_chain: u32,
    pub large_max_chain: u32,
    /// Patches larger than this fraction of the new content are not worth it.
    pub max_patch_ratio: f64,
    /// New content below this size always chains regardless of patch ratio.
    pub min_ratio_check_bytes: usize,
}

impl Default for ChainPolicyConfig {
    fn default() -> Self {
        Self {
            small_content_bytes: 10 * 1024,
            medium_content_bytes: 100 * 1024,
            small_max_chain: MAX_CHAIN_LENGTH as u32,
            medium_max_chain: 10,
            large_max_chain: 2,
            max_patch_ratio: 0.8,
            min_ratio_check_bytes: 1024,
        }
    }
}

impl ChainPolicyConfig {
    /// Longest chain any tier can produce, used to bound reconstruction walks.
    pub fn max_chain_length(&self) -> usize {
        self.small_max_chain
            .max(self.medium_max_chain)
            .max(self.large_max_chain) as usize
    }
}

/// The edit a new one would chain from.
#[derive(Clone, Copy, Debug)]
pub struct Predecessor<'a> {
    pub record: &'a EditRecord,
    /// Reconstructed content of `record`.
    pub content: &'a str,
}

/// Why an edit is stored in full.
#[derive(Clone, Debug, PartialEq)]
pub enum FullReason {
    FirstEdit,
    ChainLimit { limit: u32 },
    PatchTooLarge { patch_bytes: usize, content_bytes: usize },
    PredecessorUnavailable,
    /// The patch did not replay onto the predecessor as the new content.
    PatchMismatch,
}

/// Storage shape chosen for a new edit.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageDecision {
    Full { reason: FullReason },
    Diff { patch: String, chain_length: u32 },
}

impl StorageDecision {
    pub fn is_full(&self) -> bool {
        matches!(self, StorageDecision::Full { .. })
    }
}

/// Decides whether a new edit is stored as full content or as a diff.
#[derive(Clone, Debug, Default)]
pub struct ChainPolicy {
    config: ChainPolicyConfig,
}

impl ChainPolicy {
    pub fn new(config: ChainPolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChainPolicyConfig {
        &self.config
    }

    /// Chain cap for a predecessor of the given plaintext size.
    pub fn chain_limit(&self, predecessor_bytes: usize) -> u32 {
        if predecessor_bytes < self.config.small_content_bytes {
            self.config.small_max_chain
        } else if predecessor_bytes < self.config.medium_content_bytes {
            self.config.medium_max_chain
        } else {
            self.config.large_max_chain
        }
    }

    pub fn decide(
        &self,
        previous: Option<Predecessor<'_>>,
        new_content: &str,
        patch_id: &str,
        patcher: &dyn Patcher,
    ) -> StorageDecision {
        let Some(previous) = previous else {
            return StorageDecision::Full {
                reason: FullReason::FirstEdit,
            };
        };

        let chain_length = previous.record.chain_length + 1;
        let limit = self.chain_limit(previous.content.len());
        if chain_length >= limit {
            return StorageDecision::Full {
                reason: FullReason::ChainLimit { limit },
            };
        }

        let patch = patcher.create_patch(previous.content, new_content, patch_id);
        let patch_bytes = patcher.patch_size(&patch);
        let content_bytes = new_content.len();
        if content_bytes >= self.config.min_ratio_check_bytes
            && patch_bytes as f64 > self.config.max_patch_ratio * content_bytes as f64
        {
            return StorageDecision::Full {
                reason: FullReason::PatchTooLarge {
                    patch_bytes,
                    content_bytes,
                },
            };
        }

        // A diff is kept only if it rebuilds the new content exactly.
        match patcher.apply_patch(previous.content, &patch) {
            Ok(rebuilt) if rebuilt == new_content => {}
            Ok(_) => {
                warn!(patch_id, "patch replays to different content, storing full edit");
                return StorageDecision::Full {
                    reason: FullReason::PatchMismatch,
                };
            }
            Err(e) => {
                warn!(patch_id, error = %e, "patch does not apply to its base, storing full edit");
                return StorageDecision::Full {
                    reason: FullReason::PatchMismatch,
                };
            }
        }

        StorageDecision::Diff {
            patch,
            chain_length,
        }
    }
}
