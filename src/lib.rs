//! # Edit History
//!
//! Durable, branch-aware edit history for text documents.
//!
//! ## Core Concepts
//!
//! - **Delta chains**: Each save is stored either as full compressed content
//!   or as a compressed patch against the previous edit; a chain policy caps
//!   chain length by document size and falls back to full storage when a
//!   patch would not pay off
//! - **Reconstruction**: Any edit is rebuilt by walking back to its nearest
//!   full ancestor and replaying patches, with cycle and length guards
//! - **Integrity**: Every edit carries a SHA-256 hash of its plaintext;
//!   verification rebuilds and compares, and healing rewrites stale hashes
//! - **Manifests**: A per-note summary of branches and edits, kept in step
//!   with the records in the same transaction
//! - **Serialization**: Mutations on one (note, branch) run one at a time
//!   in arrival order
//!
//! ## Example
//!
//! ```ignore
//! use edit_history::{EditHistory, HistoryConfig, NoteId, MAIN_BRANCH};
//!
//! let history = EditHistory::open(HistoryConfig::at("./history"))?;
//! let note = NoteId::from("note-1");
//!
//! let first = history.store_edit(&note, MAIN_BRANCH, "A\nB\nC".into(), None)?;
//! let second = history.store_edit(
//!     &note,
//!     MAIN_BRANCH,
//!     "A\nB\nC\nD".into(),
//!     Some(first.edit_id.clone()),
//! )?;
//!
//! let rebuilt = history.reconstruct(&note, MAIN_BRANCH, &second.edit_id)?;
//! assert_eq!(rebuilt.content, "A\nB\nC\nD");
//! ```

pub mod audit;
pub mod chain;
pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod history;
pub mod keyed_mutex;
pub mod manifest;
pub mod patch;
pub mod storage;
pub mod types;
pub mod worker;

// Re-exports
pub use chain::{
    ChainIssue, ChainIssueKind, ChainMap, ChainPolicy, ChainPolicyConfig, ChainReport,
    FullReason, StorageDecision, MAX_CHAIN_LENGTH,
};
pub use config::HistoryConfig;
pub use error::{ErrorKind, ErrorPolicy, HistoryError, ReconstructionError, Result, Severity};
pub use hash::{compute_hash, verify_integrity};
pub use history::{EditHistory, DELETE_BATCH_SIZE};
pub use keyed_mutex::{KeyGuard, KeyedMutex, Priority};
pub use manifest::{BranchEntry, EditSummary, Manifest, ManifestRepair};
pub use patch::{Patcher, UnifiedPatcher};
pub use storage::{
    Database, Fault, LogBackend, MemoryBackend, RetryConfig, StorageBackend, WriteBatch,
    WriteOp,
};
pub use types::*;
pub use worker::{HistoryClient, HistoryWorker, Request};
