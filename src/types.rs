//! Core types for the edit history store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the branch every document starts on.
pub const MAIN_BRANCH: &str = "main";

/// Identifier of a document.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NoteId(pub String);

impl NoteId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NoteId({})", self.0)
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NoteId {
    fn from(s: &str) -> Self {
        NoteId(s.to_string())
    }
}

impl From<String> for NoteId {
    fn from(s: String) -> Self {
        NoteId(s)
    }
}

/// Identifier of an edit, unique within a (note, branch).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EditId(pub String);

static EDIT_COUNTER: AtomicU64 = AtomicU64::new(0);

impl EditId {
    /// Generate a fresh, time-ordered edit id.
    pub fn generate() -> Self {
        let counter = EDIT_COUNTER.fetch_add(1, Ordering::Relaxed) & 0xffff_ffff;
        EditId(format!("{:016x}-{:08x}", Timestamp::now().0, counter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EditId({})", self.0)
    }
}

impl fmt::Display for EditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EditId {
    fn from(s: &str) -> Self {
        EditId(s.to_string())
    }
}

impl From<String> for EditId {
    fn from(s: String) -> Self {
        EditId(s)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// How an edit's content is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Complete compressed content.
    Full,
    /// Compressed patch against `previous_edit_id`.
    Diff,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Full => write!(f, "full"),
            StorageType::Diff => write!(f, "diff"),
        }
    }
}

/// Unique key of an edit record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EditKey {
    pub note_id: NoteId,
    pub branch_name: String,
    pub edit_id: EditId,
}

impl EditKey {
    pub fn new(note_id: NoteId, branch_name: impl Into<String>, edit_id: EditId) -> Self {
        Self {
            note_id,
            branch_name: branch_name.into(),
            edit_id,
        }
    }
}

/// One stored snapshot or delta.
///
/// Fields introduced after the first schema carry `#[serde(default)]` so rows
/// written by older versions still decode; migrations backfill them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditRecord {
    /// Auto-assigned by the store.
    #[serde(default)]
    pub seq: u64,

    pub note_id: NoteId,

    pub branch_name: String,

    pub edit_id: EditId,

    /// Compressed full text or patch. Plain UTF-8 for legacy rows.
    pub content: Vec<u8>,

    /// Hex digest of the reconstructed plaintext (not of `content`).
    #[serde(default)]
    pub content_hash: String,

    /// Absent on rows written before compression; those are read as plaintext.
    #[serde(default)]
    pub storage_type: Option<StorageType>,

    /// Nearest full ancestor (own id for full edits).
    #[serde(default)]
    pub base_edit_id: Option<EditId>,

    /// Immediate predecessor in the chain.
    #[serde(default)]
    pub previous_edit_id: Option<EditId>,

    /// Diff hops back to the nearest full ancestor.
    #[serde(default)]
    pub chain_length: u32,

    pub created_at: Timestamp,

    /// Stored (compressed) bytes.
    #[serde(default)]
    pub size: u64,

    /// Bytes of the reconstructed plaintext.
    #[serde(default)]
    pub uncompressed_size: u64,
}

impl EditRecord {
    pub fn key(&self) -> EditKey {
        EditKey::new(
            self.note_id.clone(),
            self.branch_name.clone(),
            self.edit_id.clone(),
        )
    }

    /// Full edits and legacy rows terminate a chain walk.
    pub fn is_chain_root(&self) -> bool {
        !matches!(self.storage_type, Some(StorageType::Diff))
    }

    /// Rows written before compression was introduced.
    pub fn is_legacy(&self) -> bool {
        self.storage_type.is_none()
    }

    pub fn summary(&self) -> StoredEdit {
        StoredEdit {
            note_id: self.note_id.clone(),
            branch_name: self.branch_name.clone(),
            edit_id: self.edit_id.clone(),
            storage_type: self.storage_type.unwrap_or(StorageType::Full),
            base_edit_id: self.base_edit_id.clone(),
            previous_edit_id: self.previous_edit_id.clone(),
            chain_length: self.chain_length,
            content_hash: self.content_hash.clone(),
            size: self.size,
            uncompressed_size: self.uncompressed_size,
            created_at: self.created_at,
        }
    }
}

/// Summary returned after storing an edit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEdit {
    pub note_id: NoteId,
    pub branch_name: String,
    pub edit_id: EditId,
    pub storage_type: StorageType,
    pub base_edit_id: Option<EditId>,
    pub previous_edit_id: Option<EditId>,
    pub chain_length: u32,
    pub content_hash: String,
    pub size: u64,
    pub uncompressed_size: u64,
    pub created_at: Timestamp,
}

/// Context a caller needs to decide the next save.
#[derive(Clone, Debug, PartialEq)]
pub struct PreviousContext {
    pub edit_id: EditId,
    pub content: String,
    pub content_hash: String,
    pub base_edit_id: EditId,
    pub chain_length: u32,
}

/// Rebuilt content of one edit.
#[derive(Clone, Debug, PartialEq)]
pub struct Reconstruction {
    pub content: String,
    /// Hash of `content` as computed during reconstruction.
    pub content_hash: String,
    /// Whether `content_hash` matches the stored hash.
    pub verified: bool,
    /// Patches applied on top of the chain root.
    pub hops: usize,
}

/// Options for integrity verification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerifyOptions {
    /// Rewrite hash and size fields of records whose content reconstructs
    /// but whose stored hash disagrees.
    pub fix: bool,
}

impl VerifyOptions {
    pub fn read_only() -> Self {
        Self { fix: false }
    }

    pub fn heal() -> Self {
        Self { fix: true }
    }
}

/// Outcome of verifying one edit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntegrityCheckResult {
    pub note_id: NoteId,
    pub branch_name: String,
    pub edit_id: EditId,
    pub valid: bool,
    pub expected_hash: String,
    /// None when the edit could not be reconstructed.
    pub actual_hash: Option<String>,
    pub was_healed: bool,
    /// Reconstruction failure, if any.
    pub error: Option<String>,
}
