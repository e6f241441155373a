//! Storage backend contract and write batches.

use crate::error::Result;
use crate::manifest::Manifest;
use crate::types::{EditKey, EditRecord, NoteId, Timestamp};
use serde::{Deserialize, Serialize};

/// One mutation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    PutEdit(EditRecord),
    DeleteEdit(EditKey),
    PutManifest(Manifest),
    DeleteManifest(NoteId),
}

/// Mutations committed atomically.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: Vec<WriteOp>) -> Self {
        Self { ops }
    }

    pub fn put_edit(&mut self, record: EditRecord) -> &mut Self {
        self.ops.push(WriteOp::PutEdit(record));
        self
    }

    pub fn delete_edit(&mut self, key: EditKey) -> &mut Self {
        self.ops.push(WriteOp::DeleteEdit(key));
        self
    }

    pub fn put_manifest(&mut self, manifest: Manifest) -> &mut Self {
        self.ops.push(WriteOp::PutManifest(manifest));
        self
    }

    pub fn delete_manifest(&mut self, note_id: NoteId) -> &mut Self {
        self.ops.push(WriteOp::DeleteManifest(note_id));
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut [WriteOp] {
        &mut self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Bytes the batch adds to the store, for quota checks.
    pub fn added_bytes(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                WriteOp::PutEdit(record) => record_footprint(record),
                _ => 0,
            })
            .sum()
    }
}

/// Approximate stored size of a record.
pub fn record_footprint(record: &EditRecord) -> u64 {
    const FIXED: u64 = 128;
    FIXED
        + record.content.len() as u64
        + record.content_hash.len() as u64
        + record.note_id.as_str().len() as u64
        + record.branch_name.len() as u64
        + record.edit_id.as_str().len() as u64
}

/// Durable keyed storage for edit records and manifests.
///
/// Implementations assign the sequence id of new records on commit and keep
/// the existing one when a key is overwritten.
pub trait StorageBackend: Send + Sync {
    /// Open or reopen the connection.
    fn open(&self) -> Result<()>;

    fn close(&self);

    fn is_open(&self) -> bool;

    fn schema_version(&self) -> Result<u32>;

    /// Replace every edit record and stamp a new schema version.
    /// Manifests are left as they are.
    fn rewrite(&self, records: Vec<EditRecord>, version: u32) -> Result<()>;

    fn get(&self, key: &EditKey) -> Result<Option<EditRecord>>;

    /// All edits of one (note, branch).
    fn range(&self, note_id: &NoteId, branch: &str) -> Result<Vec<EditRecord>>;

    /// All edits of one note across branches.
    fn scan_note(&self, note_id: &NoteId) -> Result<Vec<EditRecord>>;

    /// Edits created at or after `since`, oldest first.
    fn scan_created_since(&self, since: Timestamp) -> Result<Vec<EditRecord>>;

    fn scan_all(&self) -> Result<Vec<EditRecord>>;

    fn get_manifest(&self, note_id: &NoteId) -> Result<Option<Manifest>>;

    fn list_manifests(&self) -> Result<Vec<NoteId>>;

    fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Delete at most `limit` matching records in one atomic step.
    /// Returns how many were deleted.
    fn delete_matching(&self, predicate: &dyn Fn(&EditRecord) -> bool, limit: usize)
        -> Result<usize>;

    fn size_bytes(&self) -> Result<u64>;
}
