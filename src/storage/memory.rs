//! In-memory backend with fault injection.

use super::backend::{StorageBackend, WriteBatch};
use super::index::EditIndex;
use super::migrations::CURRENT_SCHEMA_VERSION;
use crate::error::{HistoryError, Result};
use crate::manifest::Manifest;
use crate::types::{EditKey, EditRecord, NoteId, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Failure injected into the next backend operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Drops the connection; the next call must reopen.
    ConnectionClosed,
    TransactionAborted,
    Timeout,
    /// Interrupted system call.
    InterruptedIo,
    QuotaExceeded,
}

impl Fault {
    fn into_error(self) -> HistoryError {
        match self {
            Fault::ConnectionClosed => HistoryError::ConnectionClosed,
            Fault::TransactionAborted => {
                HistoryError::TransactionAborted("injected abort".into())
            }
            Fault::Timeout => HistoryError::OperationTimeout {
                operation: "injected".into(),
                after: Duration::ZERO,
            },
            Fault::InterruptedIo => {
                HistoryError::Io(io::Error::new(io::ErrorKind::Interrupted, "injected"))
            }
            Fault::QuotaExceeded => HistoryError::Capacity("injected quota".into()),
        }
    }
}

/// Volatile backend. Useful for tests and short-lived sessions.
pub struct MemoryBackend {
    index: RwLock<EditIndex>,
    schema_version: AtomicU32,
    open: AtomicBool,
    faults: Mutex<VecDeque<Fault>>,
    operations: AtomicU64,
    opens: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_schema_version(CURRENT_SCHEMA_VERSION)
    }

    /// Empty backend reporting an older schema, for migration tests.
    pub fn with_schema_version(version: u32) -> Self {
        Self {
            index: RwLock::new(EditIndex::new()),
            schema_version: AtomicU32::new(version),
            open: AtomicBool::new(false),
            faults: Mutex::new(VecDeque::new()),
            operations: AtomicU64::new(0),
            opens: AtomicU64::new(0),
        }
    }

    /// Backend pre-populated with raw records, bypassing migrations.
    pub fn seeded(records: Vec<EditRecord>, version: u32) -> Self {
        let backend = Self::with_schema_version(version);
        {
            let mut index = backend.index.write();
            let mut batch = WriteBatch::new();
            for record in records {
                batch.put_edit(record);
            }
            index.assign_sequences(&mut batch);
            index.apply(&batch);
        }
        backend
    }

    /// Fail the next `count` operations with `fault`.
    pub fn inject_faults(&self, count: usize, fault: Fault) {
        let mut faults = self.faults.lock();
        for _ in 0..count {
            faults.push_back(fault);
        }
    }

    /// Operations attempted so far, including failed ones.
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Overwrite a record in place without touching anything else.
    pub fn tamper(&self, record: EditRecord) {
        self.index.write().insert(record);
    }

    fn begin(&self) -> Result<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if !self.is_open() {
            return Err(HistoryError::ConnectionClosed);
        }
        if let Some(fault) = self.faults.lock().pop_front() {
            if fault == Fault::ConnectionClosed {
                self.open.store(false, Ordering::SeqCst);
            }
            return Err(fault.into_error());
        }
        Ok(())
    }
}

impl StorageBackend for MemoryBackend {
    fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn schema_version(&self) -> Result<u32> {
        self.begin()?;
        Ok(self.schema_version.load(Ordering::SeqCst))
    }

    fn rewrite(&self, records: Vec<EditRecord>, version: u32) -> Result<()> {
        self.begin()?;
        let mut index = self.index.write();
        let mut rebuilt = EditIndex::new();
        let mut batch = WriteBatch::new();
        for manifest in index.manifests() {
            batch.put_manifest(manifest.clone());
        }
        for record in records {
            batch.put_edit(record);
        }
        rebuilt.apply(&batch);
        *index = rebuilt;
        self.schema_version.store(version, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, key: &EditKey) -> Result<Option<EditRecord>> {
        self.begin()?;
        Ok(self.index.read().get(key).cloned())
    }

    fn range(&self, note_id: &NoteId, branch: &str) -> Result<Vec<EditRecord>> {
        self.begin()?;
        Ok(self.index.read().range(note_id, branch))
    }

    fn scan_note(&self, note_id: &NoteId) -> Result<Vec<EditRecord>> {
        self.begin()?;
        Ok(self.index.read().scan_note(note_id))
    }

    fn scan_created_since(&self, since: Timestamp) -> Result<Vec<EditRecord>> {
        self.begin()?;
        Ok(self.index.read().scan_created_since(since))
    }

    fn scan_all(&self) -> Result<Vec<EditRecord>> {
        self.begin()?;
        Ok(self.index.read().records().cloned().collect())
    }

    fn get_manifest(&self, note_id: &NoteId) -> Result<Option<Manifest>> {
        self.begin()?;
        Ok(self.index.read().manifest(note_id).cloned())
    }

    fn list_manifests(&self) -> Result<Vec<NoteId>> {
        self.begin()?;
        Ok(self
            .index
            .read()
            .manifests()
            .map(|m| m.note_id.clone())
            .collect())
    }

    fn commit(&self, mut batch: WriteBatch) -> Result<()> {
        self.begin()?;
        let mut index = self.index.write();
        index.assign_sequences(&mut batch);
        index.apply(&batch);
        Ok(())
    }

    fn delete_matching(
        &self,
        predicate: &dyn Fn(&EditRecord) -> bool,
        limit: usize,
    ) -> Result<usize> {
        self.begin()?;
        let mut index = self.index.write();
        let keys = index.matching_keys(predicate, limit);
        let mut batch = WriteBatch::new();
        for key in &keys {
            batch.delete_edit(key.clone());
        }
        index.apply(&batch);
        Ok(keys.len())
    }

    fn size_bytes(&self) -> Result<u64> {
        self.begin()?;
        Ok(self.index.read().bytes())
    }
}
