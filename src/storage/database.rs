//! Store handle with retry, reopen and quota enforcement.

use super::backend::{StorageBackend, WriteBatch};
use super::migrations::{self, CURRENT_SCHEMA_VERSION};
use crate::error::{ErrorKind, HistoryError, Result};
use crate::manifest::Manifest;
use crate::types::{EditKey, EditRecord, NoteId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Bounded exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), with equal jitter:
    /// half the capped exponential delay plus a random share of the rest.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_delay_ms);
        let half = exp / 2;
        Duration::from_millis(half + random_below(exp - half + 1))
    }
}

fn random_below(bound: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    if bound == 0 {
        return 0;
    }
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0),
    );
    hasher.finish() % bound
}

/// Shared handle to the persistent store.
///
/// Every call runs inside the retry loop. A closed connection is reopened
/// before the next attempt; fatal errors propagate on the first failure.
pub struct Database {
    backend: Arc<dyn StorageBackend>,
    retry: RetryConfig,
    max_store_bytes: Option<u64>,
    closed: AtomicBool,
}

impl Database {
    /// Open the backend and bring its schema up to date.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        retry: RetryConfig,
        max_store_bytes: Option<u64>,
    ) -> Result<Self> {
        let db = Self {
            backend,
            retry,
            max_store_bytes,
            closed: AtomicBool::new(false),
        };
        db.with_retry("open", |b| b.open())?;
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version = self.with_retry("read schema version", |b| b.schema_version())?;
        if version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }
        if version > CURRENT_SCHEMA_VERSION {
            return Err(HistoryError::SchemaMismatch {
                found: version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }

        info!(from = version, to = CURRENT_SCHEMA_VERSION, "migrating history store");
        let mut records = self.with_retry("load records for migration", |b| b.scan_all())?;
        migrations::migrate(&mut records, version)?;
        self.with_retry("rewrite migrated records", |b| {
            b.rewrite(records.clone(), CURRENT_SCHEMA_VERSION)
        })
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.backend.close();
        }
    }

    /// Run `f` against the backend, retrying recoverable failures.
    pub fn with_retry<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&dyn StorageBackend) -> Result<T>,
    {
        if self.is_closed() {
            return Err(HistoryError::ConnectionClosed.context(format!("store {operation}")));
        }

        let mut attempt = 0u32;
        loop {
            let result = if self.backend.is_open() {
                f(self.backend.as_ref())
            } else {
                debug!(operation, "reopening history store");
                self.backend
                    .open()
                    .and_then(|_| f(self.backend.as_ref()))
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    if e.kind() == ErrorKind::ConnectionClosed {
                        self.backend.close();
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying store operation"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e.context(format!("store {operation}"))),
            }
        }
    }

    pub fn get(&self, key: &EditKey) -> Result<Option<EditRecord>> {
        self.with_retry("get", |b| b.get(key))
    }

    pub fn range(&self, note_id: &NoteId, branch: &str) -> Result<Vec<EditRecord>> {
        self.with_retry("range", |b| b.range(note_id, branch))
    }

    pub fn scan_note(&self, note_id: &NoteId) -> Result<Vec<EditRecord>> {
        self.with_retry("scan note", |b| b.scan_note(note_id))
    }

    pub fn scan_created_since(&self, since: Timestamp) -> Result<Vec<EditRecord>> {
        self.with_retry("scan by creation time", |b| b.scan_created_since(since))
    }

    pub fn scan_all(&self) -> Result<Vec<EditRecord>> {
        self.with_retry("scan all", |b| b.scan_all())
    }

    pub fn get_manifest(&self, note_id: &NoteId) -> Result<Option<Manifest>> {
        self.with_retry("get manifest", |b| b.get_manifest(note_id))
    }

    pub fn list_manifests(&self) -> Result<Vec<NoteId>> {
        self.with_retry("list manifests", |b| b.list_manifests())
    }

    /// Commit a batch atomically, rejecting it if it would exceed the quota.
    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.with_retry("commit", |b| {
            if let Some(max) = self.max_store_bytes {
                let added = batch.added_bytes();
                if added > 0 {
                    let current = b.size_bytes()?;
                    if current.saturating_add(added) > max {
                        return Err(HistoryError::Capacity(format!(
                            "store holds {current} bytes, batch adds {added}, quota is {max}"
                        )));
                    }
                }
            }
            b.commit(batch.clone())
        })
    }

    /// Delete every matching record, at most `limit` per transaction.
    pub fn batch_delete<P>(&self, predicate: P, limit: usize) -> Result<usize>
    where
        P: Fn(&EditRecord) -> bool,
    {
        if limit == 0 {
            return Err(HistoryError::Validation("batch delete limit is zero".into()));
        }

        let mut total = 0;
        loop {
            let deleted = self.with_retry("batch delete", |b| b.delete_matching(&predicate, limit))?;
            total += deleted;
            if deleted < limit {
                break;
            }
        }
        debug!(total, limit, "batch delete finished");
        Ok(total)
    }

    pub fn size_bytes(&self) -> Result<u64> {
        self.with_retry("size", |b| b.size_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{Fault, MemoryBackend};
    use crate::types::{EditId, StorageType};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    fn record(id: &str) -> EditRecord {
        EditRecord {
            seq: 0,
            note_id: NoteId::from("n"),
            branch_name: "main".into(),
            edit_id: EditId::from(id),
            content: vec![0; 64],
            content_hash: String::new(),
            storage_type: Some(StorageType::Full),
            base_edit_id: Some(EditId::from(id)),
            previous_edit_id: None,
            chain_length: 0,
            created_at: Timestamp(1),
            size: 64,
            uncompressed_size: 64,
        }
    }

    #[test]
    fn test_delay_is_bounded() {
        let retry = RetryConfig::default();
        for attempt in 0..40 {
            let delay = retry.delay_for(attempt).as_millis() as u64;
            assert!(delay <= retry.max_delay_ms);
        }
        let first = retry.delay_for(0).as_millis() as u64;
        assert!((5..=10).contains(&first));
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let backend = Arc::new(MemoryBackend::new());
        let db = Database::open(backend.clone(), fast_retry(), None).unwrap();

        backend.inject_faults(2, Fault::TransactionAborted);
        assert!(db.scan_note(&NoteId::from("n")).unwrap().is_empty());
    }

    #[test]
    fn test_connection_closed_reopens() {
        let backend = Arc::new(MemoryBackend::new());
        let db = Database::open(backend.clone(), fast_retry(), None).unwrap();
        let opens = backend.open_count();

        backend.inject_faults(1, Fault::ConnectionClosed);
        assert!(db.list_manifests().unwrap().is_empty());
        assert_eq!(backend.open_count(), opens + 1);
    }

    #[test]
    fn test_fatal_failures_are_not_retried() {
        let backend = Arc::new(MemoryBackend::new());
        let db = Database::open(backend.clone(), fast_retry(), None).unwrap();
        let before = backend.operation_count();

        backend.inject_faults(1, Fault::QuotaExceeded);
        let err = db.scan_note(&NoteId::from("n")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert_eq!(backend.operation_count(), before + 1);
    }

    #[test]
    fn test_retries_are_bounded() {
        let backend = Arc::new(MemoryBackend::new());
        let db = Database::open(backend.clone(), fast_retry(), None).unwrap();
        let before = backend.operation_count();

        backend.inject_faults(10, Fault::Timeout);
        let err = db.scan_note(&NoteId::from("n")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationTimeout);
        assert_eq!(backend.operation_count(), before + 4);
    }

    #[test]
    fn test_quota() {
        let backend = Arc::new(MemoryBackend::new());
        let db = Database::open(backend, fast_retry(), Some(300)).unwrap();

        let mut batch = WriteBatch::new();
        batch.put_edit(record("a"));
        db.commit(batch).unwrap();

        let mut batch = WriteBatch::new();
        batch.put_edit(record("b"));
        batch.put_edit(record("c"));
        let err = db.commit(batch).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
    }

    #[test]
    fn test_batch_delete_loops() {
        let backend = Arc::new(MemoryBackend::new());
        let db = Database::open(backend, fast_retry(), None).unwrap();
        let mut batch = WriteBatch::new();
        for i in 0..10 {
            batch.put_edit(record(&format!("e{i:02}")));
        }
        db.commit(batch).unwrap();

        assert_eq!(db.batch_delete(|_| true, 3).unwrap(), 10);
        assert!(db.scan_note(&NoteId::from("n")).unwrap().is_empty());
        assert!(db.batch_delete(|_| true, 0).is_err());
    }

    #[test]
    fn test_open_migrates_old_schema() {
        let mut legacy = record("old");
        legacy.storage_type = None;
        legacy.base_edit_id = None;
        legacy.size = 0;
        let backend = Arc::new(MemoryBackend::seeded(vec![legacy], 1));
        let db = Database::open(backend.clone(), fast_retry(), None).unwrap();

        assert_eq!(backend.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
        let migrated = db
            .get(&EditKey::new(NoteId::from("n"), "main", EditId::from("old")))
            .unwrap()
            .unwrap();
        assert_eq!(migrated.base_edit_id, Some(EditId::from("old")));
        assert_eq!(migrated.size, 64);
        assert!(migrated.is_legacy());
    }

    #[test]
    fn test_newer_schema_fails() {
        let backend = Arc::new(MemoryBackend::with_schema_version(CURRENT_SCHEMA_VERSION + 1));
        let err = Database::open(backend, fast_retry(), None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn test_closed_handle_rejects_calls() {
        let backend = Arc::new(MemoryBackend::new());
        let db = Database::open(backend, fast_retry(), None).unwrap();
        db.close();
        assert!(db.list_manifests().is_err());
    }
}
