//! The edit history engine.
//!
//! [`EditHistory`] ties the pieces together: mutating calls are serialized
//! per (note, branch) by the [`KeyedMutex`], the [`ChainPolicy`] picks the
//! storage shape of new edits, and reads load one branch into a [`ChainMap`]
//! and replay it with the [`Reconstructor`].

use crate::chain::{
    check_consistency, ChainMap, ChainPolicy, ChainReport, FullReason, Predecessor,
    Reconstructor, StorageDecision,
};
use crate::codec::compress;
use crate::config::HistoryConfig;
use crate::error::{HistoryError, Result, ResultExt};
use crate::hash::{compute_hash, verify_integrity};
use crate::keyed_mutex::{branch_key, KeyGuard, KeyedMutex, Priority};
use crate::manifest::{validate_branch_name, EditSummary, Manifest, ManifestRepair, KEY_SEPARATOR};
use crate::patch::{Patcher, UnifiedPatcher};
use crate::storage::{Database, LogBackend, MemoryBackend, StorageBackend, WriteBatch};
use crate::types::{
    EditId, EditKey, EditRecord, NoteId, PreviousContext, Reconstruction, StorageType,
    StoredEdit, Timestamp, MAIN_BRANCH,
};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Records deleted per transaction when clearing history.
pub const DELETE_BATCH_SIZE: usize = 500;

#[derive(Clone)]
struct CachedContent {
    content: String,
    content_hash: String,
    hops: usize,
}

/// Delta-chain edit history store.
pub struct EditHistory {
    db: Database,
    config: HistoryConfig,
    policy: ChainPolicy,
    patcher: Arc<dyn Patcher>,
    locks: KeyedMutex,
    cache: Option<Mutex<LruCache<EditKey, CachedContent>>>,
}

impl EditHistory {
    /// Open the on-disk store at `config.path`.
    pub fn open(config: HistoryConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(LogBackend::new(&config.path, config.create_if_missing));
        Self::with_backend(backend, config)
    }

    /// Volatile store with default settings.
    pub fn in_memory() -> Result<Self> {
        Self::with_backend(Arc::new(MemoryBackend::new()), HistoryConfig::default())
    }

    pub fn with_backend(backend: Arc<dyn StorageBackend>, config: HistoryConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::open(backend, config.retry.clone(), config.max_store_bytes)
            .context("opening edit history")?;
        let cache = NonZeroUsize::new(config.reconstruction_cache_size)
            .map(|size| Mutex::new(LruCache::new(size)));

        Ok(Self {
            db,
            policy: ChainPolicy::new(config.chain.clone()),
            patcher: Arc::new(UnifiedPatcher::default()),
            locks: KeyedMutex::new(config.lock_timeout()),
            cache,
            config,
        })
    }

    /// Replace the diff implementation.
    pub fn with_patcher(mut self, patcher: Arc<dyn Patcher>) -> Self {
        self.patcher = patcher;
        self
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn close(&self) {
        self.db.close();
        self.clear_cache();
    }

    // ---- reads ----

    /// Latest edit of a branch with its reconstructed content.
    pub fn get_previous_context(
        &self,
        note_id: &NoteId,
        branch: &str,
    ) -> Result<Option<PreviousContext>> {
        validate_target(note_id, branch)?;
        let map = self.snapshot(note_id, branch)?;
        let Some(tip) = map.tip() else {
            return Ok(None);
        };

        let rebuilt = self
            .reconstruct_cached(&map, &tip.edit_id)
            .with_context(|| format!("previous context of {note_id}/{branch}"))?;
        let base_edit_id = tip.base_edit_id.ok_or_else(|| {
            HistoryError::StateConsistency(format!(
                "no full ancestor reachable from {} in {note_id}/{branch}",
                tip.edit_id
            ))
        })?;

        let content_hash = if tip.content_hash.is_empty() {
            rebuilt.content_hash
        } else {
            tip.content_hash
        };
        Ok(Some(PreviousContext {
            edit_id: tip.edit_id,
            content: rebuilt.content,
            content_hash,
            base_edit_id,
            chain_length: tip.chain_length,
        }))
    }

    /// Rebuild the content of one edit.
    pub fn reconstruct(
        &self,
        note_id: &NoteId,
        branch: &str,
        edit_id: &EditId,
    ) -> Result<Reconstruction> {
        validate_target(note_id, branch)?;
        let map = self.snapshot(note_id, branch)?;
        self.reconstruct_cached(&map, edit_id)
    }

    /// Edits of a branch in storage order.
    pub fn list_edits(&self, note_id: &NoteId, branch: &str) -> Result<Vec<StoredEdit>> {
        validate_target(note_id, branch)?;
        let mut records = self.db.range(note_id, branch)?;
        records.sort_by_key(|r| r.seq);
        Ok(records.iter().map(EditRecord::summary).collect())
    }

    pub fn manifest(&self, note_id: &NoteId) -> Result<Option<Manifest>> {
        self.db.get_manifest(note_id)
    }

    /// Branch names known from the manifest or from stored records.
    pub fn branches(&self, note_id: &NoteId) -> Result<Vec<String>> {
        let mut names: BTreeSet<String> = self
            .db
            .get_manifest(note_id)?
            .map(|m| m.branches.into_keys().collect())
            .unwrap_or_default();
        names.extend(
            self.db
                .scan_note(note_id)?
                .into_iter()
                .map(|r| r.branch_name),
        );
        Ok(names.into_iter().collect())
    }

    /// Link-only validation of a branch.
    pub fn check_chain_consistency(&self, note_id: &NoteId, branch: &str) -> Result<ChainReport> {
        validate_target(note_id, branch)?;
        let map = self.snapshot(note_id, branch)?;
        let report = check_consistency(&map, self.max_chain_length());
        if !report.is_consistent() {
            warn!(
                note_id = %note_id,
                branch,
                issues = report.issues.len(),
                "chain consistency issues"
            );
        }
        Ok(report)
    }

    // ---- writes ----

    /// Store a new edit after `previous_edit_id`, or after the latest edit
    /// of the branch when none is given.
    pub fn store_edit(
        &self,
        note_id: &NoteId,
        branch: &str,
        content: String,
        previous_edit_id: Option<EditId>,
    ) -> Result<StoredEdit> {
        validate_target(note_id, branch)?;
        let _guard = self.lock_branch(note_id, branch, Priority::Normal)?;

        let map = self.load_chain(note_id, branch)?;
        let previous = match &previous_edit_id {
            Some(id) => Some(map.get(id).ok_or_else(|| {
                HistoryError::Validation(format!(
                    "previous edit {id} does not exist in {note_id}/{branch}"
                ))
            })?),
            None => map.latest(),
        };

        let predecessor_content = match previous {
            Some(record) => match self.reconstruct_cached(&map, &record.edit_id) {
                Ok(rebuilt) => {
                    if !rebuilt.verified {
                        warn!(
                            note_id = %note_id,
                            branch,
                            edit_id = %record.edit_id,
                            "predecessor hash mismatch, chaining anyway"
                        );
                    }
                    Some(rebuilt.content)
                }
                Err(e) => {
                    warn!(
                        note_id = %note_id,
                        branch,
                        edit_id = %record.edit_id,
                        error = %e,
                        "predecessor cannot be reconstructed, storing full edit"
                    );
                    None
                }
            },
            None => None,
        };

        let mut edit_id = EditId::generate();
        while map.contains(&edit_id) {
            edit_id = EditId::generate();
        }

        let decision = match (previous, predecessor_content.as_deref()) {
            (Some(record), Some(prev_content)) => self.policy.decide(
                Some(Predecessor {
                    record,
                    content: prev_content,
                }),
                &content,
                edit_id.as_str(),
                self.patcher.as_ref(),
            ),
            (Some(_), None) => StorageDecision::Full {
                reason: FullReason::PredecessorUnavailable,
            },
            (None, _) => self.policy.decide(None, &content, edit_id.as_str(), self.patcher.as_ref()),
        };

        let diff_base = previous.and_then(|p| map.effective_base(p));
        let (storage_type, payload, base_edit_id, chain_length) = match decision {
            StorageDecision::Diff {
                patch,
                chain_length,
            } if diff_base.is_some() => (StorageType::Diff, patch, diff_base, chain_length),
            StorageDecision::Diff { .. } => {
                debug!(note_id = %note_id, branch, "no full ancestor for diff, storing full edit");
                (StorageType::Full, content.clone(), Some(edit_id.clone()), 0)
            }
            StorageDecision::Full { reason } => {
                debug!(note_id = %note_id, branch, ?reason, "storing full edit");
                (StorageType::Full, content.clone(), Some(edit_id.clone()), 0)
            }
        };

        let created_at = match map.latest() {
            Some(latest) => Timestamp::now().max(Timestamp(latest.created_at.0 + 1)),
            None => Timestamp::now(),
        };
        let compressed = compress(&payload);
        let record = EditRecord {
            seq: 0,
            note_id: note_id.clone(),
            branch_name: branch.to_string(),
            edit_id: edit_id.clone(),
            size: compressed.len() as u64,
            content: compressed,
            content_hash: compute_hash(&content),
            storage_type: Some(storage_type),
            base_edit_id,
            previous_edit_id: previous.map(|p| p.edit_id.clone()),
            chain_length,
            created_at,
            uncompressed_size: content.len() as u64,
        };

        let manifest = self
            .db
            .get_manifest(note_id)?
            .unwrap_or_else(|| Manifest::new(note_id.clone()))
            .with_edit(branch, EditSummary::from_record(&record));

        let mut batch = WriteBatch::new();
        batch.put_edit(record.clone()).put_manifest(manifest);
        self.db
            .commit(batch)
            .with_context(|| format!("storing edit {edit_id} in {note_id}/{branch}"))?;

        debug!(
            note_id = %note_id,
            branch,
            edit_id = %edit_id,
            storage_type = %storage_type,
            chain_length,
            size = record.size,
            "stored edit"
        );

        let hops = chain_length as usize;
        let content_hash = record.content_hash.clone();
        self.cache_put(
            record.key(),
            CachedContent {
                content,
                content_hash,
                hops,
            },
        );
        Ok(record.summary())
    }

    /// Delete all history of one note.
    pub fn clear_for_note(&self, note_id: &NoteId) -> Result<usize> {
        validate_note_id(note_id)?;
        let _guard = self.lock_note(note_id)?;

        let deleted = self
            .db
            .batch_delete(|r| &r.note_id == note_id, DELETE_BATCH_SIZE)?;
        let mut batch = WriteBatch::new();
        batch.delete_manifest(note_id.clone());
        self.db.commit(batch)?;
        self.purge_cache(|key| &key.note_id == note_id);

        info!(note_id = %note_id, deleted, "cleared note history");
        Ok(deleted)
    }

    /// Delete all history.
    ///
    /// Only records whose branch key is held are deleted. The key set is
    /// re-read under the lock until it stops growing, so a note created
    /// between listing and locking is either covered or left untouched.
    pub fn clear_all(&self) -> Result<usize> {
        let mut keys = self.all_keys()?;
        let _guard = loop {
            let guard = if keys.is_empty() {
                None
            } else {
                Some(self.locks.lock(keys.iter(), None, Priority::Normal)?)
            };
            let current = self.all_keys()?;
            if current.is_subset(&keys) {
                break guard;
            }
            drop(guard);
            keys.extend(current);
        };

        let deleted = self.db.batch_delete(
            |r| keys.contains(&branch_key(r.note_id.as_str(), &r.branch_name)),
            DELETE_BATCH_SIZE,
        )?;
        let notes: BTreeSet<NoteId> = self
            .db
            .list_manifests()?
            .into_iter()
            .filter(|n| keys.contains(&branch_key(n.as_str(), MAIN_BRANCH)))
            .collect();
        let mut batch = WriteBatch::new();
        for note_id in &notes {
            batch.delete_manifest(note_id.clone());
        }
        self.db.commit(batch)?;
        self.clear_cache();

        info!(deleted, notes = notes.len(), "cleared all history");
        Ok(deleted)
    }

    /// Branch keys of every note with a manifest or stored records.
    fn all_keys(&self) -> Result<BTreeSet<String>> {
        let mut notes: BTreeSet<NoteId> = self.db.list_manifests()?.into_iter().collect();
        notes.extend(self.db.scan_all()?.into_iter().map(|r| r.note_id));
        let mut keys = BTreeSet::new();
        for note_id in &notes {
            keys.extend(self.note_keys(note_id)?);
        }
        Ok(keys)
    }

    // ---- branches ----

    /// Create a branch. With `from`, the source branch's edits are copied so
    /// the new branch starts with a complete chain.
    pub fn create_branch(
        &self,
        note_id: &NoteId,
        name: &str,
        from: Option<&str>,
    ) -> Result<Manifest> {
        validate_note_id(note_id)?;
        validate_branch_name(name)?;
        let mut keys = vec![branch_key(note_id.as_str(), name)];
        if let Some(source) = from {
            keys.push(branch_key(note_id.as_str(), source));
        }
        let _guard = self.locks.lock(keys, None, Priority::Normal)?;

        if !self.db.range(note_id, name)?.is_empty() {
            return Err(HistoryError::Validation(format!(
                "branch {name} already has edits on {note_id}"
            )));
        }

        let manifest = self
            .db
            .get_manifest(note_id)?
            .unwrap_or_else(|| Manifest::new(note_id.clone()))
            .with_branch(name, from)?;

        let mut batch = WriteBatch::new();
        if let Some(source) = from {
            for record in self.db.range(note_id, source)? {
                batch.put_edit(retarget(record, name));
            }
        }
        batch.put_manifest(manifest.clone());
        self.db.commit(batch)?;

        info!(note_id = %note_id, branch = name, from, "created branch");
        Ok(manifest)
    }

    pub fn rename_branch(&self, note_id: &NoteId, old: &str, new: &str) -> Result<Manifest> {
        validate_note_id(note_id)?;
        validate_branch_name(old)?;
        validate_branch_name(new)?;
        let keys = [
            branch_key(note_id.as_str(), old),
            branch_key(note_id.as_str(), new),
        ];
        let _guard = self.locks.lock(keys, None, Priority::Normal)?;

        if old != new && !self.db.range(note_id, new)?.is_empty() {
            return Err(HistoryError::Validation(format!(
                "branch {new} already has edits on {note_id}"
            )));
        }

        let manifest = self
            .db
            .get_manifest(note_id)?
            .ok_or_else(|| HistoryError::NotFound(format!("manifest of {note_id}")))?
            .with_branch_renamed(old, new)?;
        if old == new {
            return Ok(manifest);
        }

        let mut batch = WriteBatch::new();
        for record in self.db.range(note_id, old)? {
            batch.delete_edit(record.key());
            batch.put_edit(retarget(record, new));
        }
        batch.put_manifest(manifest.clone());
        self.db.commit(batch)?;
        self.purge_cache(|key| &key.note_id == note_id && key.branch_name == old);

        info!(note_id = %note_id, from = old, to = new, "renamed branch");
        Ok(manifest)
    }

    pub fn switch_branch(&self, note_id: &NoteId, name: &str) -> Result<Manifest> {
        validate_target(note_id, name)?;
        let _guard = self.lock_branch(note_id, name, Priority::High)?;

        let manifest = self
            .db
            .get_manifest(note_id)?
            .ok_or_else(|| HistoryError::NotFound(format!("manifest of {note_id}")))?
            .with_active_branch(name)?;
        let mut batch = WriteBatch::new();
        batch.put_manifest(manifest.clone());
        self.db.commit(batch)?;

        debug!(note_id = %note_id, branch = name, "switched branch");
        Ok(manifest)
    }

    /// Delete a branch and its edits. Returns how many edits were removed.
    pub fn delete_branch(&self, note_id: &NoteId, name: &str) -> Result<usize> {
        validate_target(note_id, name)?;
        let _guard = self.lock_branch(note_id, name, Priority::Normal)?;

        let deleted = self.db.batch_delete(
            |r| &r.note_id == note_id && r.branch_name == name,
            DELETE_BATCH_SIZE,
        )?;
        if let Some(manifest) = self.db.get_manifest(note_id)? {
            if manifest.has_branch(name) {
                let mut batch = WriteBatch::new();
                batch.put_manifest(manifest.without_branch(name)?);
                self.db.commit(batch)?;
            }
        }
        self.purge_cache(|key| &key.note_id == note_id && key.branch_name == name);

        info!(note_id = %note_id, branch = name, deleted, "deleted branch");
        Ok(deleted)
    }

    /// Run the manifest sanity pass and persist any fixes.
    pub fn repair_manifest(&self, note_id: &NoteId) -> Result<Vec<ManifestRepair>> {
        validate_note_id(note_id)?;
        let _guard = self.lock_note(note_id)?;

        let manifest = self
            .db
            .get_manifest(note_id)?
            .ok_or_else(|| HistoryError::NotFound(format!("manifest of {note_id}")))?;
        let (mut repaired, mut repairs) = manifest.repaired();
        let branches: Vec<(String, Vec<EditId>)> = repaired
            .branches
            .iter()
            .map(|(name, entry)| (name.clone(), entry.edits.keys().cloned().collect()))
            .collect();
        for (branch, listed) in branches {
            let stored: BTreeSet<EditId> = self
                .db
                .range(note_id, &branch)?
                .into_iter()
                .map(|r| r.edit_id)
                .collect();
            for edit_id in listed.into_iter().filter(|id| !stored.contains(id)) {
                repaired = repaired.without_edit(&branch, &edit_id);
                repairs.push(ManifestRepair::DroppedMissingEdit {
                    branch: branch.clone(),
                    edit_id,
                });
            }
        }
        if !repairs.is_empty() {
            let mut batch = WriteBatch::new();
            batch.put_manifest(repaired);
            self.db.commit(batch)?;
            info!(note_id = %note_id, repairs = repairs.len(), "repaired manifest");
        }
        Ok(repairs)
    }

    // ---- crate internals ----

    pub(crate) fn max_chain_length(&self) -> usize {
        self.policy.config().max_chain_length()
    }

    pub(crate) fn reconstructor(&self) -> Reconstructor<'_> {
        Reconstructor::new(self.patcher.as_ref(), self.max_chain_length())
    }

    pub(crate) fn load_chain(&self, note_id: &NoteId, branch: &str) -> Result<ChainMap> {
        let records = self
            .db
            .range(note_id, branch)
            .with_context(|| format!("loading chain {note_id}/{branch}"))?;
        Ok(ChainMap::from_records(note_id.clone(), branch, records))
    }

    /// Load a branch without racing a writer on the same key.
    pub(crate) fn snapshot(&self, note_id: &NoteId, branch: &str) -> Result<ChainMap> {
        let _guard = self.lock_branch(note_id, branch, Priority::Normal)?;
        self.load_chain(note_id, branch)
    }

    pub(crate) fn lock_branch(
        &self,
        note_id: &NoteId,
        branch: &str,
        priority: Priority,
    ) -> Result<KeyGuard<'_>> {
        self.locks
            .lock([branch_key(note_id.as_str(), branch)], None, priority)
    }

    fn lock_note(&self, note_id: &NoteId) -> Result<KeyGuard<'_>> {
        let keys = self.note_keys(note_id)?;
        self.locks.lock(keys, None, Priority::Normal)
    }

    fn note_keys(&self, note_id: &NoteId) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .branches(note_id)?
            .iter()
            .map(|b| branch_key(note_id.as_str(), b))
            .collect();
        keys.push(branch_key(note_id.as_str(), MAIN_BRANCH));
        Ok(keys)
    }

    pub(crate) fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.db.commit(batch)
    }

    /// Reconstruct through the content cache. Only verified content is cached.
    pub(crate) fn reconstruct_cached(
        &self,
        map: &ChainMap,
        edit_id: &EditId,
    ) -> Result<Reconstruction> {
        let record = map.get(edit_id).ok_or_else(|| {
            HistoryError::NotFound(format!(
                "edit {edit_id} in {}/{}",
                map.note_id(),
                map.branch()
            ))
        })?;
        let key = record.key();

        if let Some(cached) = self.cache_get(&key) {
            return Ok(Reconstruction {
                verified: verify_integrity(&cached.content, &record.content_hash),
                content: cached.content,
                content_hash: cached.content_hash,
                hops: cached.hops,
            });
        }

        let rebuilt = match self.reconstructor().reconstruct(map, edit_id) {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                let e = HistoryError::from(e);
                self.cleanup_after(map, &e);
                return Err(e);
            }
        };
        if rebuilt.verified {
            self.cache_put(
                key,
                CachedContent {
                    content: rebuilt.content.clone(),
                    content_hash: rebuilt.content_hash.clone(),
                    hops: rebuilt.hops,
                },
            );
        }
        Ok(rebuilt)
    }

    /// Discard cached content of the map's branch when the error's policy
    /// says derived state can no longer be trusted.
    pub(crate) fn cleanup_after(&self, map: &ChainMap, error: &HistoryError) {
        if !error.policy().requires_cleanup {
            return;
        }
        let (note_id, branch) = (map.note_id(), map.branch());
        self.purge_cache(|key| &key.note_id == note_id && key.branch_name == branch);
        debug!(
            note_id = %note_id,
            branch,
            kind = ?error.kind(),
            "discarded cached content after error"
        );
    }

    fn cache_get(&self, key: &EditKey) -> Option<CachedContent> {
        self.cache.as_ref()?.lock().get(key).cloned()
    }

    fn cache_put(&self, key: EditKey, value: CachedContent) {
        if let Some(cache) = &self.cache {
            cache.lock().put(key, value);
        }
    }

    pub(crate) fn invalidate(&self, key: &EditKey) {
        if let Some(cache) = &self.cache {
            cache.lock().pop(key);
        }
    }

    fn purge_cache(&self, matches: impl Fn(&EditKey) -> bool) {
        if let Some(cache) = &self.cache {
            let mut cache = cache.lock();
            let stale: Vec<EditKey> = cache
                .iter()
                .filter(|(k, _)| matches(k))
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                cache.pop(&key);
            }
        }
    }

    fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }
}

/// Copy of a record moved onto another branch. The store assigns a new
/// sequence id.
fn retarget(mut record: EditRecord, branch: &str) -> EditRecord {
    record.branch_name = branch.to_string();
    record.seq = 0;
    record
}

pub(crate) fn validate_note_id(note_id: &NoteId) -> Result<()> {
    if note_id.as_str().trim().is_empty() {
        return Err(HistoryError::Validation("note id is empty".into()));
    }
    if note_id.as_str().contains(KEY_SEPARATOR) {
        return Err(HistoryError::Validation(format!(
            "note id {note_id} contains {KEY_SEPARATOR:?}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_target(note_id: &NoteId, branch: &str) -> Result<()> {
    validate_note_id(note_id)?;
    validate_branch_name(branch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Fault;

    fn history() -> EditHistory {
        EditHistory::in_memory().unwrap()
    }

    fn note() -> NoteId {
        NoteId::from("note-1")
    }

    #[test]
    fn test_first_edit_is_full() {
        let h = history();
        let stored = h
            .store_edit(&note(), MAIN_BRANCH, "A\nB\nC".into(), None)
            .unwrap();
        assert_eq!(stored.storage_type, StorageType::Full);
        assert_eq!(stored.chain_length, 0);
        assert_eq!(stored.base_edit_id, Some(stored.edit_id.clone()));
        assert_eq!(stored.previous_edit_id, None);

        let rebuilt = h.reconstruct(&note(), MAIN_BRANCH, &stored.edit_id).unwrap();
        assert_eq!(rebuilt.content, "A\nB\nC");
        assert!(rebuilt.verified);
    }

    #[test]
    fn test_append_is_diff() {
        let h = history();
        let a = h
            .store_edit(&note(), MAIN_BRANCH, "A\nB\nC".into(), None)
            .unwrap();
        let b = h
            .store_edit(&note(), MAIN_BRANCH, "A\nB\nC\nD".into(), Some(a.edit_id.clone()))
            .unwrap();
        assert_eq!(b.storage_type, StorageType::Diff);
        assert_eq!(b.chain_length, 1);
        assert_eq!(b.base_edit_id, Some(a.edit_id.clone()));
        assert_eq!(b.previous_edit_id, Some(a.edit_id));

        let rebuilt = h.reconstruct(&note(), MAIN_BRANCH, &b.edit_id).unwrap();
        assert_eq!(rebuilt.content, "A\nB\nC\nD");
    }

    #[test]
    fn test_previous_context() {
        let h = history();
        assert!(h.get_previous_context(&note(), MAIN_BRANCH).unwrap().is_none());

        let a = h.store_edit(&note(), MAIN_BRANCH, "one\n".into(), None).unwrap();
        let b = h.store_edit(&note(), MAIN_BRANCH, "one\ntwo\n".into(), None).unwrap();

        let ctx = h.get_previous_context(&note(), MAIN_BRANCH).unwrap().unwrap();
        assert_eq!(ctx.edit_id, b.edit_id);
        assert_eq!(ctx.content, "one\ntwo\n");
        assert_eq!(ctx.base_edit_id, a.edit_id);
        assert_eq!(ctx.chain_length, 1);
        assert_eq!(ctx.content_hash, compute_hash("one\ntwo\n"));
    }

    #[test]
    fn test_unknown_previous_is_rejected() {
        let h = history();
        let err = h
            .store_edit(&note(), MAIN_BRANCH, "x".into(), Some(EditId::from("nope")))
            .unwrap_err();
        assert!(matches!(err, HistoryError::Validation(_)));
    }

    #[test]
    fn test_invalid_targets() {
        let h = history();
        assert!(h.store_edit(&NoteId::from(""), MAIN_BRANCH, "x".into(), None).is_err());
        assert!(h.store_edit(&note(), "", "x".into(), None).is_err());
        assert!(h.store_edit(&NoteId::from("a::b"), MAIN_BRANCH, "x".into(), None).is_err());
    }

    #[test]
    fn test_manifest_tracks_edits() {
        let h = history();
        let a = h.store_edit(&note(), MAIN_BRANCH, "x".into(), None).unwrap();
        let manifest = h.manifest(&note()).unwrap().unwrap();
        let summary = manifest.edit(MAIN_BRANCH, &a.edit_id).unwrap();
        assert_eq!(summary.content_hash, a.content_hash);
        assert_eq!(manifest.branch(MAIN_BRANCH).unwrap().edit_count, 1);
    }

    #[test]
    fn test_branch_lifecycle() {
        let h = history();
        let a = h.store_edit(&note(), MAIN_BRANCH, "base\n".into(), None).unwrap();
        h.store_edit(&note(), MAIN_BRANCH, "base\nmore\n".into(), None)
            .unwrap();

        h.create_branch(&note(), "draft", Some(MAIN_BRANCH)).unwrap();
        let ctx = h.get_previous_context(&note(), "draft").unwrap().unwrap();
        assert_eq!(ctx.content, "base\nmore\n");
        assert_eq!(ctx.base_edit_id, a.edit_id);

        let d = h
            .store_edit(&note(), "draft", "base\nmore\ndraft\n".into(), None)
            .unwrap();
        assert_eq!(d.storage_type, StorageType::Diff);
        assert_eq!(h.list_edits(&note(), MAIN_BRANCH).unwrap().len(), 2);
        assert_eq!(h.list_edits(&note(), "draft").unwrap().len(), 3);

        let manifest = h.rename_branch(&note(), "draft", "final").unwrap();
        assert!(manifest.has_branch("final"));
        assert!(h.list_edits(&note(), "draft").unwrap().is_empty());
        assert_eq!(
            h.reconstruct(&note(), "final", &d.edit_id).unwrap().content,
            "base\nmore\ndraft\n"
        );

        let manifest = h.switch_branch(&note(), "final").unwrap();
        assert_eq!(manifest.active_branch, "final");

        assert_eq!(h.delete_branch(&note(), "final").unwrap(), 3);
        let manifest = h.manifest(&note()).unwrap().unwrap();
        assert!(!manifest.has_branch("final"));
        assert_eq!(manifest.active_branch, MAIN_BRANCH);
        assert_eq!(h.branches(&note()).unwrap(), vec![MAIN_BRANCH.to_string()]);
    }

    #[test]
    fn test_create_existing_branch_fails() {
        let h = history();
        h.store_edit(&note(), MAIN_BRANCH, "x".into(), None).unwrap();
        assert!(h.create_branch(&note(), MAIN_BRANCH, None).is_err());
        assert!(h.create_branch(&note(), "b", Some("missing")).is_err());
    }

    #[test]
    fn test_clear_for_note_and_all() {
        let h = history();
        let other = NoteId::from("note-2");
        for i in 0..3 {
            h.store_edit(&note(), MAIN_BRANCH, format!("v{i}"), None).unwrap();
            h.store_edit(&other, MAIN_BRANCH, format!("w{i}"), None).unwrap();
        }

        assert_eq!(h.clear_for_note(&note()).unwrap(), 3);
        assert!(h.manifest(&note()).unwrap().is_none());
        assert!(h.get_previous_context(&note(), MAIN_BRANCH).unwrap().is_none());
        assert_eq!(h.list_edits(&other, MAIN_BRANCH).unwrap().len(), 3);

        assert_eq!(h.clear_all().unwrap(), 3);
        assert!(h.manifest(&other).unwrap().is_none());
    }

    #[test]
    fn test_unreconstructable_predecessor_gives_full_edit() {
        let backend = Arc::new(MemoryBackend::new());
        let h = EditHistory::with_backend(backend.clone(), HistoryConfig::default()).unwrap();
        let a = h.store_edit(&note(), MAIN_BRANCH, "A\nB\n".into(), None).unwrap();
        let b = h.store_edit(&note(), MAIN_BRANCH, "A\nB\nC\n".into(), None).unwrap();
        assert_eq!(b.storage_type, StorageType::Diff);

        // Drop the root so `b` can no longer be rebuilt.
        let key = EditKey::new(note(), MAIN_BRANCH, a.edit_id.clone());
        let mut batch = WriteBatch::new();
        batch.delete_edit(key);
        backend.commit(batch).unwrap();
        h.clear_cache();

        let c = h.store_edit(&note(), MAIN_BRANCH, "fresh\n".into(), None).unwrap();
        assert_eq!(c.storage_type, StorageType::Full);
        assert_eq!(c.previous_edit_id, Some(b.edit_id));
        assert_eq!(
            h.reconstruct(&note(), MAIN_BRANCH, &c.edit_id).unwrap().content,
            "fresh\n"
        );
    }

    #[test]
    fn test_store_survives_transient_faults() {
        let backend = Arc::new(MemoryBackend::new());
        let mut config = HistoryConfig::default();
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        let h = EditHistory::with_backend(backend.clone(), config).unwrap();

        backend.inject_faults(1, Fault::ConnectionClosed);
        backend.inject_faults(1, Fault::TransactionAborted);
        let a = h.store_edit(&note(), MAIN_BRANCH, "x\n".into(), None).unwrap();
        assert_eq!(
            h.reconstruct(&note(), MAIN_BRANCH, &a.edit_id).unwrap().content,
            "x\n"
        );
    }

    #[test]
    fn test_quota_is_fatal() {
        let backend = Arc::new(MemoryBackend::new());
        let config = HistoryConfig {
            max_store_bytes: Some(64),
            ..Default::default()
        };
        let h = EditHistory::with_backend(backend, config).unwrap();
        let err = h
            .store_edit(&note(), MAIN_BRANCH, "y".repeat(10_000), None)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Capacity);
    }

    #[test]
    fn test_chain_consistency_report() {
        let h = history();
        for i in 0..5 {
            h.store_edit(&note(), MAIN_BRANCH, format!("line\n{i}\n"), None)
                .unwrap();
        }
        let report = h.check_chain_consistency(&note(), MAIN_BRANCH).unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.checked, 5);
    }

    #[test]
    fn test_repair_manifest() {
        let backend = Arc::new(MemoryBackend::new());
        let h = EditHistory::with_backend(backend.clone(), HistoryConfig::default()).unwrap();
        h.store_edit(&note(), MAIN_BRANCH, "x".into(), None).unwrap();

        let mut manifest = h.manifest(&note()).unwrap().unwrap();
        manifest.active_branch = "ghost".into();
        let mut batch = WriteBatch::new();
        batch.put_manifest(manifest);
        backend.commit(batch).unwrap();

        let repairs = h.repair_manifest(&note()).unwrap();
        assert_eq!(repairs.len(), 1);
        assert_eq!(h.manifest(&note()).unwrap().unwrap().active_branch, MAIN_BRANCH);
        assert!(h.repair_manifest(&note()).unwrap().is_empty());
    }

    #[test]
    fn test_repair_drops_entries_for_missing_edits() {
        let backend = Arc::new(MemoryBackend::new());
        let h = EditHistory::with_backend(backend.clone(), HistoryConfig::default()).unwrap();
        let a = h.store_edit(&note(), MAIN_BRANCH, "x\n".into(), None).unwrap();
        let b = h.store_edit(&note(), MAIN_BRANCH, "x\ny\n".into(), None).unwrap();

        let mut batch = WriteBatch::new();
        batch.delete_edit(EditKey::new(note(), MAIN_BRANCH, b.edit_id.clone()));
        backend.commit(batch).unwrap();

        let repairs = h.repair_manifest(&note()).unwrap();
        assert_eq!(
            repairs,
            vec![ManifestRepair::DroppedMissingEdit {
                branch: MAIN_BRANCH.to_string(),
                edit_id: b.edit_id.clone(),
            }]
        );
        let manifest = h.manifest(&note()).unwrap().unwrap();
        assert!(manifest.edit(MAIN_BRANCH, &b.edit_id).is_none());
        assert!(manifest.edit(MAIN_BRANCH, &a.edit_id).is_some());
        assert_eq!(manifest.branch(MAIN_BRANCH).unwrap().edit_count, 1);
    }

    /// Patcher whose patches silently drop the last line when applied.
    struct LossyPatcher;

    impl Patcher for LossyPatcher {
        fn create_patch(&self, old: &str, new: &str, id: &str) -> String {
            UnifiedPatcher::default().create_patch(old, new, id)
        }

        fn apply_patch(&self, base: &str, patch: &str) -> Result<String> {
            let mut out = UnifiedPatcher::default().apply_patch(base, patch)?;
            out.truncate(out.trim_end_matches('\n').rfind('\n').map_or(0, |i| i + 1));
            Ok(out)
        }
    }

    #[test]
    fn test_unreplayable_patch_is_stored_full() {
        let config = HistoryConfig {
            reconstruction_cache_size: 0,
            ..Default::default()
        };
        let h = EditHistory::with_backend(Arc::new(MemoryBackend::new()), config)
            .unwrap()
            .with_patcher(Arc::new(LossyPatcher));

        h.store_edit(&note(), MAIN_BRANCH, "A\nB\n".into(), None).unwrap();
        let b = h
            .store_edit(&note(), MAIN_BRANCH, "A\nB\nC\n".into(), None)
            .unwrap();
        assert_eq!(b.storage_type, StorageType::Full);

        let rebuilt = h.reconstruct(&note(), MAIN_BRANCH, &b.edit_id).unwrap();
        assert_eq!(rebuilt.content, "A\nB\nC\n");
        assert!(rebuilt.verified);
    }

    #[test]
    fn test_reconstruction_failure_discards_branch_cache() {
        let backend = Arc::new(MemoryBackend::new());
        let h = EditHistory::with_backend(backend.clone(), HistoryConfig::default()).unwrap();
        let other = NoteId::from("note-2");
        let a = h.store_edit(&note(), MAIN_BRANCH, "A\n".into(), None).unwrap();
        let o = h.store_edit(&other, MAIN_BRANCH, "O\n".into(), None).unwrap();
        let a_key = EditKey::new(note(), MAIN_BRANCH, a.edit_id.clone());
        let o_key = EditKey::new(other.clone(), MAIN_BRANCH, o.edit_id.clone());
        assert!(h.cache_get(&a_key).is_some());

        // A diff whose predecessor was never stored.
        backend.tamper(EditRecord {
            seq: 99,
            note_id: note(),
            branch_name: MAIN_BRANCH.to_string(),
            edit_id: EditId::from("orphan"),
            content: compress("@@ -1,1 +1,1 @@\n-A\n+B\n"),
            content_hash: compute_hash("B\n"),
            storage_type: Some(StorageType::Diff),
            base_edit_id: None,
            previous_edit_id: Some(EditId::from("ghost")),
            chain_length: 1,
            created_at: Timestamp(i64::MAX),
            size: 0,
            uncompressed_size: 0,
        });

        let err = h
            .reconstruct(&note(), MAIN_BRANCH, &EditId::from("orphan"))
            .unwrap_err();
        assert!(err.policy().requires_cleanup);
        assert!(h.cache_get(&a_key).is_none());
        assert!(h.cache_get(&o_key).is_some());

        // Errors that leave derived state intact keep the cache.
        h.reconstruct(&note(), MAIN_BRANCH, &a.edit_id).unwrap();
        let err = h
            .reconstruct(&note(), MAIN_BRANCH, &EditId::from("absent"))
            .unwrap_err();
        assert!(!err.policy().requires_cleanup);
        assert!(h.cache_get(&a_key).is_some());
    }

    #[test]
    fn test_clear_all_covers_notes_without_manifest() {
        let backend = Arc::new(MemoryBackend::new());
        let h = EditHistory::with_backend(backend.clone(), HistoryConfig::default()).unwrap();
        h.store_edit(&note(), MAIN_BRANCH, "x\n".into(), None).unwrap();
        let stray = h.store_edit(&NoteId::from("stray"), MAIN_BRANCH, "y\n".into(), None).unwrap();
        let mut batch = WriteBatch::new();
        batch.delete_manifest(NoteId::from("stray"));
        backend.commit(batch).unwrap();

        assert_eq!(h.clear_all().unwrap(), 2);
        let key = EditKey::new(NoteId::from("stray"), MAIN_BRANCH, stray.edit_id);
        assert!(backend.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_clear_all_racing_new_notes_keeps_manifests_consistent() {
        let h = Arc::new(history());
        let writer = {
            let h = h.clone();
            std::thread::spawn(move || {
                for n in 0..40 {
                    let note = NoteId::from(format!("fresh-{n}"));
                    h.store_edit(&note, MAIN_BRANCH, format!("{n}\n"), None).unwrap();
                    h.store_edit(&note, MAIN_BRANCH, format!("{n}\n{n}\n"), None)
                        .unwrap();
                }
            })
        };
        for _ in 0..20 {
            h.clear_all().unwrap();
        }
        writer.join().unwrap();

        let notes: BTreeSet<NoteId> = h.db.scan_all().unwrap().into_iter().map(|r| r.note_id).collect();
        for note_id in notes {
            let manifest = h.manifest(&note_id).unwrap().unwrap();
            let stored = h.list_edits(&note_id, MAIN_BRANCH).unwrap().len();
            assert_eq!(manifest.branch(MAIN_BRANCH).unwrap().edit_count, stored);
        }
    }
}
