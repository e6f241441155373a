//! Integrity verification and healing.
//!
//! Verification reconstructs each edit from its chain and compares the
//! result against the stored hash. It always rebuilds from storage and never
//! consults the content cache. With [`VerifyOptions::fix`], an edit whose
//! content reconstructs but whose stored hash disagrees is healed: its hash and
//! size fields are rewritten, together with the manifest entry, in one batch.

use crate::chain::ChainMap;
use crate::error::{HistoryError, Result, Severity};
use crate::hash::is_valid_hash;
use crate::history::{validate_note_id, validate_target, EditHistory};
use crate::keyed_mutex::Priority;
use crate::manifest::{EditSummary, Manifest, MetadataUpdate};
use crate::storage::WriteBatch;
use crate::types::{
    EditId, EditRecord, IntegrityCheckResult, NoteId, Reconstruction, VerifyOptions,
};
use rayon::prelude::*;
use tracing::{debug, info, warn};

impl EditHistory {
    /// Verify one edit.
    pub fn verify_edit(
        &self,
        note_id: &NoteId,
        branch: &str,
        edit_id: &EditId,
        options: VerifyOptions,
    ) -> Result<IntegrityCheckResult> {
        validate_target(note_id, branch)?;
        if options.fix {
            let _guard = self.lock_branch(note_id, branch, Priority::Normal)?;
            let map = self.load_chain(note_id, branch)?;
            self.verify_in(&map, edit_id, true)
        } else {
            let map = self.snapshot(note_id, branch)?;
            self.verify_in(&map, edit_id, false)
        }
    }

    /// Verify every edit of a branch in batches of `verify_batch_size`.
    ///
    /// Read-only runs verify a single snapshot in parallel. Healing runs
    /// reload the branch and hold its lock for one batch at a time so saves
    /// can interleave between batches.
    pub fn verify_branch(
        &self,
        note_id: &NoteId,
        branch: &str,
        options: VerifyOptions,
    ) -> Result<Vec<IntegrityCheckResult>> {
        validate_target(note_id, branch)?;
        let batch_size = self.config().verify_batch_size.max(1);
        let snapshot = self.snapshot(note_id, branch)?;
        let ids: Vec<EditId> = snapshot
            .ordered()
            .into_iter()
            .map(|r| r.edit_id.clone())
            .collect();

        let results = if options.fix {
            let mut results = Vec::with_capacity(ids.len());
            for chunk in ids.chunks(batch_size) {
                let _guard = self.lock_branch(note_id, branch, Priority::Normal)?;
                let map = self.load_chain(note_id, branch)?;
                for edit_id in chunk.iter().filter(|id| map.contains(id)) {
                    results.push(self.verify_in(&map, edit_id, true)?);
                }
            }
            results
        } else {
            let batches: Vec<Result<Vec<IntegrityCheckResult>>> = ids
                .par_chunks(batch_size)
                .map(|chunk| {
                    chunk
                        .iter()
                        .map(|edit_id| self.verify_in(&snapshot, edit_id, false))
                        .collect()
                })
                .collect();
            let mut results = Vec::with_capacity(ids.len());
            for batch in batches {
                results.extend(batch?);
            }
            results
        };

        let invalid = results.iter().filter(|r| !r.valid).count();
        let healed = results.iter().filter(|r| r.was_healed).count();
        debug!(
            note_id = %note_id,
            branch,
            checked = results.len(),
            invalid,
            healed,
            "verified branch"
        );
        Ok(results)
    }

    /// Verify every branch of a note, including branches that only exist in
    /// storage.
    pub fn verify_all_branches(
        &self,
        note_id: &NoteId,
        options: VerifyOptions,
    ) -> Result<Vec<IntegrityCheckResult>> {
        validate_note_id(note_id)?;
        let mut results = Vec::new();
        for branch in self.branches(note_id)? {
            results.extend(self.verify_branch(note_id, &branch, options)?);
        }
        Ok(results)
    }

    fn verify_in(
        &self,
        map: &ChainMap,
        edit_id: &EditId,
        fix: bool,
    ) -> Result<IntegrityCheckResult> {
        let record = map.get(edit_id).ok_or_else(|| {
            HistoryError::NotFound(format!(
                "edit {edit_id} in {}/{}",
                map.note_id(),
                map.branch()
            ))
        })?;

        let mut result = IntegrityCheckResult {
            note_id: record.note_id.clone(),
            branch_name: record.branch_name.clone(),
            edit_id: record.edit_id.clone(),
            valid: false,
            expected_hash: record.content_hash.clone(),
            actual_hash: None,
            was_healed: false,
            error: None,
        };

        let rebuilt = match self.reconstructor().reconstruct(map, edit_id) {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                let e = HistoryError::from(e);
                warn!(
                    note_id = %record.note_id,
                    branch = %record.branch_name,
                    edit_id = %edit_id,
                    error = %e,
                    "edit cannot be reconstructed"
                );
                self.cleanup_after(map, &e);
                result.error = Some(e.to_string());
                return Ok(result);
            }
        };

        result.actual_hash = Some(rebuilt.content_hash.clone());
        result.valid = rebuilt.verified;
        if rebuilt.verified {
            return Ok(result);
        }

        let mismatch = HistoryError::Integrity {
            edit_id: edit_id.clone(),
            expected: record.content_hash.clone(),
            actual: rebuilt.content_hash.clone(),
            severity: if is_valid_hash(&record.content_hash) {
                Severity::Critical
            } else {
                Severity::Warning
            },
        };
        warn!(
            note_id = %record.note_id,
            branch = %record.branch_name,
            error = %mismatch,
            "integrity mismatch"
        );

        if fix && mismatch.policy().healable {
            self.heal(record, &rebuilt)?;
            result.valid = true;
            result.was_healed = true;
        }
        Ok(result)
    }

    /// Rewrite hash and size fields of a record from its reconstruction.
    /// Callers hold the branch lock.
    fn heal(&self, record: &EditRecord, rebuilt: &Reconstruction) -> Result<()> {
        let mut healed = record.clone();
        healed.content_hash = rebuilt.content_hash.clone();
        healed.uncompressed_size = rebuilt.content.len() as u64;
        healed.size = healed.content.len() as u64;

        let manifest = self
            .database()
            .get_manifest(&record.note_id)?
            .unwrap_or_else(|| Manifest::new(record.note_id.clone()));
        let manifest = if manifest
            .edit(&record.branch_name, &record.edit_id)
            .is_some()
        {
            manifest.with_edit_metadata(
                &record.branch_name,
                &record.edit_id,
                &MetadataUpdate::from_record(&healed),
            )?
        } else {
            manifest.with_edit(&record.branch_name, EditSummary::from_record(&healed))
        };

        let key = healed.key();
        let mut batch = WriteBatch::new();
        batch.put_edit(healed).put_manifest(manifest);
        self.commit(batch)?;
        self.invalidate(&key);

        info!(
            note_id = %record.note_id,
            branch = %record.branch_name,
            edit_id = %record.edit_id,
            old_hash = %record.content_hash,
            new_hash = %rebuilt.content_hash,
            "healed edit"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::HistoryConfig;
    use crate::history::EditHistory;
    use crate::storage::{MemoryBackend, StorageBackend, WriteBatch};
    use crate::types::{EditKey, NoteId, VerifyOptions, MAIN_BRANCH};
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryBackend>, EditHistory) {
        let backend = Arc::new(MemoryBackend::new());
        let config = HistoryConfig {
            verify_batch_size: 2,
            ..Default::default()
        };
        let history = EditHistory::with_backend(backend.clone(), config).unwrap();
        (backend, history)
    }

    fn note() -> NoteId {
        NoteId::from("audit-note")
    }

    #[test]
    fn test_clean_branch_verifies() {
        let (_, h) = setup();
        let mut text = String::new();
        for i in 0..5 {
            text.push_str(&format!("line {i}\n"));
            h.store_edit(&note(), MAIN_BRANCH, text.clone(), None).unwrap();
        }
        let results = h
            .verify_branch(&note(), MAIN_BRANCH, VerifyOptions::read_only())
            .unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.valid && !r.was_healed));
    }

    #[test]
    fn test_heal_rewrites_bad_hash() {
        let (backend, h) = setup();
        let a = h.store_edit(&note(), MAIN_BRANCH, "hello\n".into(), None).unwrap();

        let key = EditKey::new(note(), MAIN_BRANCH, a.edit_id.clone());
        let mut record = backend.get(&key).unwrap().unwrap();
        record.content_hash = "0".repeat(64);
        backend.tamper(record);

        let check = h
            .verify_edit(&note(), MAIN_BRANCH, &a.edit_id, VerifyOptions::read_only())
            .unwrap();
        assert!(!check.valid);
        assert_eq!(check.actual_hash.as_deref(), Some(a.content_hash.as_str()));

        let healed = h
            .verify_edit(&note(), MAIN_BRANCH, &a.edit_id, VerifyOptions::heal())
            .unwrap();
        assert!(healed.valid);
        assert!(healed.was_healed);

        let again = h
            .verify_edit(&note(), MAIN_BRANCH, &a.edit_id, VerifyOptions::heal())
            .unwrap();
        assert!(again.valid);
        assert!(!again.was_healed);

        let manifest = h.manifest(&note()).unwrap().unwrap();
        assert_eq!(
            manifest.edit(MAIN_BRANCH, &a.edit_id).unwrap().content_hash,
            a.content_hash
        );
    }

    #[test]
    fn test_broken_chain_reports_error() {
        let (backend, h) = setup();
        let a = h.store_edit(&note(), MAIN_BRANCH, "a\n".into(), None).unwrap();
        let b = h.store_edit(&note(), MAIN_BRANCH, "a\nb\n".into(), None).unwrap();

        let mut batch = WriteBatch::new();
        batch.delete_edit(EditKey::new(note(), MAIN_BRANCH, a.edit_id));
        backend.commit(batch).unwrap();

        let results = h
            .verify_branch(&note(), MAIN_BRANCH, VerifyOptions::heal())
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].edit_id, b.edit_id);
        assert!(!results[0].valid);
        assert!(!results[0].was_healed);
        assert!(results[0].error.is_some());
        assert!(results[0].actual_hash.is_none());
    }

    #[test]
    fn test_verify_all_branches() {
        let (_, h) = setup();
        h.store_edit(&note(), MAIN_BRANCH, "x\n".into(), None).unwrap();
        h.create_branch(&note(), "alt", Some(MAIN_BRANCH)).unwrap();
        h.store_edit(&note(), "alt", "x\ny\n".into(), None).unwrap();

        let results = h
            .verify_all_branches(&note(), VerifyOptions::read_only())
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.valid));
    }

    #[test]
    fn test_missing_edit_is_not_found() {
        let (_, h) = setup();
        h.store_edit(&note(), MAIN_BRANCH, "x".into(), None).unwrap();
        let err = h
            .verify_edit(
                &note(),
                MAIN_BRANCH,
                &"missing".into(),
                VerifyOptions::read_only(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
