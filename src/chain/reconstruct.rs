//! Rebuilding edit content by replaying its chain.
//!
//! The walk goes backwards over `previous_edit_id` links until it reaches a
//! chain root (a full edit or a legacy row), then replays the collected
//! patches forward. Any failure aborts the whole call; partial content is
//! never returned.

use super::ChainMap;
use crate::codec::decode_content;
use crate::error::ReconstructionError;
use crate::hash::{compute_hash, verify_integrity};
use crate::patch::Patcher;
use crate::types::{EditId, EditRecord, Reconstruction};
use std::collections::HashSet;

/// Replays chains from a [`ChainMap`].
pub struct Reconstructor<'a> {
    patcher: &'a dyn Patcher,
    max_chain_length: usize,
}

impl<'a> Reconstructor<'a> {
    pub fn new(patcher: &'a dyn Patcher, max_chain_length: usize) -> Self {
        Self {
            patcher,
            max_chain_length,
        }
    }

    /// Records from the chain root up to `target`, in replay order.
    pub fn collect_chain<'m>(
        &self,
        map: &'m ChainMap,
        target: &EditId,
    ) -> Result<Vec<&'m EditRecord>, ReconstructionError> {
        let note_id = map.note_id().to_string();
        let branch = map.branch().to_string();

        let mut current = map.get(target).ok_or_else(|| ReconstructionError::MissingEdit {
            note_id: note_id.clone(),
            branch: branch.clone(),
            missing: target.clone(),
            referenced_by: target.clone(),
        })?;

        let mut visited: HashSet<&EditId> = HashSet::new();
        let mut chain = Vec::new();

        loop {
            if !visited.insert(&current.edit_id) {
                return Err(ReconstructionError::CircularReference {
                    note_id,
                    branch,
                    target: target.clone(),
                    edit_id: current.edit_id.clone(),
                });
            }
            chain.push(current);

            if current.is_chain_root() {
                break;
            }
            if chain.len() > self.max_chain_length {
                return Err(ReconstructionError::ChainLength {
                    note_id,
                    branch,
                    target: target.clone(),
                    max: self.max_chain_length,
                });
            }

            let previous_id =
                current
                    .previous_edit_id
                    .as_ref()
                    .ok_or_else(|| ReconstructionError::BrokenChain {
                        note_id: note_id.clone(),
                        branch: branch.clone(),
                        edit_id: current.edit_id.clone(),
                        reason: "diff edit has no previous edit".into(),
                    })?;

            current = map
                .get(previous_id)
                .ok_or_else(|| ReconstructionError::MissingEdit {
                    note_id: note_id.clone(),
                    branch: branch.clone(),
                    missing: previous_id.clone(),
                    referenced_by: current.edit_id.clone(),
                })?;
        }

        chain.reverse();
        self.check_bases(map, &chain)?;
        Ok(chain)
    }

    /// Rebuild the content of `target` and compare it with the stored hash.
    pub fn reconstruct(
        &self,
        map: &ChainMap,
        target: &EditId,
    ) -> Result<Reconstruction, ReconstructionError> {
        let chain = self.collect_chain(map, target)?;
        let Some((root, diffs)) = chain.split_first() else {
            return Err(ReconstructionError::MissingEdit {
                note_id: map.note_id().to_string(),
                branch: map.branch().to_string(),
                missing: target.clone(),
                referenced_by: target.clone(),
            });
        };

        let mut content = decode_content(root).map_err(|e| self.replay_error(map, root, e))?;
        for record in diffs {
            let patch = decode_content(record).map_err(|e| self.replay_error(map, record, e))?;
            content = self
                .patcher
                .apply_patch(&content, &patch)
                .map_err(|e| self.replay_error(map, record, e))?;
        }

        let target_record = diffs.last().copied().unwrap_or(*root);
        let content_hash = compute_hash(&content);
        let verified = verify_integrity(&content, &target_record.content_hash);

        Ok(Reconstruction {
            content,
            content_hash,
            verified,
            hops: diffs.len(),
        })
    }

    /// Every diff's recorded base must be the root the walk reached.
    fn check_bases(&self, map: &ChainMap, chain: &[&EditRecord]) -> Result<(), ReconstructionError> {
        let root = &chain[0].edit_id;
        for record in &chain[1..] {
            let Some(base) = &record.base_edit_id else {
                continue;
            };
            if base == root {
                continue;
            }
            if !map.contains(base) {
                return Err(ReconstructionError::MissingEdit {
                    note_id: map.note_id().to_string(),
                    branch: map.branch().to_string(),
                    missing: base.clone(),
                    referenced_by: record.edit_id.clone(),
                });
            }
            return Err(ReconstructionError::BrokenChain {
                note_id: map.note_id().to_string(),
                branch: map.branch().to_string(),
                edit_id: record.edit_id.clone(),
                reason: format!("recorded base {base} but chain root is {root}"),
            });
        }
        Ok(())
    }

    fn replay_error(
        &self,
        map: &ChainMap,
        record: &EditRecord,
        source: crate::error::HistoryError,
    ) -> ReconstructionError {
        ReconstructionError::PatchApplication {
            note_id: map.note_id().to_string(),
            branch: map.branch().to_string(),
            edit_id: record.edit_id.clone(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::test_support::{diff, full};
    use crate::hash::compute_hash;
    use crate::patch::UnifiedPatcher;
    use crate::types::NoteId;

    fn map(records: Vec<EditRecord>) -> ChainMap {
        ChainMap::from_records(NoteId::from("note"), "main", records)
    }

    #[test]
    fn test_full_edit_roundtrip() {
        let patcher = UnifiedPatcher::default();
        let map = map(vec![full("a", 1, "A\nB\nC")]);
        let result = Reconstructor::new(&patcher, 50)
            .reconstruct(&map, &EditId::from("a"))
            .unwrap();
        assert_eq!(result.content, "A\nB\nC");
        assert!(result.verified);
        assert_eq!(result.hops, 0);
    }

    #[test]
    fn test_replays_diffs() {
        let patcher = UnifiedPatcher::default();
        let v1 = "A\nB\nC";
        let v2 = "A\nB\nC\nD";
        let v3 = "A\nB2\nC\nD";
        let p2 = patcher.create_patch(v1, v2, "b");
        let p3 = patcher.create_patch(v2, v3, "c");
        let map = map(vec![
            full("a", 1, v1),
            diff("b", 2, "a", "a", 1, &p2, &compute_hash(v2)),
            diff("c", 3, "b", "a", 2, &p3, &compute_hash(v3)),
        ]);

        let result = Reconstructor::new(&patcher, 50)
            .reconstruct(&map, &EditId::from("c"))
            .unwrap();
        assert_eq!(result.content, v3);
        assert!(result.verified);
        assert_eq!(result.hops, 2);
    }

    #[test]
    fn test_hash_mismatch_is_reported_not_raised() {
        let patcher = UnifiedPatcher::default();
        let mut record = full("a", 1, "text");
        record.content_hash = compute_hash("other");
        let result = Reconstructor::new(&patcher, 50)
            .reconstruct(&map(vec![record]), &EditId::from("a"))
            .unwrap();
        assert!(!result.verified);
        assert_eq!(result.content_hash, compute_hash("text"));
    }

    #[test]
    fn test_cycle_is_detected() {
        let patcher = UnifiedPatcher::default();
        let map = map(vec![
            diff("A", 1, "B", "A", 1, "", ""),
            diff("B", 2, "A", "B", 1, "", ""),
        ]);
        let err = Reconstructor::new(&patcher, 50)
            .reconstruct(&map, &EditId::from("A"))
            .unwrap_err();
        assert!(matches!(err, ReconstructionError::CircularReference { .. }));
    }

    #[test]
    fn test_missing_previous() {
        let patcher = UnifiedPatcher::default();
        let map = map(vec![diff("b", 2, "gone", "gone", 1, "", "")]);
        let err = Reconstructor::new(&patcher, 50)
            .reconstruct(&map, &EditId::from("b"))
            .unwrap_err();
        match err {
            ReconstructionError::MissingEdit {
                missing,
                referenced_by,
                ..
            } => {
                assert_eq!(missing, EditId::from("gone"));
                assert_eq!(referenced_by, EditId::from("b"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_chain_length_bound() {
        let patcher = UnifiedPatcher::default();
        let mut records = vec![full("e0", 0, "")];
        for i in 1..=5u32 {
            records.push(diff(
                &format!("e{i}"),
                i as u64,
                &format!("e{}", i - 1),
                "e0",
                i,
                "",
                "",
            ));
        }
        let map = map(records);
        let err = Reconstructor::new(&patcher, 3)
            .reconstruct(&map, &EditId::from("e5"))
            .unwrap_err();
        assert!(matches!(err, ReconstructionError::ChainLength { max: 3, .. }));

        assert!(Reconstructor::new(&patcher, 5)
            .reconstruct(&map, &EditId::from("e5"))
            .is_ok());
    }

    #[test]
    fn test_diff_without_previous_is_broken() {
        let patcher = UnifiedPatcher::default();
        let mut record = diff("b", 2, "a", "a", 1, "", "");
        record.previous_edit_id = None;
        let err = Reconstructor::new(&patcher, 50)
            .reconstruct(&map(vec![full("a", 1, ""), record]), &EditId::from("b"))
            .unwrap_err();
        assert!(matches!(err, ReconstructionError::BrokenChain { .. }));
    }

    #[test]
    fn test_wrong_base_is_broken() {
        let patcher = UnifiedPatcher::default();
        let map = map(vec![
            full("a", 1, ""),
            full("z", 2, ""),
            diff("b", 3, "a", "z", 1, "", ""),
        ]);
        let err = Reconstructor::new(&patcher, 50)
            .reconstruct(&map, &EditId::from("b"))
            .unwrap_err();
        assert!(matches!(err, ReconstructionError::BrokenChain { .. }));
    }

    #[test]
    fn test_bad_patch_is_wrapped() {
        let patcher = UnifiedPatcher::default();
        let patch = patcher.create_patch("A\nB\n", "A\nC\n", "b");
        let map = map(vec![
            full("a", 1, "X\nY\n"),
            diff("b", 2, "a", "a", 1, &patch, ""),
        ]);
        let err = Reconstructor::new(&patcher, 50)
            .reconstruct(&map, &EditId::from("b"))
            .unwrap_err();
        match err {
            ReconstructionError::PatchApplication { edit_id, source, .. } => {
                assert_eq!(edit_id, EditId::from("b"));
                assert!(matches!(
                    *source,
                    crate::error::HistoryError::StateConsistency(_)
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
