//! Delta chains.
//!
//! Edits of one (note, branch) form chains: a full edit followed by diff
//! edits, each pointing at its predecessor. A [`ChainMap`] holds every edit of
//! one branch in memory; the policy, reconstruction and consistency checks all
//! work against it so a read loads the branch from storage exactly once.

mod consistency;
mod policy;
mod reconstruct;

pub use consistency::{check_consistency, ChainIssue, ChainIssueKind, ChainReport};
pub use policy::{ChainPolicy, ChainPolicyConfig, FullReason, Predecessor, StorageDecision};
pub use reconstruct::Reconstructor;

use crate::types::{EditId, EditRecord, NoteId};
use std::collections::HashMap;

/// Default chain cap for small documents.
pub const MAX_CHAIN_LENGTH: usize = 50;

/// All edits of one (note, branch), keyed by edit id.
#[derive(Clone, Debug)]
pub struct ChainMap {
    note_id: NoteId,
    branch: String,
    edits: HashMap<EditId, EditRecord>,
}

impl ChainMap {
    pub fn new(note_id: NoteId, branch: impl Into<String>) -> Self {
        Self {
            note_id,
            branch: branch.into(),
            edits: HashMap::new(),
        }
    }

    pub fn from_records(
        note_id: NoteId,
        branch: impl Into<String>,
        records: impl IntoIterator<Item = EditRecord>,
    ) -> Self {
        let mut map = Self::new(note_id, branch);
        for record in records {
            map.insert(record);
        }
        map
    }

    pub fn insert(&mut self, record: EditRecord) {
        self.edits.insert(record.edit_id.clone(), record);
    }

    pub fn get(&self, edit_id: &EditId) -> Option<&EditRecord> {
        self.edits.get(edit_id)
    }

    pub fn contains(&self, edit_id: &EditId) -> bool {
        self.edits.contains_key(edit_id)
    }

    pub fn note_id(&self) -> &NoteId {
        &self.note_id
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn len(&self) -> usize {
        self.edits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Most recently created edit.
    pub fn latest(&self) -> Option<&EditRecord> {
        self.edits
            .values()
            .max_by(|a, b| (a.created_at, a.seq, &a.edit_id).cmp(&(b.created_at, b.seq, &b.edit_id)))
    }

    /// Edits in storage order.
    pub fn ordered(&self) -> Vec<&EditRecord> {
        let mut records: Vec<&EditRecord> = self.edits.values().collect();
        records.sort_by(|a, b| (a.seq, a.created_at, &a.edit_id).cmp(&(b.seq, b.created_at, &b.edit_id)));
        records
    }

    /// Nearest full ancestor of an edit: itself if it is a root, otherwise
    /// its recorded base, falling back to walking predecessor links.
    pub fn effective_base(&self, record: &EditRecord) -> Option<EditId> {
        if record.is_chain_root() {
            return Some(record.edit_id.clone());
        }
        if let Some(base) = &record.base_edit_id {
            if self.edits.get(base).is_some_and(|b| b.is_chain_root()) {
                return Some(base.clone());
            }
        }

        let mut current = record;
        for _ in 0..self.edits.len() {
            let previous = self.edits.get(current.previous_edit_id.as_ref()?)?;
            if previous.is_chain_root() {
                return Some(previous.edit_id.clone());
            }
            current = previous;
        }
        None
    }

    /// Metadata of the latest edit, without reconstructing content.
    pub fn tip(&self) -> Option<ChainTip> {
        let latest = self.latest()?;
        Some(ChainTip {
            edit_id: latest.edit_id.clone(),
            base_edit_id: self.effective_base(latest),
            chain_length: latest.chain_length,
            content_hash: latest.content_hash.clone(),
        })
    }
}

/// Where the next save would chain from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainTip {
    pub edit_id: EditId,
    /// None when the chain is broken and no full ancestor is reachable.
    pub base_edit_id: Option<EditId>,
    pub chain_length: u32,
    pub content_hash: String,
}


#[cfg(test)]
mod tests {
    use super::test_support::{diff, full};
    use super::*;

    #[test]
    fn test_latest_and_tip() {
        let map = ChainMap::from_records(
            NoteId::from("note"),
            "main",
            vec![
                full("a", 1, "one\n"),
                diff("b", 2, "a", "a", 1, "", ""),
                diff("c", 3, "b", "a", 2, "", ""),
            ],
        );

        assert_eq!(map.latest().unwrap().edit_id, EditId::from("c"));
        let tip = map.tip().unwrap();
        assert_eq!(tip.base_edit_id, Some(EditId::from("a")));
        assert_eq!(tip.chain_length, 2);
    }

    #[test]
    fn test_effective_base_walks_when_base_is_missing() {
        let mut c = diff("c", 3, "b", "gone", 2, "", "");
        c.base_edit_id = Some(EditId::from("gone"));
        let map = ChainMap::from_records(
            NoteId::from("note"),
            "main",
            vec![full("a", 1, "x"), diff("b", 2, "a", "a", 1, "", ""), c.clone()],
        );
        assert_eq!(map.effective_base(&c), Some(EditId::from("a")));
    }

    #[test]
    fn test_ordered_by_sequence() {
        let map = ChainMap::from_records(
            NoteId::from("note"),
            "main",
            vec![full("z", 2, "x"), full("y", 1, "y"), full("x", 3, "z")],
        );
        let ids: Vec<_> = map.ordered().iter().map(|r| r.edit_id.0.clone()).collect();
        assert_eq!(ids, vec!["y", "z", "x"]);
    }
}
