//! In-memory indices shared by the storage backends.

use super::backend::{record_footprint, WriteBatch, WriteOp};
use crate::manifest::Manifest;
use crate::types::{EditId, EditKey, EditRecord, NoteId, Timestamp};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

/// Edit records keyed by (note, branch, edit) with a secondary index on
/// creation time, plus manifests keyed by note.
#[derive(Debug, Default)]
pub struct EditIndex {
    records: BTreeMap<EditKey, EditRecord>,
    by_created: BTreeSet<(Timestamp, u64, EditKey)>,
    manifests: BTreeMap<NoteId, Manifest>,
    next_seq: u64,
    bytes: u64,
}

impl EditIndex {
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            ..Default::default()
        }
    }

    /// Stamp sequence ids onto the batch's new records without applying it.
    /// Records overwriting an existing key keep its id.
    pub fn assign_sequences(&self, batch: &mut WriteBatch) {
        let mut next = self.next_seq.max(1);
        let mut assigned: HashMap<EditKey, u64> = HashMap::new();

        for op in batch.ops_mut() {
            if let WriteOp::PutEdit(record) = op {
                let key = record.key();
                record.seq = match self.records.get(&key) {
                    Some(existing) => existing.seq,
                    None => *assigned.entry(key).or_insert_with(|| {
                        let seq = next;
                        next += 1;
                        seq
                    }),
                };
            }
        }
    }

    /// Apply a batch whose records already carry sequence ids.
    pub fn apply(&mut self, batch: &WriteBatch) {
        for op in batch.ops() {
            match op {
                WriteOp::PutEdit(record) => self.insert(record.clone()),
                WriteOp::DeleteEdit(key) => {
                    self.remove(key);
                }
                WriteOp::PutManifest(manifest) => {
                    self.manifests
                        .insert(manifest.note_id.clone(), manifest.clone());
                }
                WriteOp::DeleteManifest(note_id) => {
                    self.manifests.remove(note_id);
                }
            }
        }
    }

    pub fn insert(&mut self, record: EditRecord) {
        let key = record.key();
        self.remove(&key);
        self.next_seq = self.next_seq.max(record.seq + 1);
        self.bytes += record_footprint(&record);
        self.by_created
            .insert((record.created_at, record.seq, key.clone()));
        self.records.insert(key, record);
    }

    pub fn remove(&mut self, key: &EditKey) -> Option<EditRecord> {
        let record = self.records.remove(key)?;
        self.bytes = self.bytes.saturating_sub(record_footprint(&record));
        self.by_created
            .remove(&(record.created_at, record.seq, key.clone()));
        Some(record)
    }

    pub fn get(&self, key: &EditKey) -> Option<&EditRecord> {
        self.records.get(key)
    }

    pub fn range(&self, note_id: &NoteId, branch: &str) -> Vec<EditRecord> {
        let start = EditKey::new(note_id.clone(), branch, EditId(String::new()));
        self.records
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|(k, _)| &k.note_id == note_id && k.branch_name == branch)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn scan_note(&self, note_id: &NoteId) -> Vec<EditRecord> {
        let start = EditKey::new(note_id.clone(), String::new(), EditId(String::new()));
        self.records
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|(k, _)| &k.note_id == note_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn scan_created_since(&self, since: Timestamp) -> Vec<EditRecord> {
        self.by_created
            .iter()
            .skip_while(|(created, _, _)| *created < since)
            .filter_map(|(_, _, key)| self.records.get(key).cloned())
            .collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &EditRecord> {
        self.records.values()
    }

    pub fn manifest(&self, note_id: &NoteId) -> Option<&Manifest> {
        self.manifests.get(note_id)
    }

    pub fn manifests(&self) -> impl Iterator<Item = &Manifest> {
        self.manifests.values()
    }

    /// Keys of up to `limit` records matching the predicate.
    pub fn matching_keys(
        &self,
        predicate: &dyn Fn(&EditRecord) -> bool,
        limit: usize,
    ) -> Vec<EditKey> {
        self.records
            .iter()
            .filter(|(_, r)| predicate(r))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}
