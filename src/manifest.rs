//! Per-document manifest.
//!
//! A [`Manifest`] is a lightweight index of edit metadata for one note. It is
//! a plain value: every update method takes `&self` and returns a new
//! manifest, and the caller persists the result in the same batch as the
//! edit records it describes.

use crate::error::{HistoryError, Result};
use crate::types::{EditId, EditRecord, NoteId, StorageType, Timestamp, MAIN_BRANCH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Separator used in lock keys; not allowed inside branch names.
pub const KEY_SEPARATOR: &str = "::";

/// Check that a branch name is usable.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(HistoryError::Validation("branch name is empty".into()));
    }
    if name != name.trim() {
        return Err(HistoryError::Validation(format!(
            "branch name {name:?} has surrounding whitespace"
        )));
    }
    if name.contains(KEY_SEPARATOR) {
        return Err(HistoryError::Validation(format!(
            "branch name {name:?} contains {KEY_SEPARATOR:?}"
        )));
    }
    Ok(())
}

/// Metadata kept for one edit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditSummary {
    pub edit_id: EditId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub size: u64,
    pub uncompressed_size: u64,
    pub content_hash: String,
    pub storage_type: StorageType,
    pub chain_length: u32,
}

impl EditSummary {
    pub fn from_record(record: &EditRecord) -> Self {
        Self {
            edit_id: record.edit_id.clone(),
            name: None,
            description: None,
            created_at: record.created_at,
            updated_at: record.created_at,
            size: record.size,
            uncompressed_size: record.uncompressed_size,
            content_hash: record.content_hash.clone(),
            storage_type: record.storage_type.unwrap_or(StorageType::Full),
            chain_length: record.chain_length,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchEntry {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// Must equal `edits.len()`; [`Manifest::repaired`] enforces it.
    pub edit_count: usize,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub edits: BTreeMap<EditId, EditSummary>,
}

impl BranchEntry {
    fn new(name: &str, now: Timestamp) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            created_at: now,
            updated_at: now,
            edit_count: 0,
            settings: BTreeMap::new(),
            edits: BTreeMap::new(),
        }
    }
}

/// Field changes for one edit, applied by [`Manifest::with_edit_metadata`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetadataUpdate {
    pub size: Option<u64>,
    pub uncompressed_size: Option<u64>,
    pub content_hash: Option<String>,
}

impl MetadataUpdate {
    pub fn from_record(record: &EditRecord) -> Self {
        Self {
            size: Some(record.size),
            uncompressed_size: Some(record.uncompressed_size),
            content_hash: Some(record.content_hash.clone()),
        }
    }
}

/// A fix applied to a manifest by [`Manifest::repaired`] or a repair pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestRepair {
    CreatedDefaultBranch,
    ResetActiveBranch { from: String, to: String },
    FixedEditCount { branch: String, recorded: usize, actual: usize },
    /// Entry for an edit that is no longer in storage.
    DroppedMissingEdit { branch: String, edit_id: EditId },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub note_id: NoteId,
    pub active_branch: String,
    pub branches: BTreeMap<String, BranchEntry>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Manifest {
    /// Fresh manifest with an empty main branch.
    pub fn new(note_id: NoteId) -> Self {
        let now = Timestamp::now();
        let mut branches = BTreeMap::new();
        branches.insert(MAIN_BRANCH.to_string(), BranchEntry::new(MAIN_BRANCH, now));
        Self {
            note_id,
            active_branch: MAIN_BRANCH.to_string(),
            branches,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn branch(&self, name: &str) -> Option<&BranchEntry> {
        self.branches.get(name)
    }

    pub fn has_branch(&self, name: &str) -> bool {
        self.branches.contains_key(name)
    }

    pub fn edit(&self, branch: &str, edit_id: &EditId) -> Option<&EditSummary> {
        self.branches.get(branch)?.edits.get(edit_id)
    }

    /// Add or replace an edit entry, creating its branch if needed.
    pub fn with_edit(&self, branch: &str, summary: EditSummary) -> Self {
        let mut next = self.clone();
        let now = Timestamp::now();
        let entry = next
            .branches
            .entry(branch.to_string())
            .or_insert_with(|| BranchEntry::new(branch, now));
        entry.edits.insert(summary.edit_id.clone(), summary);
        entry.edit_count = entry.edits.len();
        entry.updated_at = now;
        next.updated_at = now;
        next
    }

    /// Remove an edit entry. Unknown branches and edits are ignored.
    pub fn without_edit(&self, branch: &str, edit_id: &EditId) -> Self {
        let mut next = self.clone();
        if let Some(entry) = next.branches.get_mut(branch) {
            if entry.edits.remove(edit_id).is_some() {
                entry.edit_count = entry.edits.len();
                entry.updated_at = Timestamp::now();
                next.updated_at = entry.updated_at;
            }
        }
        next
    }

    /// Update size and hash fields of one edit.
    pub fn with_edit_metadata(
        &self,
        branch: &str,
        edit_id: &EditId,
        update: &MetadataUpdate,
    ) -> Result<Self> {
        let mut next = self.clone();
        let summary = next
            .branches
            .get_mut(branch)
            .and_then(|b| b.edits.get_mut(edit_id))
            .ok_or_else(|| {
                HistoryError::NotFound(format!(
                    "edit {edit_id} not in manifest of {}/{branch}",
                    self.note_id
                ))
            })?;

        if let Some(size) = update.size {
            summary.size = size;
        }
        if let Some(uncompressed) = update.uncompressed_size {
            summary.uncompressed_size = uncompressed;
        }
        if let Some(hash) = &update.content_hash {
            summary.content_hash = hash.clone();
        }
        let now = Timestamp::now();
        summary.updated_at = now;
        next.updated_at = now;
        Ok(next)
    }

    /// Create a branch, optionally cloning another branch's edits and settings.
    pub fn with_branch(&self, name: &str, from: Option<&str>) -> Result<Self> {
        validate_branch_name(name)?;
        if self.has_branch(name) {
            return Err(HistoryError::Validation(format!(
                "branch {name} already exists on {}",
                self.note_id
            )));
        }

        let now = Timestamp::now();
        let mut entry = BranchEntry::new(name, now);
        if let Some(source) = from {
            let source = self.branches.get(source).ok_or_else(|| {
                HistoryError::NotFound(format!("branch {source} on {}", self.note_id))
            })?;
            entry.settings = source.settings.clone();
            entry.edits = source.edits.clone();
            entry.edit_count = entry.edits.len();
        }

        let mut next = self.clone();
        next.branches.insert(name.to_string(), entry);
        next.updated_at = now;
        Ok(next)
    }

    /// Rename a branch. The active branch follows the rename.
    pub fn with_branch_renamed(&self, old: &str, new: &str) -> Result<Self> {
        validate_branch_name(new)?;
        if old == new {
            return Ok(self.clone());
        }
        if self.has_branch(new) {
            return Err(HistoryError::Validation(format!(
                "branch {new} already exists on {}",
                self.note_id
            )));
        }

        let mut next = self.clone();
        let mut entry = next.branches.remove(old).ok_or_else(|| {
            HistoryError::NotFound(format!("branch {old} on {}", self.note_id))
        })?;
        let now = Timestamp::now();
        entry.name = new.to_string();
        entry.updated_at = now;
        next.branches.insert(new.to_string(), entry);
        if next.active_branch == old {
            next.active_branch = new.to_string();
        }
        next.updated_at = now;
        Ok(next)
    }

    pub fn with_active_branch(&self, name: &str) -> Result<Self> {
        if !self.has_branch(name) {
            return Err(HistoryError::NotFound(format!(
                "branch {name} on {}",
                self.note_id
            )));
        }
        let mut next = self.clone();
        next.active_branch = name.to_string();
        next.updated_at = Timestamp::now();
        Ok(next)
    }

    /// Drop a branch. Removing the active branch falls back to another one.
    pub fn without_branch(&self, name: &str) -> Result<Self> {
        if !self.has_branch(name) {
            return Err(HistoryError::NotFound(format!(
                "branch {name} on {}",
                self.note_id
            )));
        }
        let mut next = self.clone();
        next.branches.remove(name);
        next.updated_at = Timestamp::now();
        Ok(next.repaired().0)
    }

    /// Guarantee a valid active branch and accurate edit counts.
    pub fn repaired(&self) -> (Self, Vec<ManifestRepair>) {
        let mut next = self.clone();
        let mut repairs = Vec::new();
        let now = Timestamp::now();

        if next.branches.is_empty() {
            next.branches
                .insert(MAIN_BRANCH.to_string(), BranchEntry::new(MAIN_BRANCH, now));
            repairs.push(ManifestRepair::CreatedDefaultBranch);
        }

        if !next.branches.contains_key(&next.active_branch) {
            let to = if next.branches.contains_key(MAIN_BRANCH) {
                MAIN_BRANCH.to_string()
            } else {
                // Non-empty after the check above.
                next.branches.keys().next().cloned().unwrap_or_default()
            };
            repairs.push(ManifestRepair::ResetActiveBranch {
                from: next.active_branch.clone(),
                to: to.clone(),
            });
            next.active_branch = to;
        }

        for (name, entry) in next.branches.iter_mut() {
            let actual = entry.edits.len();
            if entry.edit_count != actual {
                repairs.push(ManifestRepair::FixedEditCount {
                    branch: name.clone(),
                    recorded: entry.edit_count,
                    actual,
                });
                entry.edit_count = actual;
            }
        }

        if !repairs.is_empty() {
            next.updated_at = now;
        }
        (next, repairs)
    }
}
