//! Link-only chain validation.
//!
//! Walks every edit's predecessor links without touching content. Cheap
//! enough to run before a full verification pass.

use super::ChainMap;
use crate::types::{EditId, NoteId};
use std::collections::HashSet;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainIssueKind {
    Cycle,
    MissingPrevious { missing: EditId },
    MissingBase { missing: EditId },
    DiffWithoutPrevious,
    TooLong { max: usize },
    ChainLengthMismatch { recorded: u32, actual: u32 },
    BaseMismatch { recorded: EditId, actual: EditId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainIssue {
    pub edit_id: EditId,
    pub kind: ChainIssueKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainReport {
    pub note_id: NoteId,
    pub branch: String,
    pub checked: usize,
    pub issues: Vec<ChainIssue>,
}

impl ChainReport {
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }

    /// Edits with at least one issue.
    pub fn affected(&self) -> HashSet<&EditId> {
        self.issues.iter().map(|i| &i.edit_id).collect()
    }
}

/// Check every edit of the map. Each edit reports at most one link issue,
/// plus any metadata mismatches when its links are sound.
pub fn check_consistency(map: &ChainMap, max_chain_length: usize) -> ChainReport {
    let mut issues = Vec::new();
    let records = map.ordered();

    for record in &records {
        match walk(map, &record.edit_id, max_chain_length) {
            Ok((root, hops)) => {
                if record.is_chain_root() {
                    continue;
                }
                if record.chain_length != hops {
                    issues.push(ChainIssue {
                        edit_id: record.edit_id.clone(),
                        kind: ChainIssueKind::ChainLengthMismatch {
                            recorded: record.chain_length,
                            actual: hops,
                        },
                    });
                }
                match &record.base_edit_id {
                    Some(base) if !map.contains(base) => issues.push(ChainIssue {
                        edit_id: record.edit_id.clone(),
                        kind: ChainIssueKind::MissingBase {
                            missing: base.clone(),
                        },
                    }),
                    Some(base) if *base != root => issues.push(ChainIssue {
                        edit_id: record.edit_id.clone(),
                        kind: ChainIssueKind::BaseMismatch {
                            recorded: base.clone(),
                            actual: root,
                        },
                    }),
                    _ => {}
                }
            }
            Err(kind) => issues.push(ChainIssue {
                edit_id: record.edit_id.clone(),
                kind,
            }),
        }
    }

    ChainReport {
        note_id: map.note_id().clone(),
        branch: map.branch().to_string(),
        checked: records.len(),
        issues,
    }
}

/// Follow predecessor links to the chain root, returning it and the hop count.
fn walk(map: &ChainMap, start: &EditId, max: usize) -> Result<(EditId, u32), ChainIssueKind> {
    let mut visited = HashSet::new();
    let mut current = match map.get(start) {
        Some(record) => record,
        None => {
            return Err(ChainIssueKind::MissingPrevious {
                missing: start.clone(),
            })
        }
    };
    let mut hops = 0u32;

    loop {
        if !visited.insert(current.edit_id.clone()) {
            return Err(ChainIssueKind::Cycle);
        }
        if current.is_chain_root() {
            return Ok((current.edit_id.clone(), hops));
        }
        hops += 1;
        if hops as usize > max {
            return Err(ChainIssueKind::TooLong { max });
        }
        let Some(previous) = &current.previous_edit_id else {
            return Err(ChainIssueKind::DiffWithoutPrevious);
        };
        current = map
            .get(previous)
            .ok_or_else(|| ChainIssueKind::MissingPrevious {
                missing: previous.clone(),
            })?;
    }
}
