//! Ordered schema migrations.
//!
//! Each step is a pure function over one record that returns whether it
//! changed anything. Steps must be idempotent: running one twice leaves the
//! record as the first run did.

use crate::error::{HistoryError, Result};
use crate::types::EditRecord;
use tracing::info;

/// Schema version written by this crate.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub apply: fn(&mut EditRecord) -> bool,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        apply: initial,
    },
    Migration {
        version: 2,
        name: "backfill_sizes",
        apply: backfill_sizes,
    },
    Migration {
        version: 3,
        name: "backfill_chain_fields",
        apply: backfill_chain_fields,
    },
];

fn initial(_record: &mut EditRecord) -> bool {
    false
}

fn backfill_sizes(record: &mut EditRecord) -> bool {
    let mut changed = false;
    if record.size == 0 && !record.content.is_empty() {
        record.size = record.content.len() as u64;
        changed = true;
    }
    if record.uncompressed_size == 0 && record.is_chain_root() {
        let plaintext = if record.is_legacy() {
            Some(record.content.len() as u64)
        } else {
            prepended_size(&record.content)
        };
        if let Some(size) = plaintext.filter(|s| *s > 0) {
            record.uncompressed_size = size;
            changed = true;
        }
    }
    changed
}

/// Rows written before chaining are all roots. Legacy rows keep their
/// missing storage type so they are still decoded as plaintext.
fn backfill_chain_fields(record: &mut EditRecord) -> bool {
    if !record.is_chain_root() {
        return false;
    }
    let mut changed = false;
    if record.base_edit_id.is_none() {
        record.base_edit_id = Some(record.edit_id.clone());
        changed = true;
    }
    if record.chain_length != 0 {
        record.chain_length = 0;
        changed = true;
    }
    changed
}

/// Uncompressed length stored in front of an LZ4 block.
fn prepended_size(content: &[u8]) -> Option<u64> {
    let bytes: [u8; 4] = content.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes) as u64)
}

/// Steps newer than `from`, in order.
pub fn pending(from: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > from)
}

/// Outcome of one migration step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationStep {
    pub version: u32,
    pub name: &'static str,
    pub changed: usize,
}

/// Bring records from schema `from` up to [`CURRENT_SCHEMA_VERSION`].
pub fn migrate(records: &mut [EditRecord], from: u32) -> Result<Vec<MigrationStep>> {
    if from > CURRENT_SCHEMA_VERSION {
        return Err(HistoryError::SchemaMismatch {
            found: from,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    let mut steps = Vec::new();
    for migration in pending(from) {
        let mut changed = 0;
        for record in records.iter_mut() {
            if (migration.apply)(record) {
                changed += 1;
            }
        }
        info!(
            version = migration.version,
            name = migration.name,
            changed,
            "applied migration"
        );
        steps.push(MigrationStep {
            version: migration.version,
            name: migration.name,
            changed,
        });
    }
    Ok(steps)
}
