//! Property tests for patches and delta chains.

use edit_history::{
    ChainPolicyConfig, EditHistory, HistoryConfig, MemoryBackend, NoteId, Patcher, StorageType,
    UnifiedPatcher, VerifyOptions, MAIN_BRANCH,
};
use proptest::prelude::*;
use std::sync::Arc;

/// Lines drawn from an alphabet that includes diff syntax, lone carriage
/// returns and runs of blank lines.
fn line() -> impl Strategy<Value = String> {
    prop_oneof![
        2 => Just(String::new()),
        1 => Just("-".to_string()),
        1 => Just("@@ -1 +1 @@".to_string()),
        6 => "[ab0-9 \\-+@\\\\\r]{0,8}",
    ]
}

fn document() -> impl Strategy<Value = String> {
    (prop::collection::vec(line(), 0..30), any::<bool>()).prop_map(
        |(lines, trailing_newline)| {
            let mut text = lines.join("\n");
            if trailing_newline && !text.is_empty() {
                text.push('\n');
            }
            text
        },
    )
}

/// A document followed by versions that each change a few of its lines.
fn edit_session() -> impl Strategy<Value = Vec<String>> {
    let edits = prop::collection::vec((any::<prop::sample::Index>(), line(), 0u8..3), 1..4);
    (document(), prop::collection::vec(edits, 1..15)).prop_map(|(first, rounds)| {
        let mut versions = vec![first];
        for round in rounds {
            let mut lines: Vec<String> = versions
                .last()
                .map(|v| v.split('\n').map(str::to_string).collect())
                .unwrap_or_default();
            for (at, text, op) in round {
                let i = at.index(lines.len() + 1);
                match op {
                    0 => lines.insert(i, text),
                    1 if i < lines.len() => lines[i] = text,
                    _ if i < lines.len() => {
                        lines.remove(i);
                    }
                    _ => lines.push(text),
                }
            }
            versions.push(lines.join("\n"));
        }
        versions
    })
}

fn history(small_max_chain: u32) -> EditHistory {
    let config = HistoryConfig {
        chain: ChainPolicyConfig {
            small_max_chain,
            ..Default::default()
        },
        reconstruction_cache_size: 0,
        ..Default::default()
    };
    EditHistory::with_backend(Arc::new(MemoryBackend::new()), config).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: applying a patch to its own base yields the new text
    #[test]
    fn patch_round_trip(old in document(), new in document()) {
        let patcher = UnifiedPatcher::default();
        let patch = patcher.create_patch(&old, &new, "p");
        prop_assert_eq!(patcher.apply_patch(&old, &patch).unwrap(), new);
    }

    /// Property: every stored edit reconstructs to exactly what was saved
    #[test]
    fn chain_reconstructs_every_version(versions in prop::collection::vec(document(), 1..20)) {
        let history = history(8);
        let note = NoteId::from("prop");

        let mut stored = Vec::new();
        for text in &versions {
            let edit = history
                .store_edit(&note, MAIN_BRANCH, text.clone(), None)
                .unwrap();
            stored.push(edit);
        }

        for (edit, text) in stored.iter().zip(&versions) {
            let rebuilt = history.reconstruct(&note, MAIN_BRANCH, &edit.edit_id).unwrap();
            prop_assert_eq!(&rebuilt.content, text);
            prop_assert!(rebuilt.verified);
            prop_assert_eq!(rebuilt.hops, edit.chain_length as usize);
        }

        let checks = history
            .verify_branch(&note, MAIN_BRANCH, VerifyOptions::read_only())
            .unwrap();
        prop_assert!(checks.iter().all(|c| c.valid));
    }

    /// Property: chains stay below the cap and full edits restart them
    #[test]
    fn chain_length_is_bounded(cap in 2u32..6, saves in 1usize..25) {
        let history = history(cap);
        let note = NoteId::from("bounded");

        let mut text = String::new();
        let mut previous: Option<u32> = None;
        for i in 0..saves {
            text.push_str(&format!("{i}\n"));
            let edit = history
                .store_edit(&note, MAIN_BRANCH, text.clone(), None)
                .unwrap();
            prop_assert!(edit.chain_length < cap);
            match edit.storage_type {
                StorageType::Full => prop_assert_eq!(edit.chain_length, 0),
                StorageType::Diff => {
                    prop_assert_eq!(Some(edit.chain_length - 1), previous);
                }
            }
            previous = Some(edit.chain_length);
        }
    }

    /// Property: with no cache, every edit of a session rebuilds from storage
    #[test]
    fn edit_session_replays_from_storage(versions in edit_session()) {
        let history = history(1000);
        let note = NoteId::from("session");

        let mut stored = Vec::new();
        for text in &versions {
            stored.push(history.store_edit(&note, MAIN_BRANCH, text.clone(), None).unwrap());
        }

        for (edit, text) in stored.iter().zip(&versions) {
            let rebuilt = history.reconstruct(&note, MAIN_BRANCH, &edit.edit_id).unwrap();
            prop_assert_eq!(&rebuilt.content, text);
        }

        let checks = history
            .verify_branch(&note, MAIN_BRANCH, VerifyOptions::read_only())
            .unwrap();
        prop_assert_eq!(checks.len(), versions.len());
        for check in &checks {
            prop_assert!(check.valid, "{:?}", check);
        }
    }
}
