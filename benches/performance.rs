//! Performance benchmarks for the edit history store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use edit_history::{
    ChainPolicyConfig, EditHistory, EditId, HistoryConfig, NoteId, VerifyOptions, MAIN_BRANCH,
};
use tempfile::TempDir;

fn create_history(dir: &TempDir, cache_size: usize) -> EditHistory {
    let mut config = HistoryConfig::at(dir.path().join("history"));
    config.reconstruction_cache_size = cache_size;
    config.chain = ChainPolicyConfig {
        small_max_chain: 1000,
        ..Default::default()
    };
    EditHistory::open(config).unwrap()
}

/// Store `depth + 1` growing versions and return the id of the last one.
fn build_chain(history: &EditHistory, note: &NoteId, depth: usize) -> EditId {
    let mut text = String::new();
    let mut last = None;
    for i in 0..=depth {
        text.push_str(&format!("line {i}\n"));
        last = Some(
            history
                .store_edit(note, MAIN_BRANCH, text.clone(), None)
                .unwrap()
                .edit_id,
        );
    }
    last.unwrap()
}

/// Benchmark reconstruction with varying chain depths
fn bench_reconstruction(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruction");

    for depth in [1, 10, 50, 200] {
        group.bench_with_input(BenchmarkId::new("chain_depth", depth), &depth, |b, &depth| {
            let dir = TempDir::new().unwrap();
            // No cache, so every iteration walks the chain.
            let history = create_history(&dir, 0);
            let note = NoteId::from("bench");
            let tip = build_chain(&history, &note, depth);

            b.iter(|| {
                black_box(history.reconstruct(&note, MAIN_BRANCH, &tip).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark saving edits, which reconstructs the predecessor each time
fn bench_store_edit(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_edit");

    for cache_size in [0, 256] {
        group.bench_with_input(
            BenchmarkId::new("cache_size", cache_size),
            &cache_size,
            |b, &cache_size| {
                let dir = TempDir::new().unwrap();
                let history = create_history(&dir, cache_size);
                let note = NoteId::from("bench");
                let mut text = String::new();
                let mut i = 0u64;

                b.iter(|| {
                    text.push_str(&format!("line {i}\n"));
                    i += 1;
                    black_box(
                        history
                            .store_edit(&note, MAIN_BRANCH, text.clone(), None)
                            .unwrap(),
                    );
                });
            },
        );
    }

    group.finish();
}

/// Benchmark read-only verification of a whole branch
fn bench_verify_branch(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let history = create_history(&dir, 0);
    let note = NoteId::from("bench");
    build_chain(&history, &note, 100);

    c.bench_function("verify_branch_100", |b| {
        b.iter(|| {
            black_box(
                history
                    .verify_branch(&note, MAIN_BRANCH, VerifyOptions::read_only())
                    .unwrap(),
            );
        });
    });
}

criterion_group!(
    benches,
    bench_reconstruction,
    bench_store_edit,
    bench_verify_branch,
);

criterion_main!(benches);
