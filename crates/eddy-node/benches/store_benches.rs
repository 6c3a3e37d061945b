//! Criterion benchmarks for eddy-node storage operations.
//!
//! Covers: id derivation, fresh admission, duplicate rejection, and
//! admission through the on-disk journal.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use eddy_core::types::{MessageEntry, Target};
use eddy_node_lib::DedupStore;

fn sample_entry(n: i64) -> MessageEntry {
    MessageEntry::new("alice", &Target::All, "the quick brown fox", n, "relay-a")
}

fn bench_compute_id(c: &mut Criterion) {
    let entry = sample_entry(0);
    c.bench_function("compute_id", |b| {
        b.iter(|| DedupStore::compute_id(black_box(&entry)))
    });
}

fn bench_admit(c: &mut Criterion) {
    let store = DedupStore::in_memory();
    let mut n = 0;
    c.bench_function("admit_fresh", |b| {
        b.iter_with_setup(
            || {
                n += 1;
                sample_entry(n)
            },
            |entry| store.admit(black_box(entry)),
        )
    });

    let dup = sample_entry(-1);
    store.admit(dup.clone());
    c.bench_function("admit_duplicate", |b| {
        b.iter_with_setup(|| dup.clone(), |entry| store.admit(black_box(entry)))
    });
}

fn bench_admit_journaled(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DedupStore::open(dir.path().join("relay_log.jsonl")).unwrap();
    let mut n = 0;
    c.bench_function("admit_journaled", |b| {
        b.iter_with_setup(
            || {
                n += 1;
                sample_entry(n)
            },
            |entry| store.admit(black_box(entry)),
        )
    });
}

criterion_group!(benches, bench_compute_id, bench_admit, bench_admit_journaled);
criterion_main!(benches);
