use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use verso_core::{Replica, YrsReplica};
use yrs::{Text, Transact, WriteTxn};

/// Produce `n` single-keystroke deltas from one replica.
fn keystrokes(n: u32) -> Vec<Vec<u8>> {
    let source = YrsReplica::empty().unwrap();
    for i in 0..n {
        let mut txn = source.doc().transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, i, "x");
    }
    source.take_emitted()
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("Replica");
    group.throughput(Throughput::Elements(1));

    let deltas = keystrokes(1);
    let delta = deltas[0].clone();

    group.bench_function("apply_remote_delta", |b| {
        // Re-applying the same delta is a no-op after the first pass (idempotent)
        let dest = YrsReplica::empty().unwrap();
        b.iter(|| {
            dest.apply_update(black_box(&delta)).unwrap();
            black_box(dest.take_emitted());
        })
    });

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("Replica");
    let deltas = keystrokes(500);
    group.throughput(Throughput::Elements(deltas.len() as u64));

    group.bench_function("merge_500_keystrokes", |b| {
        b.iter(|| {
            let merged = YrsReplica::merge_updates(black_box(&deltas)).unwrap();
            black_box(merged);
        })
    });

    group.finish();
}

criterion_group!(benches, bench_apply_remote, bench_merge);
criterion_main!(benches);
