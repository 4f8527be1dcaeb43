//! Criterion benchmarks for segpatch.
//!
//! Covers the hot paths of both mutation routes:
//! - buffering and dumping updates for a sealed segment
//! - merging patch files from several source segments
//! - inserting into and scanning a dynamic posting tree

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segpatch::lexical::config::{DynamicTreeConfig, PatchCompression};
use segpatch::lexical::core::term_key::TermKey;
use segpatch::lexical::dynamic::arena::NodeArena;
use segpatch::lexical::dynamic::tree::DynamicPostingTree;
use segpatch::lexical::patch::buffer::SegmentUpdateBuffer;
use segpatch::lexical::patch::index_reader::PatchIndexReader;
use segpatch::lexical::patch::writer::PatchWriter;
use segpatch::storage::memory::MemoryStorage;

/// Generate (doc, term, is_delete) events.
fn generate_events(count: usize, seed: u64) -> Vec<(u32, u64, bool)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            (
                rng.random_range(0..100_000),
                rng.random_range(0..1_000),
                rng.random_bool(0.2),
            )
        })
        .collect()
}

fn bench_update_buffer(c: &mut Criterion) {
    let events = generate_events(50_000, 1);
    let mut group = c.benchmark_group("update_buffer");
    group.throughput(Throughput::Elements(events.len() as u64));

    for (name, compression) in [
        ("dump_raw", PatchCompression::None),
        ("dump_lz4", PatchCompression::Lz4 { block_size: 64 * 1024 }),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let storage = MemoryStorage::new_default();
                let buffer = SegmentUpdateBuffer::new("bench", 1, 0, compression);
                for &(doc, term, is_delete) in &events {
                    buffer.try_update(doc, TermKey::new(term), is_delete).unwrap();
                }
                black_box(buffer.dump(&storage).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_patch_merge(c: &mut Criterion) {
    let storage = MemoryStorage::new_default();
    for src in 1..=8u32 {
        let writer = PatchWriter::new("bench", src, 1, PatchCompression::None);
        for (doc, term, is_delete) in generate_events(10_000, src as u64) {
            writer.update(0, doc, TermKey::new(term), is_delete).unwrap();
        }
        writer.dump_all(&storage).unwrap();
    }

    c.bench_function("patch_merge_8_sources", |b| {
        b.iter(|| {
            let reader =
                PatchIndexReader::open(&storage, "bench", 0, 1, PatchCompression::None).unwrap();
            black_box(reader.term_count())
        })
    });
}

fn bench_dynamic_tree(c: &mut Criterion) {
    let events = generate_events(20_000, 7);
    let mut group = c.benchmark_group("dynamic_tree");
    group.throughput(Throughput::Elements(events.len() as u64));

    group.bench_function("insert", |b| {
        b.iter(|| {
            let arena = Arc::new(NodeArena::new(0, &DynamicTreeConfig::default()));
            let tree = DynamicPostingTree::new(TermKey::new(1), arena).unwrap();
            for &(doc, _, is_delete) in &events {
                tree.update(doc, is_delete).unwrap();
            }
            black_box(tree.len())
        })
    });

    let arena = Arc::new(NodeArena::new(0, &DynamicTreeConfig::default()));
    let tree = DynamicPostingTree::new(TermKey::new(1), arena).unwrap();
    for &(doc, _, is_delete) in &events {
        tree.update(doc, is_delete).unwrap();
    }
    group.bench_function("scan", |b| b.iter(|| black_box(tree.iter().count())));
    group.bench_function("get", |b| {
        b.iter(|| {
            events
                .iter()
                .filter(|(doc, _, _)| tree.get(*doc).is_some())
                .count()
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_update_buffer,
    bench_patch_merge,
    bench_dynamic_tree
);
criterion_main!(benches);
