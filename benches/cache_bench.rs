//! Benchmarks for the batch cache subsystem.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use batch_cache_tier::cache::entry::{EntryMetadata, EntryTable, NewEntry};
use batch_cache_tier::cache::evictor::Evictor;
use batch_cache_tier::cache::machine::CacheMachine;
use batch_cache_tier::cache::tier::TierKind;
use batch_cache_tier::config::{CompressionConfig, Config};
use batch_cache_tier::store::codec::BatchCodec;
use batch_cache_tier::{Column, TabularBatch};

fn sample_batch(rows: usize) -> TabularBatch {
    let ids: Vec<i64> = (0..rows as i64).collect();
    let values: Vec<f32> = ids.iter().map(|&i| (i % 113) as f32).collect();
    TabularBatch::try_new([
        ("id", Column::from_values(&ids)),
        ("value", Column::from_values(&values)),
    ])
    .unwrap()
}

fn bench_victim_selection(c: &mut Criterion) {
    let evictor = Evictor::new();

    // 10,000 entries in tier 0.
    let mut table = EntryTable::new();
    for i in 0..10_000 {
        let id = table
            .insert(
                NewEntry {
                    channel: format!("c{}", i % 8),
                    identifier: format!("{i}"),
                    tier: 0,
                    byte_size: 1024,
                    metadata: EntryMetadata::new(),
                    is_last: false,
                },
                false,
            )
            .unwrap()
            .id;
        table.unpin(id).unwrap();
    }

    c.bench_function("spill_select_100_from_10k", |b| {
        b.iter(|| {
            let victims = evictor.select_victims(black_box(table.entries()), 0, 100 * 1024);
            black_box(victims);
        })
    });
}

fn bench_codec(c: &mut Criterion) {
    let codec = BatchCodec::new(CompressionConfig::default());

    // 256KB batch.
    let batch = sample_batch(256 * 1024 / 12);
    let encoded = codec.encode(&batch).unwrap();

    c.bench_function("codec_encode_zstd_256kb", |b| {
        b.iter(|| black_box(codec.encode(black_box(&batch)).unwrap()))
    });
    c.bench_function("codec_decode_zstd_256kb", |b| {
        b.iter(|| black_box(codec.decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_add_pull(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut config = Config::with_tiers(&[("device", TierKind::Device, 64 * 1024), ("host", TierKind::Host, 64 * 1024 * 1024)]);
    config.channels.duplicate_policy = batch_cache_tier::config::DuplicatePolicy::Allow;
    let machine = rt.block_on(CacheMachine::new(Arc::new(config))).unwrap();
    let batch = sample_batch(1024);

    // Device holds five batches, so every round of eight forces spills.
    c.bench_function("add_pull_8_batches_with_spill", |b| {
        b.iter(|| {
            rt.block_on(async {
                for _ in 0..8 {
                    machine
                        .add("bench", "x", batch.clone(), EntryMetadata::new(), false)
                        .await
                        .unwrap();
                }
                for _ in 0..8 {
                    black_box(machine.pull_next("bench").await.unwrap());
                }
            })
        })
    });
}

criterion_group!(benches, bench_victim_selection, bench_codec, bench_add_pull);
criterion_main!(benches);
