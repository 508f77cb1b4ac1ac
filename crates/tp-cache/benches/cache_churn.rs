#![forbid(unsafe_code)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tp_alloc::{Allocator, RegionAllocator};
use tp_cache::{BlockCache, CacheConfig, NoPressure};
use tp_device::{Device, MemDevice};
use tp_io::{Engine, EngineConfig, WriteProps};
use tp_types::{BlockPtr, CompressionKind, ContentClass, DeviceId, IoClass, Txg};

fn make_rig(max_size: u64) -> (Arc<BlockCache>, Arc<Engine>) {
    let alloc = Arc::new(RegionAllocator::new(&[(DeviceId(1), 0, 64 << 20)]));
    let engine = Engine::new(EngineConfig::default(), alloc as Arc<dyn Allocator>);
    let dev = Arc::new(MemDevice::new(64 << 20));
    engine.attach_device(DeviceId(1), dev as Arc<dyn Device>);
    let config = CacheConfig {
        min_size: 1 << 20,
        max_size,
        min_dwell: Duration::from_millis(0),
        ..CacheConfig::default()
    };
    let cache = BlockCache::new(config, Arc::clone(&engine), Arc::new(NoPressure));
    (cache, engine)
}

fn seed_blocks(engine: &Arc<Engine>, count: u8, len: usize) -> Vec<BlockPtr> {
    (0..count)
        .map(|fill| {
            engine
                .write_sync(
                    vec![fill; len],
                    WriteProps {
                        compression: CompressionKind::Off,
                        ..WriteProps::default()
                    },
                    Txg(1),
                    IoClass::SyncWrite,
                )
                .expect("seed write")
        })
        .collect()
}

fn bench_cache_hit(c: &mut Criterion) {
    let (cache, engine) = make_rig(64 << 20);
    let ptrs = seed_blocks(&engine, 1, 4096);
    // Warm the single block so the loop measures pure hits.
    drop(cache.read_sync(&ptrs[0], ContentClass::Data).expect("warm"));

    c.bench_function("cache_hit_4k", |b| {
        b.iter(|| {
            let buf = cache
                .read_sync(black_box(&ptrs[0]), ContentClass::Data)
                .expect("hit");
            black_box(buf.len());
        });
    });
}

fn bench_cache_miss_churn(c: &mut Criterion) {
    // Cache holds ~4 blocks; a 32-block cycle never stops missing.
    let (cache, engine) = make_rig(1 << 20);
    let ptrs = seed_blocks(&engine, 32, 64 << 10);

    c.bench_function("cache_miss_churn_64k", |b| {
        let mut idx = 0_usize;
        b.iter(|| {
            let ptr = &ptrs[idx % ptrs.len()];
            idx += 1;
            let buf = cache
                .read_sync(black_box(ptr), ContentClass::Data)
                .expect("read");
            black_box(buf.len());
        });
    });
}

fn bench_mixed_working_set(c: &mut Criterion) {
    // Half the set fits: measures hit/evict/ghost interplay.
    let (cache, engine) = make_rig(2 << 20);
    let ptrs = seed_blocks(&engine, 64, 32 << 10);

    c.bench_function("cache_mixed_32k", |b| {
        let mut idx = 0_usize;
        b.iter(|| {
            // Skewed access: even indices twice as often.
            let pick = if idx % 3 == 0 { (idx / 3) % 64 } else { (idx % 32) * 2 % 64 };
            idx += 1;
            let buf = cache
                .read_sync(black_box(&ptrs[pick]), ContentClass::Data)
                .expect("read");
            black_box(buf.len());
        });
    });
}

criterion_group!(
    benches,
    bench_cache_hit,
    bench_cache_miss_churn,
    bench_mixed_working_set
);
criterion_main!(benches);
