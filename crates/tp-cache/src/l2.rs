//! Secondary cache: auxiliary fast devices that absorb blocks about to
//! be evicted from the primary cache.
//!
//! A feed pass selects candidates from the eviction-facing ends of the
//! two active generations (the MRU ends while the pool is still warming
//! up and nothing has been evicted yet), compresses them when that
//! shrinks the payload, and writes the batch sequentially from a
//! rotating cursor — preceded by an eviction sweep that clears existing
//! residents between the old and new cursor positions. Reads verify the
//! payload checksum and fall back to the primary store on any failure;
//! the secondary cache is strictly an accelerator, never an authority.

use crate::stats::{SecondaryCacheStats, SecondaryCacheStatsSnapshot};
use crate::{BlockCache, CacheEntry, CacheState, L2Shadow};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tp_error::EngineError;
use tp_io::{transform, ChildType, IoFlags};
use tp_types::{
    align_up, BlockAddr, BlockIdentity, BlockPtr, ByteOffset, Checksum, ChecksumKind,
    CompressionKind, ContentClass, DeviceId, IoClass, ALLOC_ALIGN,
};
use tracing::{debug, trace, warn};

/// Feed and read policy knobs.
#[derive(Debug, Clone)]
pub struct SecondaryCacheConfig {
    /// Per-cycle write budget in bytes.
    pub write_max: u64,
    /// Extra budget while the primary cache has not started evicting.
    pub write_boost: u64,
    /// Scan (and evict-ahead) depth as a multiple of the write budget.
    pub headroom: u64,
    /// Sleep between feed cycles.
    pub feed_interval: Duration,
    /// Shorter sleep after a cycle that filled its whole budget.
    pub min_feed_interval: Duration,
    /// Skip prefetched blocks.
    pub noprefetch: bool,
    /// Skip reads from a device that is mid-feed.
    pub norw: bool,
}

impl Default for SecondaryCacheConfig {
    fn default() -> Self {
        Self {
            write_max: 8 << 20,
            write_boost: 8 << 20,
            headroom: 2,
            feed_interval: Duration::from_secs(1),
            min_feed_interval: Duration::from_millis(200),
            noprefetch: true,
            norw: true,
        }
    }
}

struct ResidentBlock {
    identity: BlockIdentity,
    asize: u64,
}

struct Cursor {
    write: u64,
    evict: u64,
    first_pass: bool,
}

/// One auxiliary device absorbing evicted blocks.
pub struct SecondaryDevice {
    pub device: DeviceId,
    start: u64,
    end: u64,
    cursor: Mutex<Cursor>,
    resident: Mutex<BTreeMap<u64, ResidentBlock>>,
    writing: AtomicBool,
}

impl SecondaryDevice {
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.resident.lock().len()
    }

    /// Bytes currently resident on this device.
    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.resident.lock().values().map(|r| r.asize).sum()
    }

    #[must_use]
    pub fn write_cursor(&self) -> u64 {
        self.cursor.lock().write
    }

    #[must_use]
    pub fn is_first_pass(&self) -> bool {
        self.cursor.lock().first_pass
    }
}

/// Registry + policy for all attached secondary devices.
pub struct SecondaryCache {
    config: SecondaryCacheConfig,
    devices: RwLock<Vec<Arc<SecondaryDevice>>>,
    rotor: AtomicUsize,
    pub(crate) stats: SecondaryCacheStats,
}

impl SecondaryCache {
    #[must_use]
    pub fn new(config: SecondaryCacheConfig) -> Self {
        Self {
            config,
            devices: RwLock::new(Vec::new()),
            rotor: AtomicUsize::new(0),
            stats: SecondaryCacheStats::default(),
        }
    }

    /// Register `[start, start+len)` of `device` as secondary-cache
    /// space. The device must already be attached to the engine.
    pub fn attach(&self, device: DeviceId, start: ByteOffset, len: u64) {
        debug!(device = device.0, start = start.0, len, "l2_attach");
        self.devices.write().push(Arc::new(SecondaryDevice {
            device,
            start: start.0,
            end: start.0 + len,
            cursor: Mutex::new(Cursor {
                write: start.0,
                evict: start.0,
                first_pass: true,
            }),
            resident: Mutex::new(BTreeMap::new()),
            writing: AtomicBool::new(false),
        }));
    }

    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    #[must_use]
    pub fn devices(&self) -> Vec<Arc<SecondaryDevice>> {
        self.devices.read().clone()
    }

    #[must_use]
    pub fn stats(&self) -> SecondaryCacheStatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn config(&self) -> &SecondaryCacheConfig {
        &self.config
    }

    fn device_for(&self, id: DeviceId) -> Option<Arc<SecondaryDevice>> {
        self.devices.read().iter().find(|d| d.device == id).cloned()
    }

    fn next_device(&self) -> Option<Arc<SecondaryDevice>> {
        let devices = self.devices.read();
        if devices.is_empty() {
            return None;
        }
        let idx = self.rotor.fetch_add(1, Ordering::Relaxed) % devices.len();
        Some(Arc::clone(&devices[idx]))
    }
}

// ── Read-path hooks (called from the primary cache) ─────────────────────────

/// A shadow usable for a read right now: present, not mid-eviction, and
/// its device not mid-write when `norw` is set.
pub(crate) fn readable_shadow(cache: &BlockCache, entry: &Arc<CacheEntry>) -> Option<L2Shadow> {
    // Entry lock strictly before the resident-map lock (the feed path
    // orders them the same way).
    let (shadow, identity) = {
        let inner = entry.inner.lock();
        (inner.l2.clone()?, inner.identity)
    };
    if shadow.compression == CompressionKind::Empty {
        // Zero payload: reproduced locally, nothing to read.
        return Some(shadow);
    }
    let dev = cache.l2.device_for(shadow.device)?;
    if cache.l2.config.norw && dev.writing.load(Ordering::Acquire) {
        return None;
    }
    // Mid-eviction shadows have already left the resident map.
    let live = dev
        .resident
        .lock()
        .get(&shadow.offset.0)
        .is_some_and(|r| identity == Some(r.identity));
    live.then_some(shadow)
}

/// Synthetic pointer describing the payload as it sits on the secondary
/// device; the normal read pipeline verifies and inflates it.
pub(crate) fn shadow_ptr(shadow: &L2Shadow, lsize: u32) -> BlockPtr {
    BlockPtr {
        addrs: vec![BlockAddr {
            device: shadow.device,
            offset: shadow.offset,
            size: shadow.psize,
            gang: false,
        }],
        lsize,
        psize: shadow.psize,
        compression: shadow.compression,
        checksum_kind: ChecksumKind::Blake3,
        dedup: false,
        birth: tp_types::Txg::NONE,
        checksum: shadow.checksum,
    }
}

pub(crate) fn note_hit(cache: &BlockCache) {
    cache.l2.stats.hits.fetch_add(1, Ordering::Relaxed);
}

/// A secondary read failed; the caller falls back to the primary store.
pub(crate) fn note_failure(cache: &BlockCache, err: Option<&EngineError>) {
    let stats = &cache.l2.stats;
    if matches!(err, Some(EngineError::ChecksumMismatch { .. })) {
        stats.checksum_failures.fetch_add(1, Ordering::Relaxed);
    }
    stats.fallback_reads.fetch_add(1, Ordering::Relaxed);
    warn!(error = ?err, "l2_read_fallback");
}

/// Drop the device-side record of a shadow (free path).
pub(crate) fn forget_shadow(cache: &BlockCache, shadow: &L2Shadow) {
    if let Some(dev) = cache.l2.device_for(shadow.device) {
        dev.resident.lock().remove(&shadow.offset.0);
    }
}

// ── Feed ────────────────────────────────────────────────────────────────────

struct Candidate {
    entry: Arc<CacheEntry>,
    identity: BlockIdentity,
    payload: Arc<Vec<u8>>,
}

/// Would the feed pass take this entry right now? Excludes entries
/// already resident, mid-I/O, mid-feed, freed, payload-less, and — by
/// policy — prefetched ones.
#[must_use]
pub fn consider_for_write(cache: &BlockCache, entry: &Arc<CacheEntry>) -> bool {
    let noprefetch = cache.l2.config.noprefetch;
    let Some(inner) = entry.inner.try_lock() else {
        return false;
    };
    inner.l2.is_none()
        && !inner.l2_writing
        && !inner.io_in_progress
        && !inner.freed_in_flight
        && inner.data.is_some()
        && inner.identity.is_some()
        && !(noprefetch && inner.prefetch)
}

/// Clear residents in `[from, from + distance)` ahead of the write
/// cursor so the coming batch lands on unowned space.
pub fn evict_ahead(cache: &Arc<BlockCache>, dev: &SecondaryDevice, from: u64, distance: u64) {
    let victims: Vec<(u64, BlockIdentity)> = {
        let mut resident = dev.resident.lock();
        let keys: Vec<u64> = resident
            .range(from..from.saturating_add(distance))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|k| resident.remove(&k).map(|r| (k, r.identity)))
            .collect()
    };
    {
        let mut cursor = dev.cursor.lock();
        cursor.evict = from.saturating_add(distance).min(dev.end);
    }
    for (offset, identity) in victims {
        cache.l2.stats.evicted_shadows.fetch_add(1, Ordering::Relaxed);
        let Some(entry) = cache.lookup(&identity) else {
            continue;
        };
        let destroy = {
            let mut inner = entry.inner.lock();
            let matches = inner
                .l2
                .as_ref()
                .is_some_and(|s| s.offset.0 == offset && s.device == dev.device);
            if matches {
                inner.l2 = None;
            }
            matches && inner.state == CacheState::SecondaryOnly && inner.refs == 0
        };
        if destroy {
            // Payload existed only on the secondary device; the header
            // has no reason to live on.
            cache.destroy_entry(&entry);
        }
        trace!(offset, "l2_evict_ahead");
    }
}

/// Pick up to `budget` bytes of eligible entries from the cache's
/// eviction-facing ends, scanning at most `headroom ×` that many bytes.
fn select_candidates(cache: &Arc<BlockCache>, budget: u64, scan_limit: u64) -> Vec<Candidate> {
    let warmup = !cache.primary_has_evicted.load(Ordering::Acquire);
    let noprefetch = cache.l2.config.noprefetch;
    let mut picked = Vec::new();
    let mut picked_bytes = 0_u64;
    let mut scanned = 0_u64;

    'outer: for state in [CacheState::Frequent, CacheState::Recent] {
        for class in ContentClass::ALL {
            let shards = &cache.buckets[state.index()].lists[class.index()];
            for shard in shards {
                let list = shard.lock();
                // LRU end normally; MRU end during warm-up when nothing
                // has reached the tails yet.
                let iter: Box<dyn Iterator<Item = &Arc<CacheEntry>>> = if warmup {
                    Box::new(list.values().rev())
                } else {
                    Box::new(list.values())
                };
                for entry in iter {
                    if picked_bytes >= budget || scanned >= scan_limit {
                        break 'outer;
                    }
                    scanned += u64::from(entry.size);
                    let Some(mut inner) = entry.inner.try_lock() else {
                        continue;
                    };
                    // Same predicate as `consider_for_write`, checked
                    // under the guard we mark with.
                    if inner.l2.is_some()
                        || inner.l2_writing
                        || inner.io_in_progress
                        || inner.freed_in_flight
                        || inner.data.is_none()
                        || inner.identity.is_none()
                        || (noprefetch && inner.prefetch)
                    {
                        continue;
                    }
                    inner.l2_writing = true;
                    let candidate = Candidate {
                        entry: Arc::clone(entry),
                        identity: inner.identity.expect("checked above"),
                        payload: inner.data.clone().expect("checked above"),
                    };
                    drop(inner);
                    picked_bytes += u64::from(candidate.entry.size);
                    picked.push(candidate);
                }
            }
        }
    }
    picked
}

/// One feed cycle: evict ahead, select, compress, write the batch under
/// one parent, update shadows. Returns bytes written. Blocks until the
/// batch completes — the feed runs on its own dedicated thread.
pub fn feed_once(cache: &Arc<BlockCache>) -> u64 {
    let Some(dev) = cache.l2.next_device() else {
        return 0;
    };
    let config = &cache.l2.config;
    cache.l2.stats.feed_cycles.fetch_add(1, Ordering::Relaxed);

    let warmup = !cache.primary_has_evicted.load(Ordering::Acquire);
    let budget = if warmup {
        config.write_max + config.write_boost
    } else {
        config.write_max
    };
    let headroom = budget.saturating_mul(config.headroom.max(1));

    // Wrap early enough that one cycle never splits across the end.
    {
        let mut cursor = dev.cursor.lock();
        if cursor.write + headroom > dev.end {
            cursor.write = dev.start;
            cursor.first_pass = false;
            debug!(device = dev.device.0, "l2_cursor_wrap");
        }
    }
    let write_from = dev.cursor.lock().write;
    evict_ahead(cache, &dev, write_from, headroom);

    let candidates = select_candidates(cache, budget, headroom);
    if candidates.is_empty() {
        return 0;
    }

    dev.writing.store(true, Ordering::Release);
    let engine = Arc::clone(&cache.engine);
    let root = engine.root(IoFlags {
        godfather: true,
        ..IoFlags::default()
    });
    let mut children = Vec::new();
    let mut offset = write_from;
    let mut written = 0_u64;

    for candidate in candidates {
        // Replace-if-smaller compression; all-zero payloads are recorded
        // as a shadow with no on-device bytes at all.
        if transform::is_zeroes(&candidate.payload) {
            cache.l2.stats.zero_payloads.fetch_add(1, Ordering::Relaxed);
            let mut inner = candidate.entry.inner.lock();
            inner.l2_writing = false;
            inner.l2 = Some(L2Shadow {
                device: dev.device,
                offset: ByteOffset(0),
                psize: 0,
                compression: CompressionKind::Empty,
                checksum: Checksum::ZERO,
            });
            continue;
        }
        let (bytes, compression) =
            match transform::compress(CompressionKind::Lz4, &candidate.payload) {
                Some(compressed) => {
                    cache
                        .l2
                        .stats
                        .compressed_writes
                        .fetch_add(1, Ordering::Relaxed);
                    (compressed, CompressionKind::Lz4)
                }
                None => (candidate.payload.as_ref().clone(), CompressionKind::Off),
            };
        let psize = u32::try_from(bytes.len()).expect("payload fits u32");
        let asize = align_up(u64::from(psize), ALLOC_ALIGN).expect("aligned size fits");
        if offset + asize > write_from + budget || offset + asize > dev.end {
            candidate.entry.inner.lock().l2_writing = false;
            continue;
        }

        let shadow = L2Shadow {
            device: dev.device,
            offset: ByteOffset(offset),
            psize,
            compression,
            checksum: Checksum::of(&bytes),
        };
        let entry = Arc::clone(&candidate.entry);
        let identity = candidate.identity;
        let dev_cb = Arc::clone(&dev);
        let cache_cb = Arc::clone(cache);
        let child = engine.phys_write(
            dev.device,
            ByteOffset(offset),
            bytes,
            IoClass::AsyncWrite,
            true,
            Some(Box::new(move |_io, err| {
                let mut inner = entry.inner.lock();
                inner.l2_writing = false;
                match err {
                    None => {
                        inner.l2 = Some(shadow.clone());
                        drop(inner);
                        dev_cb.resident.lock().insert(
                            shadow.offset.0,
                            ResidentBlock {
                                identity,
                                asize: u64::from(shadow.psize),
                            },
                        );
                        cache_cb.l2.stats.writes.fetch_add(1, Ordering::Relaxed);
                        cache_cb
                            .l2
                            .stats
                            .write_bytes
                            .fetch_add(u64::from(shadow.psize), Ordering::Relaxed);
                    }
                    Some(err) => {
                        drop(inner);
                        cache_cb.l2.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %err, "l2_write_failed");
                    }
                }
            })),
        );
        tp_io::BlockIo::add_child(&root, &child, ChildType::Device);
        children.push(child);
        offset += asize;
        written += asize;
    }

    {
        let mut cursor = dev.cursor.lock();
        cursor.write = offset;
    }
    for child in &children {
        engine.execute(child);
    }
    engine.execute(&root);
    let _ = root.wait();
    dev.writing.store(false, Ordering::Release);
    trace!(device = dev.device.0, written, "l2_feed_cycle");
    written
}

/// Handle for the background feed thread; stops and joins on drop.
pub struct FeedHandle {
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Start the periodic feed loop.
#[must_use]
pub fn spawn_feed(cache: &Arc<BlockCache>) -> FeedHandle {
    let weak: Weak<BlockCache> = Arc::downgrade(cache);
    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = Arc::clone(&stop);
    let join = std::thread::Builder::new()
        .name("tp-cache-l2feed".to_owned())
        .spawn(move || loop {
            let Some(cache) = weak.upgrade() else {
                return;
            };
            if stop2.load(Ordering::Acquire) {
                return;
            }
            let config = cache.l2.config.clone();
            let budget = config.write_max;
            let wrote = feed_once(&cache);
            drop(cache);
            let sleep = if wrote >= budget {
                config.min_feed_interval
            } else {
                config.feed_interval
            };
            std::thread::sleep(sleep);
        })
        .expect("spawn feed thread");
    FeedHandle {
        stop,
        join: Some(join),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockCache, CacheConfig, NoPressure};
    use std::sync::Arc;
    use tp_alloc::{Allocator, RegionAllocator};
    use tp_device::{Device, MemDevice};
    use tp_io::{Engine, EngineConfig, WriteProps};
    use tp_types::Txg;

    const PRIMARY_LEN: usize = 32 << 20;
    const L2_LEN: u64 = 4 << 20;

    struct L2Rig {
        cache: Arc<BlockCache>,
        engine: Arc<Engine>,
        l2_dev: Arc<MemDevice>,
        primary_dev: Arc<MemDevice>,
    }

    fn l2_rig(l2_config: SecondaryCacheConfig) -> L2Rig {
        let alloc = Arc::new(RegionAllocator::new(&[(DeviceId(1), 0, 16 << 20)]));
        let engine = Engine::new(EngineConfig::default(), alloc as Arc<dyn Allocator>);
        let primary_dev = Arc::new(MemDevice::new(PRIMARY_LEN));
        engine.attach_device(DeviceId(1), Arc::clone(&primary_dev) as Arc<dyn Device>);
        let l2_dev = Arc::new(MemDevice::new(usize::try_from(L2_LEN).expect("fits")));
        engine.attach_device(DeviceId(9), Arc::clone(&l2_dev) as Arc<dyn Device>);

        let config = CacheConfig {
            min_size: 8 << 10,
            max_size: 64 << 20,
            l2: l2_config,
            ..CacheConfig::default()
        };
        let cache = BlockCache::new(config, Arc::clone(&engine), Arc::new(NoPressure));
        cache
            .secondary()
            .attach(DeviceId(9), ByteOffset::ZERO, L2_LEN);
        L2Rig {
            cache,
            engine,
            l2_dev,
            primary_dev,
        }
    }

    fn seed_and_cache(rig: &L2Rig, fill: u8, len: usize) -> BlockPtr {
        let ptr = rig
            .engine
            .write_sync(
                vec![fill; len],
                WriteProps {
                    compression: CompressionKind::Off,
                    ..WriteProps::default()
                },
                Txg(1),
                IoClass::SyncWrite,
            )
            .expect("seed");
        drop(
            rig.cache
                .read_sync(&ptr, ContentClass::Data)
                .expect("warm read"),
        );
        ptr
    }

    #[test]
    fn feed_writes_eligible_entries() {
        let rig = l2_rig(SecondaryCacheConfig::default());
        let ptr = seed_and_cache(&rig, 0xD1, 8192);

        let written = feed_once(&rig.cache);
        assert!(written > 0, "one eligible entry must be written");
        assert_eq!(rig.cache.secondary().stats().writes, 1);
        assert!(rig.l2_dev.stats().writes >= 1);

        let entry = rig
            .cache
            .lookup(&ptr.identity().expect("identity"))
            .expect("entry");
        let shadow = entry.inner.lock().l2.clone().expect("shadow set");
        assert_eq!(shadow.device, DeviceId(9));
        // Constant fill compresses.
        assert_eq!(shadow.compression, CompressionKind::Lz4);
    }

    #[test]
    fn feed_is_idempotent_for_resident_entries() {
        let rig = l2_rig(SecondaryCacheConfig::default());
        let _ptr = seed_and_cache(&rig, 0xD2, 8192);
        assert!(feed_once(&rig.cache) > 0);
        assert_eq!(
            feed_once(&rig.cache),
            0,
            "already-resident entries are ineligible"
        );
    }

    #[test]
    fn secondary_hit_serves_read_after_primary_eviction() {
        let rig = l2_rig(SecondaryCacheConfig::default());
        let ptr = seed_and_cache(&rig, 0xD3, 8192);
        assert!(feed_once(&rig.cache) > 0);

        // Evict the payload from the primary cache; the entry becomes
        // secondary-only rather than a ghost.
        let (evicted, _) =
            rig.cache
                .evict_from(CacheState::Recent, ContentClass::Data, u64::MAX, None);
        assert_eq!(evicted, 8192);
        let entry = rig
            .cache
            .lookup(&ptr.identity().expect("identity"))
            .expect("entry");
        assert_eq!(entry.state(), CacheState::SecondaryOnly);

        let primary_reads_before = rig.primary_dev.stats().reads;
        let buf = rig
            .cache
            .read_sync(&ptr, ContentClass::Data)
            .expect("l2 read");
        assert_eq!(buf.bytes(), &[0xD3; 8192][..]);
        assert_eq!(rig.cache.secondary().stats().hits, 1);
        assert_eq!(
            rig.primary_dev.stats().reads,
            primary_reads_before,
            "payload came from the secondary device"
        );
    }

    #[test]
    fn corrupted_secondary_payload_falls_back_to_primary() {
        let rig = l2_rig(SecondaryCacheConfig::default());
        let ptr = seed_and_cache(&rig, 0xD4, 8192);
        assert!(feed_once(&rig.cache) > 0);
        let _ = rig
            .cache
            .evict_from(CacheState::Recent, ContentClass::Data, u64::MAX, None);

        // Scribble the secondary copy.
        let entry = rig
            .cache
            .lookup(&ptr.identity().expect("identity"))
            .expect("entry");
        let shadow = entry.inner.lock().l2.clone().expect("shadow");
        rig.l2_dev
            .write_at(
                shadow.offset,
                &vec![0xFF_u8; usize::try_from(shadow.psize).expect("fits")],
            )
            .expect("scribble");

        let buf = rig
            .cache
            .read_sync(&ptr, ContentClass::Data)
            .expect("fallback read");
        assert_eq!(buf.bytes(), &[0xD4; 8192][..]);
        let stats = rig.cache.secondary().stats();
        assert_eq!(stats.checksum_failures, 1);
        assert_eq!(stats.fallback_reads, 1);
    }

    #[test]
    fn evict_ahead_clears_shadows_in_cursor_path() {
        let rig = l2_rig(SecondaryCacheConfig {
            write_max: 1 << 20,
            write_boost: 0,
            headroom: 2,
            ..SecondaryCacheConfig::default()
        });
        let ptr = seed_and_cache(&rig, 0xD5, 8192);
        assert!(feed_once(&rig.cache) > 0);
        let dev = rig.cache.secondary().devices().remove(0);
        assert_eq!(dev.resident_count(), 1);

        // Force the sweep over the whole device.
        evict_ahead(&rig.cache, &dev, dev.start, dev.end - dev.start);
        assert_eq!(dev.resident_count(), 0);
        assert_eq!(rig.cache.secondary().stats().evicted_shadows, 1);
        let entry = rig.cache.lookup(&ptr.identity().expect("identity"));
        let shadow = entry.and_then(|e| e.inner.lock().l2.clone());
        assert!(shadow.is_none(), "evicted shadow must be forgotten");
    }

    #[test]
    fn cursor_wraps_before_device_end() {
        let small = SecondaryCacheConfig {
            write_max: 1 << 20,
            write_boost: 0,
            headroom: 2,
            ..SecondaryCacheConfig::default()
        };
        let rig = l2_rig(small);
        // Fill enough distinct blocks to push the cursor toward the
        // 4 MiB device end: each cycle writes up to 1 MiB.
        for round in 0..6_u8 {
            for i in 0..16_u8 {
                let fill = round.wrapping_mul(16).wrapping_add(i) | 1;
                let _ptr = seed_and_cache(&rig, fill, 64 << 10);
            }
            let _ = feed_once(&rig.cache);
        }
        let dev = rig.cache.secondary().devices().remove(0);
        assert!(
            dev.write_cursor() <= dev.end,
            "cursor must stay inside the device"
        );
        assert!(
            !dev.is_first_pass() || dev.write_cursor() < dev.end,
            "either wrapped or still inside the first pass"
        );
    }

    #[test]
    fn all_zero_payload_recorded_without_device_write() {
        let rig = l2_rig(SecondaryCacheConfig::default());
        // An uncompressed all-zero block reaches the cache as a normal
        // payload (compression off at write time keeps it allocated).
        let ptr = seed_and_cache(&rig, 0x00, 4096);
        let writes_before = rig.l2_dev.stats().writes;
        let _ = feed_once(&rig.cache);
        assert_eq!(
            rig.l2_dev.stats().writes,
            writes_before,
            "zero payloads are recorded, not written"
        );
        assert_eq!(rig.cache.secondary().stats().zero_payloads, 1);

        let entry = rig
            .cache
            .lookup(&ptr.identity().expect("identity"))
            .expect("entry");
        let shadow = entry.inner.lock().l2.clone().expect("shadow");
        assert_eq!(shadow.compression, CompressionKind::Empty);
    }

    #[test]
    fn prefetched_entries_are_ineligible_under_noprefetch() {
        let rig = l2_rig(SecondaryCacheConfig::default());
        let ptr = rig
            .engine
            .write_sync(
                vec![0xD6; 8192],
                WriteProps {
                    compression: CompressionKind::Off,
                    ..WriteProps::default()
                },
                Txg(1),
                IoClass::SyncWrite,
            )
            .expect("seed");
        let (tx, rx) = std::sync::mpsc::channel();
        rig.cache.read_async(
            &ptr,
            ContentClass::Data,
            true, // prefetch
            Box::new(move |result| {
                tx.send(result.map(|buf| buf.bytes().to_vec())).expect("send");
            }),
        );
        rx.recv_timeout(Duration::from_secs(5))
            .expect("prefetch done")
            .expect("prefetch read");

        let entry = rig
            .cache
            .lookup(&ptr.identity().expect("identity"))
            .expect("cached");
        assert!(!consider_for_write(&rig.cache, &entry));
        assert_eq!(feed_once(&rig.cache), 0, "prefetched block is skipped");
        assert_eq!(rig.cache.secondary().stats().writes, 0);

        // A demand hit clears the prefetch flavor and makes it eligible.
        drop(rig.cache.read_sync(&ptr, ContentClass::Data).expect("hit"));
        let entry = rig
            .cache
            .lookup(&ptr.identity().expect("identity"))
            .expect("cached");
        assert!(consider_for_write(&rig.cache, &entry));
        assert!(feed_once(&rig.cache) > 0);
    }
}
