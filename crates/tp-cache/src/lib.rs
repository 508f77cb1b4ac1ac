#![forbid(unsafe_code)]
//! Adaptive block cache for the tidepool storage engine.
//!
//! An in-memory cache for variably-sized storage blocks with six states:
//! anonymous staging (`Anon`), two payload-bearing generations split by
//! recency vs. frequency (`Recent`, `Frequent`), their identity-only
//! ghosts (`RecentGhost`, `FrequentGhost`), and `SecondaryOnly` for
//! entries whose payload lives only on a secondary-cache device. The
//! split between the two generations is a moving target `p`, nudged by
//! ghost hits and bounded by the overall target size, which a background
//! reclaim loop shrinks under memory pressure and grows back under
//! demand.
//!
//! # Locking
//!
//! Three lock levels, always acquired in this order when taken together:
//!
//! 1. identity hash shard
//! 2. entry state (`CacheEntry::inner`)
//! 3. recency list shard
//!
//! The eviction scan walks a list shard first and therefore only ever
//! *tries* the entry lock from there (skip on contention, revisit on the
//! next pass); candidates that pass the non-blocking check are re-taken
//! in the blocking order. Scans examine a bounded number of nodes per
//! lock acquisition and carry a resumption cursor between batches, so no
//! lock is held for an unbounded walk.
//!
//! # Reference counts
//!
//! An entry's reference count is the authority for evictability: a
//! handed-out [`DataBuf`] holds one reference, and an entry is on a
//! recency list exactly when it has zero references, no I/O in flight,
//! and a payload-bearing (or ghost) state. Hits unlink; the last release
//! re-links at the MRU end.

pub mod l2;
pub mod stats;

use parking_lot::{Condvar, Mutex};
use stats::{CacheStats, CacheStatsSnapshot};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tp_error::{EngineError, Result};
use tp_io::{Engine, IoFlags, WriteProps};
use tp_types::{BlockIdentity, BlockPtr, Checksum, ContentClass, IoClass};
use tracing::{debug, trace, warn};

/// Cache state a header is in. `Anon` and the two ghosts never hold
/// payload; `SecondaryOnly` payload lives on a secondary device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Anon,
    Recent,
    RecentGhost,
    Frequent,
    FrequentGhost,
    SecondaryOnly,
}

impl CacheState {
    pub const COUNT: usize = 6;

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Anon => 0,
            Self::Recent => 1,
            Self::RecentGhost => 2,
            Self::Frequent => 3,
            Self::FrequentGhost => 4,
            Self::SecondaryOnly => 5,
        }
    }

    #[must_use]
    pub fn is_ghost(self) -> bool {
        matches!(self, Self::RecentGhost | Self::FrequentGhost)
    }

    /// Ghost state an active generation demotes into.
    #[must_use]
    fn ghost_of(self) -> Option<Self> {
        match self {
            Self::Recent => Some(Self::RecentGhost),
            Self::Frequent => Some(Self::FrequentGhost),
            _ => None,
        }
    }

    /// Active generation a ghost restores into.
    #[must_use]
    fn restore_of(self) -> Option<Self> {
        match self {
            Self::RecentGhost => Some(Self::Recent),
            Self::FrequentGhost => Some(Self::Frequent),
            _ => None,
        }
    }
}

/// Tunables. Everything numeric here is configuration, not a constant.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub min_size: u64,
    pub max_size: u64,
    /// Recency-list shards per (state, class).
    pub list_shards: usize,
    /// Identity hash table shards.
    pub hash_shards: usize,
    /// Dwell time in `Recent` before a second hit promotes to `Frequent`.
    pub min_dwell: Duration,
    /// Geometric shrink step: `target -= target >> shrink_shift`.
    pub shrink_shift: u32,
    /// Floor for the `Recent` target: `target >> p_min_shift`.
    pub p_min_shift: u32,
    /// Growth stays suppressed this long after a pressure shrink.
    pub grow_retry: Duration,
    /// List nodes examined per eviction lock acquisition.
    pub evict_batch: usize,
    /// Reclaim loop period.
    pub reclaim_interval: Duration,
    /// Secondary cache tunables.
    pub l2: l2::SecondaryCacheConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_size: 16 << 20,
            max_size: 256 << 20,
            list_shards: 8,
            hash_shards: 64,
            min_dwell: Duration::from_millis(62),
            shrink_shift: 5,
            p_min_shift: 4,
            grow_retry: Duration::from_secs(60),
            evict_batch: 128,
            reclaim_interval: Duration::from_secs(1),
            l2: l2::SecondaryCacheConfig::default(),
        }
    }
}

/// Memory pressure source consulted by the reclaim loop.
pub trait MemoryPressure: Send + Sync {
    fn under_pressure(&self) -> bool;
}

/// No pressure ever (default for embedders with their own limits).
#[derive(Debug, Default)]
pub struct NoPressure;

impl MemoryPressure for NoPressure {
    fn under_pressure(&self) -> bool {
        false
    }
}

/// Test/host-controlled pressure flag.
#[derive(Debug, Default)]
pub struct SettablePressure(AtomicBool);

impl SettablePressure {
    pub fn set(&self, on: bool) {
        self.0.store(on, Ordering::Release);
    }
}

impl MemoryPressure for SettablePressure {
    fn under_pressure(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Callback fired once when a registered buffer's entry loses its
/// payload (eviction, free, teardown). State travels in the closure.
pub type EvictFn = Box<dyn FnOnce(Option<&BlockIdentity>) + Send>;

/// Completion for an asynchronous read.
pub type ReadDone = Box<dyn FnOnce(Result<DataBuf>) + Send>;

/// Completion for an asynchronous write: the final pointer or the error.
pub type WriteDone = Box<dyn FnOnce(std::result::Result<BlockPtr, EngineError>) + Send>;

/// Secondary-cache shadow: where an entry's payload sits on a fast
/// auxiliary device.
#[derive(Debug, Clone)]
pub struct L2Shadow {
    pub device: tp_types::DeviceId,
    pub offset: tp_types::ByteOffset,
    pub psize: u32,
    pub compression: tp_types::CompressionKind,
    /// Checksum of the (possibly compressed) payload as written there.
    pub checksum: Checksum,
}

pub(crate) struct EntryInner {
    pub identity: Option<BlockIdentity>,
    pub state: CacheState,
    pub refs: u64,
    pub io_in_progress: bool,
    pub prefetch: bool,
    pub freed_in_flight: bool,
    pub in_hash: bool,
    pub data: Option<Arc<Vec<u8>>>,
    /// Debug integrity check frozen at fill time.
    pub frozen: Option<Checksum>,
    pub fetch_error: Option<EngineError>,
    pub accessed: Instant,
    pub link: Option<(usize, u64)>,
    pub waiters: Vec<ReadDone>,
    pub evict_callbacks: Vec<(u64, EvictFn)>,
    pub l2: Option<L2Shadow>,
    pub l2_writing: bool,
}

/// One cached block header: identity + bookkeeping, independent of
/// whether the payload is resident.
pub struct CacheEntry {
    pub size: u32,
    pub class: ContentClass,
    pub(crate) inner: Mutex<EntryInner>,
    pub(crate) cv: Condvar,
}

impl CacheEntry {
    fn new(size: u32, class: ContentClass, identity: Option<BlockIdentity>) -> Arc<Self> {
        Arc::new(Self {
            size,
            class,
            inner: Mutex::new(EntryInner {
                identity,
                state: CacheState::Anon,
                refs: 0,
                io_in_progress: false,
                prefetch: false,
                freed_in_flight: false,
                in_hash: false,
                data: None,
                frozen: None,
                fetch_error: None,
                accessed: Instant::now(),
                link: None,
                waiters: Vec::new(),
                evict_callbacks: Vec::new(),
                l2: None,
                l2_writing: false,
            }),
            cv: Condvar::new(),
        })
    }

    /// Current state (diagnostics and tests).
    #[must_use]
    pub fn state(&self) -> CacheState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn identity(&self) -> Option<BlockIdentity> {
        self.inner.lock().identity
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CacheEntry")
            .field("size", &self.size)
            .field("class", &self.class)
            .field("state", &inner.state)
            .field("refs", &inner.refs)
            .finish_non_exhaustive()
    }
}

/// A consumer's handle on a cached payload. Holds one reference on the
/// entry; dropping (or explicitly releasing) returns it. The payload
/// view is shared — [`BlockCache::clone_buf`] makes a private copy for a
/// second concurrent consumer that needs to mutate.
pub struct DataBuf {
    cache: Arc<BlockCache>,
    entry: Arc<CacheEntry>,
    payload: Arc<Vec<u8>>,
    id: u64,
    released: bool,
}

impl DataBuf {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    #[must_use]
    pub fn identity(&self) -> Option<BlockIdentity> {
        self.entry.identity()
    }

    #[must_use]
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    /// Register a callback fired once when this entry's payload goes
    /// away (eviction, free, or teardown).
    pub fn set_eviction_callback(&self, callback: EvictFn) {
        self.entry
            .inner
            .lock()
            .evict_callbacks
            .push((self.id, callback));
    }

    /// Explicit release; equivalent to dropping the buffer.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.cache.release_entry(&self.entry);
        }
    }
}

impl Drop for DataBuf {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for DataBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBuf")
            .field("len", &self.payload.len())
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

struct Bucket {
    /// Per content class, sharded `seq → entry` maps ordered by recency
    /// (low seq = LRU end).
    lists: [Vec<Mutex<BTreeMap<u64, Arc<CacheEntry>>>>; 2],
    sizes: [AtomicU64; 2],
}

impl Bucket {
    fn new(shards: usize) -> Self {
        let make = || {
            (0..shards)
                .map(|_| Mutex::new(BTreeMap::new()))
                .collect::<Vec<_>>()
        };
        Self {
            lists: [make(), make()],
            sizes: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    fn size_total(&self) -> u64 {
        self.sizes[0].load(Ordering::Relaxed) + self.sizes[1].load(Ordering::Relaxed)
    }
}

struct Sizing {
    target: AtomicU64,
    /// Target byte share of the `Recent` generation within `target`.
    p: AtomicU64,
    grow_suppressed_until: Mutex<Option<Instant>>,
}

/// The block cache. Construct with [`BlockCache::new`], share by `Arc`,
/// and optionally start the reclaim loop with [`spawn_reclaim`].
pub struct BlockCache {
    pub(crate) engine: Arc<Engine>,
    config: CacheConfig,
    pressure: Arc<dyn MemoryPressure>,
    hash: Vec<Mutex<HashMap<BlockIdentity, Arc<CacheEntry>>>>,
    buckets: [Bucket; CacheState::COUNT],
    sizing: Sizing,
    seq: AtomicU64,
    buf_ids: AtomicU64,
    /// Round-robin eviction cursor per (state, class).
    evict_cursor: [[AtomicU64; 2]; CacheState::COUNT],
    pub(crate) stats: CacheStats,
    pub(crate) l2: l2::SecondaryCache,
    /// Set once the primary cache has evicted anything; the secondary
    /// cache scans the MRU end until then (pool warm-up).
    pub(crate) primary_has_evicted: AtomicBool,
    reclaim_signal: Mutex<bool>,
    reclaim_cv: Condvar,
    stopping: AtomicBool,
}

impl BlockCache {
    #[must_use]
    pub fn new(
        config: CacheConfig,
        engine: Arc<Engine>,
        pressure: Arc<dyn MemoryPressure>,
    ) -> Arc<Self> {
        let hash = (0..config.hash_shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        let shards = config.list_shards.max(1);
        let buckets = [
            Bucket::new(shards),
            Bucket::new(shards),
            Bucket::new(shards),
            Bucket::new(shards),
            Bucket::new(shards),
            Bucket::new(shards),
        ];
        let target = (config.max_size / 2).max(config.min_size);
        let l2 = l2::SecondaryCache::new(config.l2.clone());
        Arc::new(Self {
            engine,
            config,
            l2,
            pressure,
            hash,
            buckets,
            sizing: Sizing {
                target: AtomicU64::new(target),
                p: AtomicU64::new(target / 2),
                grow_suppressed_until: Mutex::new(None),
            },
            seq: AtomicU64::new(1),
            buf_ids: AtomicU64::new(1),
            evict_cursor: Default::default(),
            stats: CacheStats::default(),
            primary_has_evicted: AtomicBool::new(false),
            reclaim_signal: Mutex::new(false),
            reclaim_cv: Condvar::new(),
            stopping: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The secondary-cache layer (device registry, feed policy, stats).
    #[must_use]
    pub fn secondary(&self) -> &l2::SecondaryCache {
        &self.l2
    }

    // ── Sizing accessors ────────────────────────────────────────────────

    #[must_use]
    pub fn target(&self) -> u64 {
        self.sizing.target.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn recent_target(&self) -> u64 {
        self.sizing.p.load(Ordering::Relaxed)
    }

    /// Payload-bearing bytes (anon + both active generations).
    #[must_use]
    pub fn usage(&self) -> u64 {
        self.buckets[CacheState::Anon.index()].size_total()
            + self.buckets[CacheState::Recent.index()].size_total()
            + self.buckets[CacheState::Frequent.index()].size_total()
    }

    #[must_use]
    pub fn state_bytes(&self, state: CacheState) -> u64 {
        self.buckets[state.index()].size_total()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            recent_hits: self.stats.recent_hits.load(Ordering::Relaxed),
            frequent_hits: self.stats.frequent_hits.load(Ordering::Relaxed),
            recent_ghost_hits: self.stats.recent_ghost_hits.load(Ordering::Relaxed),
            frequent_ghost_hits: self.stats.frequent_ghost_hits.load(Ordering::Relaxed),
            in_flight_joins: self.stats.in_flight_joins.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            recycles: self.stats.recycles.load(Ordering::Relaxed),
            ghost_evictions: self.stats.ghost_evictions.load(Ordering::Relaxed),
            fetch_failures: self.stats.fetch_failures.load(Ordering::Relaxed),
            shrinks: self.stats.shrinks.load(Ordering::Relaxed),
            grows: self.stats.grows.load(Ordering::Relaxed),
            target: self.target(),
            recent_target: self.recent_target(),
            anon_bytes: self.state_bytes(CacheState::Anon),
            recent_bytes: self.state_bytes(CacheState::Recent),
            frequent_bytes: self.state_bytes(CacheState::Frequent),
            recent_ghost_bytes: self.state_bytes(CacheState::RecentGhost),
            frequent_ghost_bytes: self.state_bytes(CacheState::FrequentGhost),
            secondary_only_bytes: self.state_bytes(CacheState::SecondaryOnly),
        }
    }

    // ── Hash table ──────────────────────────────────────────────────────

    fn hash_shard(&self, identity: &BlockIdentity) -> usize {
        let mut key = [0_u8; 32];
        key[..8].copy_from_slice(&identity.addr.device.0.to_le_bytes());
        key[8..16].copy_from_slice(&identity.addr.offset.0.to_le_bytes());
        key[16..24].copy_from_slice(&identity.birth.0.to_le_bytes());
        key[24..].copy_from_slice(&identity.partial.to_le_bytes());
        let h = xxhash_rust::xxh3::xxh3_64(&key);
        usize::try_from(h % u64::try_from(self.hash.len()).expect("shard count fits"))
            .expect("shard index fits")
    }

    /// Probe the hash table.
    #[must_use]
    pub fn lookup(&self, identity: &BlockIdentity) -> Option<Arc<CacheEntry>> {
        let shard = self.hash_shard(identity);
        self.hash[shard].lock().get(identity).cloned()
    }

    // ── List plumbing ───────────────────────────────────────────────────

    /// Stable list shard for an entry. Takes the already-held guard so
    /// callers inside the entry lock cannot re-enter it.
    fn list_shard_of(&self, inner: &EntryInner) -> usize {
        let key = inner.identity.map_or(0, |id| id.partial);
        usize::try_from(key % u64::try_from(self.config.list_shards.max(1)).expect("fits"))
            .expect("fits")
    }

    /// Link at the MRU end. Caller holds the entry lock and guarantees
    /// refs == 0, no I/O, and a listable state.
    fn link_locked(&self, entry: &Arc<CacheEntry>, inner: &mut EntryInner, shard: usize) {
        debug_assert!(inner.link.is_none());
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let bucket = &self.buckets[inner.state.index()];
        bucket.lists[entry.class.index()][shard]
            .lock()
            .insert(seq, Arc::clone(entry));
        inner.link = Some((shard, seq));
    }

    /// Unlink if linked. Caller holds the entry lock.
    fn unlink_locked(&self, entry: &CacheEntry, inner: &mut EntryInner) {
        if let Some((shard, seq)) = inner.link.take() {
            let bucket = &self.buckets[inner.state.index()];
            bucket.lists[entry.class.index()][shard].lock().remove(&seq);
        }
    }

    fn add_size(&self, state: CacheState, class: ContentClass, bytes: u64) {
        self.buckets[state.index()].sizes[class.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_size(&self, state: CacheState, class: ContentClass, bytes: u64) {
        let prev = self.buckets[state.index()].sizes[class.index()]
            .fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "cache size accounting underflow");
    }

    /// Move between states, fixing the size accounting. Caller holds the
    /// entry lock; the entry must be unlinked.
    fn change_state_locked(
        &self,
        entry: &CacheEntry,
        inner: &mut EntryInner,
        to: CacheState,
    ) {
        debug_assert!(inner.link.is_none(), "state change while linked");
        let from = inner.state;
        if from == to {
            return;
        }
        self.sub_size(from, entry.class, u64::from(entry.size));
        self.add_size(to, entry.class, u64::from(entry.size));
        inner.state = to;
        trace!(from = ?from, to = ?to, size = entry.size, "cache_state_change");
    }

    // ── Read path ───────────────────────────────────────────────────────

    /// Synchronous read: hit returns at once, a miss blocks the caller
    /// behind exactly one fetch (concurrent readers of the same identity
    /// join the in-flight I/O rather than duplicating it).
    pub fn read_sync(self: &Arc<Self>, ptr: &BlockPtr, class: ContentClass) -> Result<DataBuf> {
        let entry = self.read_begin(ptr, class, false, None)?;
        match entry {
            ReadBegun::Hit(buf) => Ok(buf),
            ReadBegun::InFlight(entry) => {
                let mut inner = entry.inner.lock();
                while inner.io_in_progress {
                    entry.cv.wait(&mut inner);
                }
                if let Some(err) = inner.fetch_error.clone() {
                    return Err(err);
                }
                let payload = inner
                    .data
                    .clone()
                    .ok_or_else(|| EngineError::Invariant("fetch left no payload".to_owned()))?;
                inner.refs += 1;
                self.unlink_locked(&entry, &mut inner);
                drop(inner);
                Ok(self.make_buf(&entry, payload))
            }
        }
    }

    /// Asynchronous read: `done` runs when the payload is resident (or
    /// the fetch fails). `prefetch` marks the speculative flavor that
    /// ghost/secondary policies treat specially. With a callback
    /// supplied, every outcome — hit, joined in-flight fetch, failure —
    /// is delivered through it.
    pub fn read_async(
        self: &Arc<Self>,
        ptr: &BlockPtr,
        class: ContentClass,
        prefetch: bool,
        done: ReadDone,
    ) {
        let _ = self.read_begin(ptr, class, prefetch, Some(done));
    }

    fn make_buf(self: &Arc<Self>, entry: &Arc<CacheEntry>, payload: Arc<Vec<u8>>) -> DataBuf {
        DataBuf {
            cache: Arc::clone(self),
            entry: Arc::clone(entry),
            payload,
            id: self.buf_ids.fetch_add(1, Ordering::Relaxed),
            released: false,
        }
    }

    fn read_begin(
        self: &Arc<Self>,
        ptr: &BlockPtr,
        class: ContentClass,
        prefetch: bool,
        mut done: Option<ReadDone>,
    ) -> Result<ReadBegun> {
        let Some(identity) = ptr.identity() else {
            // Holes and empty blocks: materialize zeroes without caching.
            let bytes = match self.engine.read_sync(ptr, IoClass::SyncRead) {
                Ok(bytes) => bytes,
                Err(err) => {
                    if let Some(done) = done.take() {
                        done(Err(err.clone()));
                    }
                    return Err(err);
                }
            };
            let entry = CacheEntry::new(ptr.lsize, class, None);
            {
                let mut inner = entry.inner.lock();
                inner.refs = 1;
                let payload = Arc::new(bytes);
                inner.data = Some(Arc::clone(&payload));
                drop(inner);
                self.add_size(CacheState::Anon, class, u64::from(ptr.lsize));
                let buf = self.make_buf(&entry, payload);
                if let Some(done) = done.take() {
                    done(Ok(buf));
                    return Ok(ReadBegun::InFlight(entry));
                }
                return Ok(ReadBegun::Hit(buf));
            }
        };

        loop {
            let shard = self.hash_shard(&identity);
            let existing = self.hash[shard].lock().get(&identity).cloned();
            let Some(entry) = existing else {
                // Miss: one fetch, everyone else joins it.
                let entry = CacheEntry::new(ptr.lsize, class, Some(identity));
                {
                    let mut inner = entry.inner.lock();
                    inner.io_in_progress = true;
                    inner.prefetch = prefetch;
                    inner.in_hash = true;
                    if let Some(done) = done.take() {
                        inner.waiters.push(done);
                    }
                }
                let mut map = self.hash[shard].lock();
                if map.contains_key(&identity) {
                    // Lost the insert race; retry against the winner.
                    drop(map);
                    done = entry.inner.lock().waiters.pop();
                    continue;
                }
                map.insert(identity, Arc::clone(&entry));
                drop(map);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.add_size(CacheState::Anon, class, u64::from(ptr.lsize));
                self.maybe_make_room(ptr.lsize, class);
                self.issue_fetch(&entry, ptr.clone(), prefetch);
                return Ok(ReadBegun::InFlight(entry));
            };

            let mut inner = entry.inner.lock();
            if inner.identity != Some(identity) || !inner.in_hash {
                // Invalidated between probe and lock; take it again.
                drop(inner);
                continue;
            }

            if inner.io_in_progress {
                self.stats.in_flight_joins.fetch_add(1, Ordering::Relaxed);
                if let Some(done) = done.take() {
                    inner.waiters.push(done);
                    return Ok(ReadBegun::InFlight(entry.clone()));
                }
                drop(inner);
                return Ok(ReadBegun::InFlight(entry));
            }

            if let Some(payload) = inner.data.clone() {
                // Hit with resident payload.
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                inner.refs += 1;
                self.unlink_locked(&entry, &mut inner);
                self.promote_on_hit(&entry, &mut inner);
                drop(inner);
                let buf = self.make_buf(&entry, payload);
                if let Some(done) = done.take() {
                    done(Ok(buf));
                    return Ok(ReadBegun::InFlight(entry));
                }
                return Ok(ReadBegun::Hit(buf));
            }

            match inner.state {
                ghost @ (CacheState::RecentGhost | CacheState::FrequentGhost) => {
                    // Ghost hit: adapt the split and re-fetch — the
                    // payload is never resurrected from a ghost.
                    self.adapt_on_ghost_hit(ghost, u64::from(entry.size));
                    let restore = ghost.restore_of().expect("ghost restores");
                    self.unlink_locked(&entry, &mut inner);
                    self.change_state_locked(&entry, &mut inner, restore);
                    inner.io_in_progress = true;
                    inner.accessed = Instant::now();
                    if let Some(done) = done.take() {
                        inner.waiters.push(done);
                    }
                    drop(inner);
                    self.maybe_make_room(ptr.lsize, class);
                    self.issue_fetch(&entry, ptr.clone(), prefetch);
                    return Ok(ReadBegun::InFlight(entry));
                }
                CacheState::SecondaryOnly => {
                    self.unlink_locked(&entry, &mut inner);
                    self.change_state_locked(&entry, &mut inner, CacheState::Recent);
                    inner.io_in_progress = true;
                    inner.accessed = Instant::now();
                    if let Some(done) = done.take() {
                        inner.waiters.push(done);
                    }
                    drop(inner);
                    self.issue_fetch(&entry, ptr.clone(), prefetch);
                    return Ok(ReadBegun::InFlight(entry));
                }
                other => {
                    drop(inner);
                    let err = EngineError::Invariant(format!(
                        "cached entry in state {other:?} with no payload and no I/O"
                    ));
                    if let Some(done) = done.take() {
                        done(Err(err.clone()));
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Hit-path state machine (entry locked, already unlinked).
    fn promote_on_hit(&self, entry: &Arc<CacheEntry>, inner: &mut EntryInner) {
        let now = Instant::now();
        match inner.state {
            CacheState::Anon => {
                self.change_state_locked(entry, inner, CacheState::Recent);
                inner.accessed = now;
                self.stats.recent_hits.fetch_add(1, Ordering::Relaxed);
            }
            CacheState::Recent => {
                if inner.prefetch {
                    // First demand hit on a prefetched block counts as
                    // the initial access.
                    inner.prefetch = false;
                    inner.accessed = now;
                } else if now.duration_since(inner.accessed) >= self.config.min_dwell {
                    self.change_state_locked(entry, inner, CacheState::Frequent);
                    inner.accessed = now;
                }
                self.stats.recent_hits.fetch_add(1, Ordering::Relaxed);
            }
            CacheState::Frequent => {
                if now.duration_since(inner.accessed) >= self.config.min_dwell {
                    inner.accessed = now;
                }
                self.stats.frequent_hits.fetch_add(1, Ordering::Relaxed);
            }
            CacheState::RecentGhost
            | CacheState::FrequentGhost
            | CacheState::SecondaryOnly => {
                // Payload-bearing hits never see these states.
                debug_assert!(false, "promote_on_hit in {:?}", inner.state);
            }
        }
    }

    /// Ghost-hit adaptation: nudge `p` toward the generation seeing
    /// re-references, scaled by the relative ghost sizes, at most 10×
    /// the hit block's size per event.
    fn adapt_on_ghost_hit(&self, ghost: CacheState, size: u64) {
        let recent_ghost = self.state_bytes(CacheState::RecentGhost).max(1);
        let frequent_ghost = self.state_bytes(CacheState::FrequentGhost).max(1);
        let target = self.target();
        let p = self.sizing.p.load(Ordering::Relaxed);
        let p_min = target >> self.config.p_min_shift;
        match ghost {
            CacheState::RecentGhost => {
                self.stats.recent_ghost_hits.fetch_add(1, Ordering::Relaxed);
                let mult = (frequent_ghost / recent_ghost).clamp(1, 10);
                let step = mult * size;
                self.sizing
                    .p
                    .store((p + step).min(target), Ordering::Relaxed);
            }
            CacheState::FrequentGhost => {
                self.stats
                    .frequent_ghost_hits
                    .fetch_add(1, Ordering::Relaxed);
                let mult = (recent_ghost / frequent_ghost).clamp(1, 10);
                let step = mult * size;
                self.sizing
                    .p
                    .store(p.saturating_sub(step).max(p_min), Ordering::Relaxed);
            }
            _ => {}
        }
    }

    // ── Fetch ───────────────────────────────────────────────────────────

    fn issue_fetch(self: &Arc<Self>, entry: &Arc<CacheEntry>, ptr: BlockPtr, prefetch: bool) {
        let class = if prefetch {
            IoClass::AsyncRead
        } else {
            IoClass::SyncRead
        };
        let flags = IoFlags {
            speculative: prefetch,
            ..IoFlags::default()
        };
        // A live secondary-cache shadow is tried first; failure of any
        // kind falls back to the primary pointer transparently.
        let shadow = l2::readable_shadow(self, entry);
        if let Some(shadow) = shadow {
            let cache = Arc::clone(self);
            let entry2 = Arc::clone(entry);
            let l2_ptr = l2::shadow_ptr(&shadow, ptr.lsize);
            self.engine.read(
                &l2_ptr,
                class,
                flags,
                Some(Box::new(move |io: &tp_io::BlockIo, err| {
                    if err.is_none() {
                        if let Some(bytes) = io.take_data() {
                            l2::note_hit(&cache);
                            cache.finish_fetch(&entry2, Ok(bytes));
                            return;
                        }
                    }
                    l2::note_failure(&cache, err);
                    let cache2 = Arc::clone(&cache);
                    let entry3 = Arc::clone(&entry2);
                    cache.engine.read(
                        &ptr,
                        class,
                        flags,
                        Some(Box::new(move |io: &tp_io::BlockIo, err| {
                            let result = match err {
                                Some(err) => Err(err.clone()),
                                None => io.take_data().ok_or_else(|| {
                                    EngineError::Invariant(
                                        "read completed without data".to_owned(),
                                    )
                                }),
                            };
                            cache2.finish_fetch(&entry3, result);
                        })),
                    );
                })),
            );
            return;
        }

        let cache = Arc::clone(self);
        let entry2 = Arc::clone(entry);
        self.engine.read(
            &ptr,
            class,
            flags,
            Some(Box::new(move |io: &tp_io::BlockIo, err| {
                let result = match err {
                    Some(err) => Err(err.clone()),
                    None => io.take_data().ok_or_else(|| {
                        EngineError::Invariant("read completed without data".to_owned())
                    }),
                };
                cache.finish_fetch(&entry2, result);
            })),
        );
    }

    fn finish_fetch(self: &Arc<Self>, entry: &Arc<CacheEntry>, result: Result<Vec<u8>>) {
        match result {
            Ok(bytes) => {
                let (waiters, payload) = {
                    let mut inner = entry.inner.lock();
                    let payload = Arc::new(bytes);
                    inner.data = Some(Arc::clone(&payload));
                    inner.frozen = Some(Checksum::of(&payload));
                    inner.io_in_progress = false;
                    if inner.state == CacheState::Anon {
                        self.change_state_locked(entry, &mut inner, CacheState::Recent);
                        inner.accessed = Instant::now();
                    }
                    let waiters = std::mem::take(&mut inner.waiters);
                    // One reference per delivered waiter buf.
                    inner.refs += u64::try_from(waiters.len()).expect("waiter count fits");
                    (waiters, payload)
                };
                entry.cv.notify_all();
                for waiter in waiters {
                    let buf = self.make_buf(entry, Arc::clone(&payload));
                    waiter(Ok(buf));
                }
            }
            Err(err) => {
                // Broadcast to every joined reader, then strip the entry
                // from the identity table so a retry refetches cleanly.
                self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "cache_fetch_failed");
                let waiters = {
                    let mut inner = entry.inner.lock();
                    inner.fetch_error = Some(err.clone());
                    inner.io_in_progress = false;
                    std::mem::take(&mut inner.waiters)
                };
                entry.cv.notify_all();
                for waiter in waiters {
                    waiter(Err(err.clone()));
                }
                self.invalidate(entry);
            }
        }
    }

    /// Remove a half-populated entry after a failed fetch: out of the
    /// hash table, back to `Anon`, gone once the last waiter lets go.
    fn invalidate(&self, entry: &Arc<CacheEntry>) {
        let identity = entry.inner.lock().identity;
        if let Some(identity) = identity {
            let shard = self.hash_shard(&identity);
            let mut map = self.hash[shard].lock();
            if map
                .get(&identity)
                .is_some_and(|cur| Arc::ptr_eq(cur, entry))
            {
                map.remove(&identity);
            }
            drop(map);
            let mut inner = entry.inner.lock();
            if inner.in_hash {
                inner.in_hash = false;
                self.unlink_locked(entry, &mut inner);
                self.fire_evict_callbacks(&mut inner);
                // Size accounting for this entry ends here; no buffers
                // were handed out, so no release path will run.
                self.sub_size(inner.state, entry.class, u64::from(entry.size));
                inner.state = CacheState::Anon;
            }
        }
    }

    fn fire_evict_callbacks(&self, inner: &mut EntryInner) {
        let identity = inner.identity;
        for (_, callback) in inner.evict_callbacks.drain(..) {
            callback(identity.as_ref());
        }
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Stage an anonymous buffer the caller fills before
    /// [`write_buf`](Self::write_buf).
    pub fn alloc_buf(self: &Arc<Self>, data: Vec<u8>, class: ContentClass) -> DataBuf {
        let size = u32::try_from(data.len()).expect("buffer fits u32");
        self.maybe_make_room(size, class);
        let entry = CacheEntry::new(size, class, None);
        let payload = Arc::new(data);
        {
            let mut inner = entry.inner.lock();
            inner.refs = 1;
            inner.data = Some(Arc::clone(&payload));
        }
        self.add_size(CacheState::Anon, class, u64::from(size));
        self.make_buf(&entry, payload)
    }

    /// Write an anonymous buffer through the pipeline. On completion the
    /// entry adopts the resulting identity, enters the hash table in
    /// `Recent`, and `done` receives the block pointer.
    pub fn write_buf(
        self: &Arc<Self>,
        buf: &DataBuf,
        props: WriteProps,
        txg: tp_types::Txg,
        class: IoClass,
        done: WriteDone,
    ) {
        let data = buf.payload.as_ref().clone();
        let cache = Arc::clone(self);
        let entry = Arc::clone(&buf.entry);
        self.engine.write(
            data,
            props,
            txg,
            class,
            None,
            Some(Box::new(move |io: &tp_io::BlockIo, err| {
                match err {
                    Some(err) => done(Err(err.clone())),
                    None => {
                        let ptr = io.result_ptr();
                        cache.adopt_written(&entry, &ptr);
                        done(Ok(ptr));
                    }
                }
            })),
        );
    }

    /// Adopt a freshly written pointer: assign identity, hash-insert,
    /// account from `Anon` into `Recent`.
    fn adopt_written(&self, entry: &Arc<CacheEntry>, ptr: &BlockPtr) {
        let Some(identity) = ptr.identity() else {
            return; // empty/hole writes stay anonymous
        };
        let shard = self.hash_shard(&identity);
        let mut map = self.hash[shard].lock();
        let mut inner = entry.inner.lock();
        // `data.is_none()` means the staging buffer was already released
        // and torn down; the write itself still succeeded.
        if inner.in_hash || inner.freed_in_flight || inner.data.is_none() {
            return;
        }
        if map.contains_key(&identity) {
            // Same content rewritten concurrently (dedup/nop-write): the
            // incumbent stays authoritative, this copy remains anonymous.
            return;
        }
        inner.identity = Some(identity);
        inner.in_hash = true;
        map.insert(identity, Arc::clone(entry));
        drop(map);
        self.change_state_locked(entry, &mut inner, CacheState::Recent);
        inner.accessed = Instant::now();
    }

    /// Private mutable copy for a second concurrent consumer.
    #[must_use]
    pub fn clone_buf(self: &Arc<Self>, buf: &DataBuf) -> DataBuf {
        let mut inner = buf.entry.inner.lock();
        inner.refs += 1;
        drop(inner);
        DataBuf {
            cache: Arc::clone(self),
            entry: Arc::clone(&buf.entry),
            payload: Arc::new(buf.payload.as_ref().clone()),
            id: self.buf_ids.fetch_add(1, Ordering::Relaxed),
            released: false,
        }
    }

    // ── Release / destroy ───────────────────────────────────────────────

    fn release_entry(self: &Arc<Self>, entry: &Arc<CacheEntry>) {
        let destroy = {
            let mut inner = entry.inner.lock();
            debug_assert!(inner.refs > 0, "release without reference");
            inner.refs = inner.refs.saturating_sub(1);
            if inner.refs > 0 {
                false
            } else if inner.freed_in_flight || !inner.in_hash {
                true
            } else if inner.io_in_progress {
                false
            } else {
                // Last reference: becomes evictable at the MRU end.
                let shard = self.list_shard_of(&inner);
                self.link_locked(entry, &mut inner, shard);
                false
            }
        };
        if destroy {
            self.destroy_entry(entry);
        }
    }

    /// Full teardown of an unreferenced entry (freed, invalidated, or
    /// anonymous-without-consumers).
    fn destroy_entry(&self, entry: &Arc<CacheEntry>) {
        let identity = entry.inner.lock().identity;
        if let Some(identity) = identity {
            let shard = self.hash_shard(&identity);
            let mut map = self.hash[shard].lock();
            let mut inner = entry.inner.lock();
            if inner.refs > 0 {
                return; // re-referenced while we got here
            }
            if inner.in_hash {
                if map
                    .get(&identity)
                    .is_some_and(|cur| Arc::ptr_eq(cur, entry))
                {
                    map.remove(&identity);
                }
                inner.in_hash = false;
            }
            drop(map);
            self.unlink_locked(entry, &mut inner);
            self.fire_evict_callbacks(&mut inner);
            self.sub_size(inner.state, entry.class, u64::from(entry.size));
            inner.data = None;
            if let Some(shadow) = inner.l2.take() {
                l2::forget_shadow(self, &shadow);
            }
        } else {
            let mut inner = entry.inner.lock();
            if inner.refs > 0 {
                return;
            }
            self.fire_evict_callbacks(&mut inner);
            self.sub_size(inner.state, entry.class, u64::from(entry.size));
            inner.data = None;
        }
    }

    /// The block behind `identity` was freed in the open txg: drop cache
    /// residency (now, or at last release if still referenced) and any
    /// secondary shadow.
    pub fn notify_freed(&self, identity: &BlockIdentity) {
        let Some(entry) = self.lookup(identity) else {
            return;
        };
        let destroy_now = {
            let mut inner = entry.inner.lock();
            inner.freed_in_flight = true;
            if let Some(shadow) = inner.l2.take() {
                l2::forget_shadow(self, &shadow);
            }
            inner.refs == 0 && !inner.io_in_progress
        };
        if destroy_now {
            self.destroy_entry(&entry);
        }
        debug!(partial = identity.partial, "cache_notify_freed");
    }

    // ── Eviction ────────────────────────────────────────────────────────

    /// Evict payload-bearing entries from one generation's class list
    /// until `bytes` have been reclaimed or candidates run out. With
    /// `recycle` set, a same-sized data payload is handed back instead
    /// of freed.
    fn evict_from(
        &self,
        state: CacheState,
        class: ContentClass,
        mut bytes: u64,
        recycle: Option<u32>,
    ) -> (u64, Option<Vec<u8>>) {
        let ghost = state.ghost_of();
        let shards = self.config.list_shards.max(1);
        let mut reclaimed = 0_u64;
        let mut recycled: Option<Vec<u8>> = None;
        let cursor = &self.evict_cursor[state.index()][class.index()];

        let mut rounds = 0_usize;
        while bytes > 0 && rounds < shards * 2 {
            rounds += 1;
            let shard_idx = usize::try_from(
                cursor.fetch_add(1, Ordering::Relaxed) % u64::try_from(shards).expect("fits"),
            )
            .expect("fits");

            // Bounded collection under the list lock; the entry lock is
            // only *tried* from here.
            let candidates: Vec<(u64, Arc<CacheEntry>)> = {
                let list = self.buckets[state.index()].lists[class.index()][shard_idx].lock();
                list.iter()
                    .take(self.config.evict_batch)
                    .filter(|(_, entry)| {
                        entry.inner.try_lock().is_some_and(|inner| {
                            inner.refs == 0 && !inner.io_in_progress && !inner.l2_writing
                        })
                    })
                    .map(|(seq, entry)| (*seq, Arc::clone(entry)))
                    .collect()
            };
            if candidates.is_empty() {
                continue;
            }

            for (seq, entry) in candidates {
                if bytes == 0 {
                    break;
                }
                let mut inner = entry.inner.lock();
                // Revalidate: the world may have moved between the
                // non-blocking probe and now.
                if inner.link != Some((shard_idx, seq))
                    || inner.refs != 0
                    || inner.io_in_progress
                    || inner.l2_writing
                    || inner.state != state
                {
                    continue;
                }
                self.unlink_locked(&entry, &mut inner);
                let payload = inner.data.take();
                self.fire_evict_callbacks(&mut inner);

                let next_state = if inner.l2.is_some() {
                    CacheState::SecondaryOnly
                } else {
                    ghost.expect("active states have ghosts")
                };
                self.change_state_locked(&entry, &mut inner, next_state);
                self.link_locked(&entry, &mut inner, shard_idx);
                drop(inner);

                self.primary_has_evicted.store(true, Ordering::Release);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                let entry_bytes = u64::from(entry.size);
                reclaimed += entry_bytes;
                bytes = bytes.saturating_sub(entry_bytes);

                if recycled.is_none()
                    && recycle == Some(entry.size)
                    && class == ContentClass::Data
                {
                    if let Some(payload) = payload {
                        if let Ok(vec) = Arc::try_unwrap(payload) {
                            self.stats.recycles.fetch_add(1, Ordering::Relaxed);
                            recycled = Some(vec);
                        }
                    }
                }
            }
        }
        (reclaimed, recycled)
    }

    /// Trim a ghost list: ghosts are identity-only, so trimming destroys
    /// the entry outright (hash removal included).
    fn trim_ghost(&self, state: CacheState, class: ContentClass, mut bytes: u64) -> u64 {
        let shards = self.config.list_shards.max(1);
        let mut reclaimed = 0_u64;
        let cursor = &self.evict_cursor[state.index()][class.index()];
        let mut rounds = 0_usize;
        while bytes > 0 && rounds < shards * 2 {
            rounds += 1;
            let shard_idx = usize::try_from(
                cursor.fetch_add(1, Ordering::Relaxed) % u64::try_from(shards).expect("fits"),
            )
            .expect("fits");
            let candidates: Vec<Arc<CacheEntry>> = {
                let list = self.buckets[state.index()].lists[class.index()][shard_idx].lock();
                list.iter()
                    .take(self.config.evict_batch)
                    .map(|(_, entry)| Arc::clone(entry))
                    .collect()
            };
            if candidates.is_empty() {
                continue;
            }
            for entry in candidates {
                if bytes == 0 {
                    break;
                }
                let still_ghost = {
                    let inner = entry.inner.lock();
                    inner.state == state && inner.refs == 0
                };
                if !still_ghost {
                    continue;
                }
                self.destroy_entry(&entry);
                self.stats.ghost_evictions.fetch_add(1, Ordering::Relaxed);
                let entry_bytes = u64::from(entry.size);
                reclaimed += entry_bytes;
                bytes = bytes.saturating_sub(entry_bytes);
            }
        }
        reclaimed
    }

    /// Inline room-making on insert: evict toward the generation over
    /// its share, trying to recycle an identically sized data buffer.
    fn maybe_make_room(&self, size: u32, class: ContentClass) {
        let target = self.target();
        let usage = self.usage();
        if usage + u64::from(size) <= target {
            return;
        }
        let p = self.recent_target();
        let from = if self.state_bytes(CacheState::Recent) >= p {
            CacheState::Recent
        } else {
            CacheState::Frequent
        };
        let want = u64::from(size);
        let (_, _recycled) = self.evict_from(from, class, want, Some(size));
        self.signal_reclaim();
    }

    /// Rebalance all six buckets against the current targets. Returns
    /// bytes reclaimed.
    pub fn balance(&self) -> u64 {
        let target = self.target();
        let p = self.recent_target();
        let mut reclaimed = 0_u64;

        let recent = self.state_bytes(CacheState::Recent);
        if recent > p {
            let mut over = recent - p;
            for class in ContentClass::ALL {
                let (got, _) = self.evict_from(CacheState::Recent, class, over, None);
                reclaimed += got;
                over = over.saturating_sub(got);
                if over == 0 {
                    break;
                }
            }
        }
        let frequent = self.state_bytes(CacheState::Frequent);
        let frequent_share = target.saturating_sub(p);
        if frequent > frequent_share {
            let mut over = frequent - frequent_share;
            for class in ContentClass::ALL {
                let (got, _) = self.evict_from(CacheState::Frequent, class, over, None);
                reclaimed += got;
                over = over.saturating_sub(got);
                if over == 0 {
                    break;
                }
            }
        }

        // Ghosts remember at most one target's worth of history each.
        let recent_now = self.state_bytes(CacheState::Recent);
        let rg_limit = target.saturating_sub(recent_now);
        let rg = self.state_bytes(CacheState::RecentGhost);
        if rg > rg_limit {
            let mut over = rg - rg_limit;
            for class in ContentClass::ALL {
                let got = self.trim_ghost(CacheState::RecentGhost, class, over);
                reclaimed += got;
                over = over.saturating_sub(got);
                if over == 0 {
                    break;
                }
            }
        }
        let fg = self.state_bytes(CacheState::FrequentGhost);
        let fg_limit = target.saturating_sub(self.state_bytes(CacheState::Frequent));
        if fg > fg_limit {
            let mut over = fg - fg_limit;
            for class in ContentClass::ALL {
                let got = self.trim_ghost(CacheState::FrequentGhost, class, over);
                reclaimed += got;
                over = over.saturating_sub(got);
                if over == 0 {
                    break;
                }
            }
        }
        reclaimed
    }

    // ── Reclaim loop ────────────────────────────────────────────────────

    /// One pass of the sizing control loop: shrink geometrically under
    /// pressure (suppressing growth for a while), grow under demand,
    /// then rebalance the buckets.
    pub fn reclaim_tick(&self) {
        if self.pressure.under_pressure() {
            let target = self.target();
            let step = target >> self.config.shrink_shift;
            let new_target = target.saturating_sub(step).max(self.config.min_size);
            self.sizing.target.store(new_target, Ordering::Relaxed);
            let p = self.sizing.p.load(Ordering::Relaxed);
            self.sizing
                .p
                .store(p.saturating_sub(p >> self.config.shrink_shift), Ordering::Relaxed);
            *self.sizing.grow_suppressed_until.lock() =
                Some(Instant::now() + self.config.grow_retry);
            self.stats.shrinks.fetch_add(1, Ordering::Relaxed);
            debug!(target = new_target, "cache_shrink");
        } else {
            let suppressed = self
                .sizing
                .grow_suppressed_until
                .lock()
                .is_some_and(|until| Instant::now() < until);
            let target = self.target();
            let usage = self.usage();
            if !suppressed && target < self.config.max_size && usage * 8 > target * 7 {
                let step = self.config.max_size >> 5;
                let new_target = (target + step).min(self.config.max_size);
                self.sizing.target.store(new_target, Ordering::Relaxed);
                self.stats.grows.fetch_add(1, Ordering::Relaxed);
                debug!(target = new_target, "cache_grow");
            }
        }
        self.balance();
    }

    /// Wake the reclaim thread out of its sleep.
    pub fn signal_reclaim(&self) {
        let mut signalled = self.reclaim_signal.lock();
        *signalled = true;
        self.reclaim_cv.notify_all();
    }

    fn reclaim_wait(&self, period: Duration) {
        let mut signalled = self.reclaim_signal.lock();
        if !*signalled {
            let _ = self.reclaim_cv.wait_for(&mut signalled, period);
        }
        *signalled = false;
    }

    /// Teardown: evict everything evictable and fire remaining
    /// callbacks. Referenced entries are left to their holders.
    pub fn evict_all(&self) {
        self.stopping.store(true, Ordering::Release);
        for state in [CacheState::Recent, CacheState::Frequent] {
            for class in ContentClass::ALL {
                let _ = self.evict_from(state, class, u64::MAX, None);
            }
        }
        for state in [
            CacheState::RecentGhost,
            CacheState::FrequentGhost,
            CacheState::SecondaryOnly,
        ] {
            for class in ContentClass::ALL {
                let _ = self.trim_ghost(state, class, u64::MAX);
            }
        }
        self.signal_reclaim();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

enum ReadBegun {
    Hit(DataBuf),
    InFlight(Arc<CacheEntry>),
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("target", &self.target())
            .field("usage", &self.usage())
            .finish_non_exhaustive()
    }
}

/// Handle for the background reclaim thread; stops and joins on drop.
pub struct ReclaimHandle {
    cache: Arc<BlockCache>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Drop for ReclaimHandle {
    fn drop(&mut self) {
        self.cache.stopping.store(true, Ordering::Release);
        self.cache.signal_reclaim();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Start the cache-sizing loop: roughly once per
/// [`CacheConfig::reclaim_interval`], or immediately on
/// [`BlockCache::signal_reclaim`].
#[must_use]
pub fn spawn_reclaim(cache: &Arc<BlockCache>) -> ReclaimHandle {
    let weak = Arc::downgrade(cache);
    let join = std::thread::Builder::new()
        .name("tp-cache-reclaim".to_owned())
        .spawn(move || reclaim_loop(&weak))
        .expect("spawn reclaim thread");
    ReclaimHandle {
        cache: Arc::clone(cache),
        join: Some(join),
    }
}

fn reclaim_loop(weak: &Weak<BlockCache>) {
    loop {
        let Some(cache) = weak.upgrade() else {
            return;
        };
        if cache.is_stopping() {
            return;
        }
        let period = cache.config.reclaim_interval;
        cache.reclaim_wait(period);
        if cache.is_stopping() {
            return;
        }
        cache.reclaim_tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tp_alloc::{Allocator, RegionAllocator};
    use tp_device::{Device, MemDevice};
    use tp_io::EngineConfig;
    use tp_types::{DeviceId, Txg};

    const DEV_LEN: usize = 32 << 20;

    fn small_cache(max_size: u64) -> (Arc<BlockCache>, Arc<Engine>) {
        let alloc = Arc::new(RegionAllocator::new(&[(DeviceId(1), 0, 32 << 20)]));
        let engine = Engine::new(EngineConfig::default(), alloc as Arc<dyn Allocator>);
        let dev = Arc::new(MemDevice::new(DEV_LEN));
        engine.attach_device(DeviceId(1), dev as Arc<dyn Device>);
        let config = CacheConfig {
            min_size: 8 << 10,
            max_size,
            min_dwell: Duration::from_millis(0),
            ..CacheConfig::default()
        };
        let cache = BlockCache::new(config, Arc::clone(&engine), Arc::new(NoPressure));
        (cache, engine)
    }

    fn put_block(engine: &Arc<Engine>, fill: u8, len: usize) -> BlockPtr {
        engine
            .write_sync(
                vec![fill; len],
                WriteProps {
                    compression: tp_types::CompressionKind::Off,
                    ..WriteProps::default()
                },
                Txg(1),
                IoClass::SyncWrite,
            )
            .expect("seed write")
    }

    #[test]
    fn miss_then_hit_promotes_to_recent() {
        let (cache, engine) = small_cache(64 << 20);
        let ptr = put_block(&engine, 0xAB, 4096);

        let buf = cache.read_sync(&ptr, ContentClass::Data).expect("miss fetch");
        assert_eq!(buf.bytes(), &[0xAB; 4096][..]);
        assert_eq!(buf.entry().state(), CacheState::Recent);
        assert_eq!(cache.stats().misses, 1);
        drop(buf);

        let buf2 = cache.read_sync(&ptr, ContentClass::Data).expect("hit");
        assert_eq!(cache.stats().hits, 1);
        // min_dwell is zero in this rig: the second access promotes.
        assert_eq!(buf2.entry().state(), CacheState::Frequent);
    }

    #[test]
    fn dwell_time_gates_promotion() {
        let (cache, engine) = small_cache(64 << 20);
        {
            // Rebuild with a long dwell so back-to-back hits stay Recent.
            let config = CacheConfig {
                min_dwell: Duration::from_secs(3600),
                ..cache.config().clone()
            };
            let cache = BlockCache::new(config, Arc::clone(&engine), Arc::new(NoPressure));
            let ptr = put_block(&engine, 0x11, 4096);
            let first = cache.read_sync(&ptr, ContentClass::Data).expect("miss");
            drop(first);
            let second = cache.read_sync(&ptr, ContentClass::Data).expect("hit");
            assert_eq!(
                second.entry().state(),
                CacheState::Recent,
                "no promotion before the dwell time elapses"
            );
        }
    }

    #[test]
    fn in_flight_readers_share_one_fetch() {
        let (cache, engine) = small_cache(64 << 20);
        let ptr = put_block(&engine, 0x5A, 8192);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let ptr = ptr.clone();
                std::thread::spawn(move || {
                    let buf = cache.read_sync(&ptr, ContentClass::Data).expect("read");
                    assert_eq!(buf.bytes()[0], 0x5A);
                })
            })
            .collect();
        for t in threads {
            t.join().expect("thread");
        }
        let stats = cache.stats();
        assert_eq!(stats.misses, 1, "exactly one fetch for one identity");
        assert_eq!(stats.hits + stats.in_flight_joins, 7);
    }

    #[test]
    fn release_links_and_eviction_demotes_to_ghost() {
        let (cache, engine) = small_cache(64 << 20);
        let ptr = put_block(&engine, 0x33, 4096);
        let buf = cache.read_sync(&ptr, ContentClass::Data).expect("read");
        let entry = Arc::clone(buf.entry());
        drop(buf);

        let (evicted, _) = cache.evict_from(CacheState::Recent, ContentClass::Data, u64::MAX, None);
        assert_eq!(evicted, 4096);
        assert_eq!(entry.state(), CacheState::RecentGhost);
        assert_eq!(cache.state_bytes(CacheState::Recent), 0);
        assert_eq!(cache.state_bytes(CacheState::RecentGhost), 4096);
        // Identity history is retained in the hash table.
        assert!(cache.lookup(&ptr.identity().expect("identity")).is_some());
    }

    #[test]
    fn ghost_hit_refetches_payload() {
        let (cache, engine) = small_cache(64 << 20);
        let ptr = put_block(&engine, 0x44, 4096);
        drop(cache.read_sync(&ptr, ContentClass::Data).expect("seed"));
        let _ = cache.evict_from(CacheState::Recent, ContentClass::Data, u64::MAX, None);
        let reads_before = cache.stats().misses;

        let buf = cache.read_sync(&ptr, ContentClass::Data).expect("ghost hit");
        assert_eq!(buf.bytes(), &[0x44; 4096][..]);
        assert_eq!(cache.stats().recent_ghost_hits, 1);
        assert_eq!(
            cache.stats().misses,
            reads_before,
            "ghost hit is not a plain miss"
        );
        assert_eq!(buf.entry().state(), CacheState::Recent);
    }

    #[test]
    fn ghost_hits_adapt_the_split_target() {
        let (cache, engine) = small_cache(64 << 20);
        let p_before = cache.recent_target();

        let ptr = put_block(&engine, 0x55, 4096);
        drop(cache.read_sync(&ptr, ContentClass::Data).expect("seed"));
        let _ = cache.evict_from(CacheState::Recent, ContentClass::Data, u64::MAX, None);
        drop(cache.read_sync(&ptr, ContentClass::Data).expect("ghost hit"));

        assert!(
            cache.recent_target() > p_before,
            "recent-ghost hit grows the recent share"
        );
    }

    #[test]
    fn referenced_entries_are_never_evicted() {
        let (cache, engine) = small_cache(64 << 20);
        let ptr = put_block(&engine, 0x66, 4096);
        let buf = cache.read_sync(&ptr, ContentClass::Data).expect("read");

        let (evicted, _) = cache.evict_from(CacheState::Recent, ContentClass::Data, u64::MAX, None);
        assert_eq!(evicted, 0, "entry with a live reference must stay");
        assert_eq!(buf.entry().state(), CacheState::Recent);
        drop(buf);
    }

    #[test]
    fn fetch_failure_broadcasts_and_invalidates() {
        let (cache, engine) = small_cache(64 << 20);
        let ptr = put_block(&engine, 0x77, 4096);
        // Corrupt the block so the fetch fails checksum verification.
        let addr = ptr.addrs[0];
        let dev = engine.device(addr.device).expect("device");
        dev.dev
            .write_at(addr.offset, &vec![0_u8; usize::try_from(addr.size).expect("fits")])
            .expect("scribble");

        let err = cache
            .read_sync(&ptr, ContentClass::Data)
            .expect_err("corrupt fetch");
        assert!(matches!(err, EngineError::ChecksumMismatch { .. }));
        assert!(
            cache.lookup(&ptr.identity().expect("identity")).is_none(),
            "failed entry must leave the hash table"
        );
        assert_eq!(cache.stats().fetch_failures, 1);
    }

    #[test]
    fn notify_freed_drops_residency() {
        let (cache, engine) = small_cache(64 << 20);
        let ptr = put_block(&engine, 0x88, 4096);
        drop(cache.read_sync(&ptr, ContentClass::Data).expect("read"));
        let identity = ptr.identity().expect("identity");
        assert!(cache.lookup(&identity).is_some());

        cache.notify_freed(&identity);
        assert!(cache.lookup(&identity).is_none());
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn eviction_callback_fires_exactly_once() {
        let (cache, engine) = small_cache(64 << 20);
        let ptr = put_block(&engine, 0x99, 4096);
        let fired = Arc::new(AtomicU64::new(0));
        {
            let buf = cache.read_sync(&ptr, ContentClass::Data).expect("read");
            let fired = Arc::clone(&fired);
            buf.set_eviction_callback(Box::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let _ = cache.evict_from(CacheState::Recent, ContentClass::Data, u64::MAX, None);
        cache.evict_all();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reclaim_shrinks_under_pressure_and_suppresses_growth() {
        let alloc = Arc::new(RegionAllocator::new(&[(DeviceId(1), 0, 32 << 20)]));
        let engine = Engine::new(EngineConfig::default(), alloc as Arc<dyn Allocator>);
        let dev = Arc::new(MemDevice::new(DEV_LEN));
        engine.attach_device(DeviceId(1), dev as Arc<dyn Device>);
        let pressure = Arc::new(SettablePressure::default());
        let config = CacheConfig {
            min_size: 1 << 20,
            max_size: 64 << 20,
            ..CacheConfig::default()
        };
        let cache = BlockCache::new(config, engine, Arc::clone(&pressure) as Arc<_>);

        let before = cache.target();
        pressure.set(true);
        cache.reclaim_tick();
        let shrunk = cache.target();
        assert!(shrunk < before, "pressure shrinks the target");
        assert_eq!(cache.stats().shrinks, 1);

        pressure.set(false);
        cache.reclaim_tick();
        assert_eq!(cache.target(), shrunk, "growth suppressed after a shrink");
        assert_eq!(cache.stats().grows, 0);
    }

    #[test]
    fn generation_totals_respect_targets_after_balance() {
        let (cache, engine) = small_cache(1 << 20);
        // Fill well past the 1 MiB max target with 64 KiB blocks.
        let mut ptrs = Vec::new();
        for i in 0..64_u8 {
            let ptr = put_block(&engine, i, 64 << 10);
            drop(cache.read_sync(&ptr, ContentClass::Data).expect("read"));
            ptrs.push(ptr);
        }
        cache.reclaim_tick();
        let target = cache.target();
        let p = cache.recent_target();
        assert!(
            cache.state_bytes(CacheState::Recent) <= p + (64 << 10),
            "recent within target plus one block of transient overshoot"
        );
        assert!(
            cache.state_bytes(CacheState::Frequent)
                <= target.saturating_sub(p) + (64 << 10)
        );
    }

    #[test]
    fn clone_buf_gives_private_copy() {
        let (cache, engine) = small_cache(64 << 20);
        let ptr = put_block(&engine, 0xAA, 4096);
        let buf = cache.read_sync(&ptr, ContentClass::Data).expect("read");
        let copy = cache.clone_buf(&buf);
        assert_eq!(buf.bytes(), copy.bytes());
        assert!(
            !Arc::ptr_eq(&buf.payload, &copy.payload),
            "clone must not share the payload allocation"
        );
        drop(copy);
        drop(buf);
    }

    #[test]
    fn async_read_delivers_callback() {
        let (cache, engine) = small_cache(64 << 20);
        let ptr = put_block(&engine, 0xBB, 4096);
        let (tx, rx) = std::sync::mpsc::channel();
        cache.read_async(
            &ptr,
            ContentClass::Metadata,
            false,
            Box::new(move |result| {
                let buf = result.expect("async read");
                tx.send(buf.bytes().to_vec()).expect("send");
            }),
        );
        let bytes = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("callback ran");
        assert_eq!(bytes, vec![0xBB; 4096]);
    }

    #[test]
    fn write_buf_enters_hash_in_recent() {
        let (cache, _engine) = small_cache(64 << 20);
        let buf = cache.alloc_buf(vec![0xCC_u8; 8192], ContentClass::Data);
        let (tx, rx) = std::sync::mpsc::channel();
        cache.write_buf(
            &buf,
            WriteProps {
                compression: tp_types::CompressionKind::Off,
                ..WriteProps::default()
            },
            Txg(2),
            IoClass::SyncWrite,
            Box::new(move |result| {
                tx.send(result).expect("send");
            }),
        );
        let ptr = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("write done")
            .expect("write ok");
        assert_eq!(ptr.birth, Txg(2));
        assert_eq!(buf.entry().state(), CacheState::Recent);
        let identity = ptr.identity().expect("identity");
        assert!(cache.lookup(&identity).is_some());

        // A read of the fresh identity is now a pure hit.
        drop(buf);
        let hit = cache.read_sync(&ptr, ContentClass::Data).expect("hit");
        assert_eq!(hit.bytes(), &[0xCC; 8192][..]);
        assert_eq!(cache.stats().misses, 0);
    }
}
