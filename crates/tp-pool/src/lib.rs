#![forbid(unsafe_code)]
//! Pool context: the one explicitly-constructed object tying the block
//! cache, the I/O pipeline, the device set, and the allocator together.
//!
//! Nothing in the engine is a process-wide singleton; everything reaches
//! shared state through an `Arc<Pool>`. The pool also carries the open
//! transaction group surrogate (the real txg machinery is an external
//! service — callers advance the number, the pool just scopes operations
//! to it) and the backend export surface protocol front-ends use to push
//! logical operations in and receive buffers back.

pub mod backend;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tp_alloc::Allocator;
use tp_cache::l2::FeedHandle;
use tp_cache::{
    BlockCache, CacheConfig, DataBuf, MemoryPressure, NoPressure, ReclaimHandle, WriteDone,
};
use tp_device::Device;
use tp_error::Result;
use tp_io::{Engine, EngineConfig, WriteProps};
use tp_types::{BlockPtr, ByteOffset, ContentClass, DeviceId, IoClass, Txg};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    pub engine: EngineConfig,
    pub cache: CacheConfig,
}

/// Aggregate diagnostic snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub engine: tp_io::EngineStatsSnapshot,
    pub cache: tp_cache::stats::CacheStatsSnapshot,
    pub secondary: tp_cache::stats::SecondaryCacheStatsSnapshot,
}

pub struct Pool {
    engine: Arc<Engine>,
    cache: Arc<BlockCache>,
    open_txg: AtomicU64,
    reclaim: Mutex<Option<ReclaimHandle>>,
    feed: Mutex<Option<FeedHandle>>,
}

impl Pool {
    #[must_use]
    pub fn new(config: PoolConfig, allocator: Arc<dyn Allocator>) -> Arc<Self> {
        Self::with_pressure(config, allocator, Arc::new(NoPressure))
    }

    #[must_use]
    pub fn with_pressure(
        config: PoolConfig,
        allocator: Arc<dyn Allocator>,
        pressure: Arc<dyn MemoryPressure>,
    ) -> Arc<Self> {
        let engine = Engine::new(config.engine, allocator);
        let cache = BlockCache::new(config.cache, Arc::clone(&engine), pressure);
        info!("pool_created");
        Arc::new(Self {
            engine,
            cache,
            open_txg: AtomicU64::new(1),
            reclaim: Mutex::new(None),
            feed: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    // ── Device management ───────────────────────────────────────────────

    /// Attach a primary leaf device.
    pub fn attach_device(&self, id: DeviceId, dev: Arc<dyn Device>) {
        self.engine.attach_device(id, dev);
    }

    /// Attach a secondary-cache device region.
    pub fn attach_secondary(
        &self,
        id: DeviceId,
        dev: Arc<dyn Device>,
        start: ByteOffset,
        len: u64,
    ) {
        self.engine.attach_device(id, dev);
        self.cache.secondary().attach(id, start, len);
    }

    /// Start the two long-lived background loops (cache sizing, feed).
    pub fn start_background(&self) {
        let mut reclaim = self.reclaim.lock();
        if reclaim.is_none() {
            *reclaim = Some(tp_cache::spawn_reclaim(&self.cache));
        }
        drop(reclaim);
        let mut feed = self.feed.lock();
        if feed.is_none() && self.cache.secondary().device_count() > 0 {
            *feed = Some(tp_cache::l2::spawn_feed(&self.cache));
        }
    }

    /// Stop background loops (joins both threads).
    pub fn stop_background(&self) {
        self.reclaim.lock().take();
        self.feed.lock().take();
    }

    // ── Transaction group surrogate ─────────────────────────────────────

    #[must_use]
    pub fn open_txg(&self) -> Txg {
        Txg(self.open_txg.load(Ordering::Acquire))
    }

    /// Advance the open txg (driven by the external commit machinery).
    pub fn set_open_txg(&self, txg: Txg) {
        self.open_txg.store(txg.0, Ordering::Release);
    }

    // ── Data path ───────────────────────────────────────────────────────

    /// Cached synchronous read.
    pub fn read(&self, ptr: &BlockPtr, class: ContentClass) -> Result<DataBuf> {
        self.cache.read_sync(ptr, class)
    }

    /// Cached asynchronous read.
    pub fn read_async(
        &self,
        ptr: &BlockPtr,
        class: ContentClass,
        prefetch: bool,
        done: tp_cache::ReadDone,
    ) {
        self.cache.read_async(ptr, class, prefetch, done);
    }

    /// Write through cache and pipeline in the open txg; synchronous.
    pub fn write(
        &self,
        data: Vec<u8>,
        class: ContentClass,
        props: WriteProps,
        io_class: IoClass,
    ) -> Result<BlockPtr> {
        let (tx, rx) = std::sync::mpsc::channel();
        let buf = self.cache.alloc_buf(data, class);
        self.cache.write_buf(
            &buf,
            props,
            self.open_txg(),
            io_class,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.recv()
            .map_err(|_| tp_error::EngineError::Protocol("write completion lost".to_owned()))?
    }

    /// Asynchronous write of a staged buffer.
    pub fn write_async(
        &self,
        buf: &DataBuf,
        props: WriteProps,
        io_class: IoClass,
        done: WriteDone,
    ) {
        self.cache
            .write_buf(buf, props, self.open_txg(), io_class, done);
    }

    /// Free a pointer in the open txg; the cache drops residency.
    pub fn free(&self, ptr: &BlockPtr) -> Result<()> {
        if let Some(identity) = ptr.identity() {
            self.cache.notify_freed(&identity);
        }
        self.engine.free_sync(ptr, self.open_txg())
    }

    /// Claim a pointer during replay.
    pub fn claim(&self, ptr: &BlockPtr) -> Result<()> {
        self.engine.claim_sync(ptr, self.open_txg())
    }

    /// Flush one device.
    pub fn flush(&self, device: DeviceId) -> Result<()> {
        self.engine.flush_sync(device)
    }

    // ── Pool control ────────────────────────────────────────────────────

    pub fn suspend(&self) {
        self.engine.suspend_pool();
    }

    pub fn resume(&self) {
        self.engine.resume();
    }

    pub fn fail_suspended(&self) {
        self.engine.fail_suspended();
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.engine.suspend.is_suspended()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            engine: self.engine.stats(),
            cache: self.cache.stats(),
            secondary: self.cache.secondary().stats(),
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("open_txg", &self.open_txg())
            .field("suspended", &self.is_suspended())
            .finish_non_exhaustive()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.stop_background();
        self.cache.evict_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tp_alloc::RegionAllocator;
    use tp_device::MemDevice;

    fn pool() -> Arc<Pool> {
        let alloc = Arc::new(RegionAllocator::new(&[(DeviceId(1), 0, 32 << 20)]));
        let pool = Pool::new(PoolConfig::default(), alloc as Arc<dyn Allocator>);
        pool.attach_device(DeviceId(1), Arc::new(MemDevice::new(32 << 20)));
        pool
    }

    #[test]
    fn write_read_free_cycle() {
        let pool = pool();
        let ptr = pool
            .write(
                vec![0xAB; 8192],
                ContentClass::Data,
                WriteProps::default(),
                IoClass::SyncWrite,
            )
            .expect("write");
        assert_eq!(ptr.birth, pool.open_txg());

        let buf = pool.read(&ptr, ContentClass::Data).expect("read");
        assert_eq!(buf.bytes(), &[0xAB; 8192][..]);
        drop(buf);

        pool.set_open_txg(Txg(2));
        pool.free(&ptr).expect("free");
        assert!(
            pool.cache()
                .lookup(&ptr.identity().expect("identity"))
                .is_none(),
            "freed identity must leave the cache"
        );
    }

    #[test]
    fn txg_advances_scope_writes() {
        let pool = pool();
        pool.set_open_txg(Txg(7));
        let ptr = pool
            .write(
                vec![1; 4096],
                ContentClass::Metadata,
                WriteProps::default(),
                IoClass::SyncWrite,
            )
            .expect("write");
        assert_eq!(ptr.birth, Txg(7));
    }

    #[test]
    fn background_threads_start_and_stop() {
        let pool = pool();
        pool.start_background();
        pool.start_background(); // idempotent
        pool.stop_background();
    }

    #[test]
    fn suspend_blocks_and_resume_releases() {
        let pool = pool();
        pool.suspend();
        assert!(pool.is_suspended());

        // A write issued while suspended defers at device start.
        let pool2 = Arc::clone(&pool);
        let writer = std::thread::spawn(move || {
            pool2.write(
                vec![9; 4096],
                ContentClass::Data,
                WriteProps::default(),
                IoClass::SyncWrite,
            )
        });
        // Give the writer time to reach the deferred list, then resume.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while pool.engine().suspend.deferred_count() == 0 {
            assert!(std::time::Instant::now() < deadline, "writer never deferred");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        pool.resume();
        let ptr = writer.join().expect("thread").expect("write resumes");
        let buf = pool.read(&ptr, ContentClass::Data).expect("read");
        assert_eq!(buf.bytes()[0], 9);
    }

    #[test]
    fn stats_snapshot_serializes() {
        let pool = pool();
        let _ = pool
            .write(
                vec![3; 4096],
                ContentClass::Data,
                WriteProps::default(),
                IoClass::SyncWrite,
            )
            .expect("write");
        let stats = pool.stats();
        assert_eq!(stats.engine.writes, 1);
        let json = serde_json::to_string(&stats).expect("stats serialize");
        assert!(json.contains("\"writes\":1"));
    }
}
