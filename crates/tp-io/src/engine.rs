//! Pipeline engine: stage handlers, device issue, suspend/resume.
//!
//! The engine is an explicitly-constructed context — devices, allocator,
//! dedup table, dirty accounting, worker pool, suspend state — passed by
//! `Arc` to everything that executes requests. There are no process-wide
//! singletons.
//!
//! # Execution model
//!
//! [`Engine::execute`] runs the request's current stage handler and, on
//! [`Flow::Continue`], advances to the next selected stage. A handler
//! that must wait returns [`Flow::Stop`] after registering interest
//! (child wait counters, the device queue, the suspend list); the
//! matching completion re-drives the request. Handlers that wait call
//! `wait_for_children` first, so a re-drive re-runs the same stage and
//! picks up where it left off. Device completions instead advance past
//! `DeviceStart` explicitly. No handler blocks a worker thread, and no
//! request lock is held across a handler body or a user callback.

use crate::dedup::{DedupPolicy, DedupRelease, DedupTable};
use crate::gang;
use crate::io::{
    BlockIo, ChildType, Flow, IoCallbacks, IoFlags, IoOp, Phase, PhysTarget, WriteProps,
};
use crate::stage::{self, IoStage, StageMask};
use crate::suspend::SuspendState;
use crate::taskq::TaskPool;
use crate::transform::{self, Transform};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tp_alloc::Allocator;
use tp_device::queue::{DeviceQueue, DirtyState, Direction, Issue, QueueConfig};
use tp_device::Device;
use tp_error::{EngineError, Result};
use tp_types::{
    BlockPtr, ByteOffset, Checksum, ChecksumKind, CompressionKind, DeviceId, IoClass, Txg,
    GANG_HEADER_SIZE,
};
use tracing::{debug, trace, warn};

/// What to do with a top-level request whose retry would fail the same
/// way: park it for operator resume, or surface the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Failmode {
    #[default]
    Wait,
    Continue,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pipeline worker threads.
    pub workers: usize,
    pub failmode: Failmode,
    pub dedup_policy: DedupPolicy,
    pub queue: QueueConfig,
    /// Dirty-data budget feeding the async-write throttle.
    pub dirty_budget: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            failmode: Failmode::Wait,
            dedup_policy: DedupPolicy::Trust,
            queue: QueueConfig::default(),
            dirty_budget: 64 << 20,
        }
    }
}

/// One attached leaf device plus its scheduler.
pub struct DeviceHandle {
    pub id: DeviceId,
    pub dev: Arc<dyn Device>,
    pub queue: DeviceQueue<BlockIo>,
}

#[derive(Debug, Default)]
pub struct EngineStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub frees: AtomicU64,
    pub claims: AtomicU64,
    pub nop_writes: AtomicU64,
    pub dedup_shared: AtomicU64,
    pub dedup_downgrades: AtomicU64,
    pub gang_writes: AtomicU64,
    pub gang_unwinds: AtomicU64,
    pub device_retries: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub parked: AtomicU64,
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub frees: u64,
    pub claims: u64,
    pub nop_writes: u64,
    pub dedup_shared: u64,
    pub dedup_downgrades: u64,
    pub gang_writes: u64,
    pub gang_unwinds: u64,
    pub device_retries: u64,
    pub checksum_errors: u64,
    pub parked: u64,
}

impl EngineStats {
    fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            claims: self.claims.load(Ordering::Relaxed),
            nop_writes: self.nop_writes.load(Ordering::Relaxed),
            dedup_shared: self.dedup_shared.load(Ordering::Relaxed),
            dedup_downgrades: self.dedup_downgrades.load(Ordering::Relaxed),
            gang_writes: self.gang_writes.load(Ordering::Relaxed),
            gang_unwinds: self.gang_unwinds.load(Ordering::Relaxed),
            device_retries: self.device_retries.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
        }
    }
}

pub struct Engine {
    devices: RwLock<HashMap<DeviceId, Arc<DeviceHandle>>>,
    pub allocator: Arc<dyn Allocator>,
    pub dedup: DedupTable,
    pub dirty: Arc<DirtyState>,
    pub suspend: SuspendState,
    taskq: TaskPool,
    config: EngineConfig,
    stats: EngineStats,
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig, allocator: Arc<dyn Allocator>) -> Arc<Self> {
        let dirty = Arc::new(DirtyState::new(config.dirty_budget));
        let taskq = TaskPool::new("tp-io", config.workers);
        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            allocator,
            dedup: DedupTable::new(),
            dirty: Arc::clone(&dirty),
            suspend: SuspendState::new(),
            taskq,
            config,
            stats: EngineStats::default(),
        })
    }

    pub fn attach_device(&self, id: DeviceId, dev: Arc<dyn Device>) {
        let handle = Arc::new(DeviceHandle {
            id,
            dev,
            queue: DeviceQueue::new(self.config.queue.clone(), Arc::clone(&self.dirty)),
        });
        debug!(device = id.0, "device_attached");
        self.devices.write().insert(id, handle);
    }

    pub fn device(&self, id: DeviceId) -> Result<Arc<DeviceHandle>> {
        self.devices
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::Protocol(format!("unknown device {id}")))
    }

    #[must_use]
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Request constructors ────────────────────────────────────────────

    fn async_pipeline(class: IoClass, base: StageMask) -> StageMask {
        if class.is_fifo() {
            base
        } else {
            base.with(IoStage::IssueAsync)
        }
    }

    /// Build a read request without driving it. Internal fan-out paths
    /// use this so the parent link exists before the child runs.
    fn make_read(
        &self,
        ptr: &BlockPtr,
        class: IoClass,
        flags: IoFlags,
        done: Option<crate::io::DoneFn>,
    ) -> Arc<BlockIo> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        BlockIo::new(
            IoOp::Read,
            class,
            ptr.birth,
            ptr.lsize,
            flags,
            WriteProps::default(),
            ptr.clone(),
            None,
            Self::async_pipeline(class, stage::read_pipeline()),
            IoCallbacks {
                ready: None,
                physdone: None,
                done,
            },
        )
    }

    /// Logical read of a block pointer. Executes immediately; pair with
    /// [`BlockIo::wait`] or a `done` callback.
    pub fn read(
        self: &Arc<Self>,
        ptr: &BlockPtr,
        class: IoClass,
        flags: IoFlags,
        done: Option<crate::io::DoneFn>,
    ) -> Arc<BlockIo> {
        let io = self.make_read(ptr, class, flags, done);
        self.execute(&io);
        io
    }

    /// Synchronous read convenience.
    pub fn read_sync(self: &Arc<Self>, ptr: &BlockPtr, class: IoClass) -> Result<Vec<u8>> {
        let io = self.read(ptr, class, IoFlags::default(), None);
        io.wait()?;
        io.take_data()
            .ok_or_else(|| EngineError::Invariant("read completed without data".to_owned()))
    }

    /// Logical write. The resulting pointer is available from the `ready`
    /// callback on, or from [`BlockIo::result_ptr`] after `wait`.
    pub fn write(
        self: &Arc<Self>,
        data: Vec<u8>,
        props: WriteProps,
        txg: Txg,
        class: IoClass,
        ready: Option<crate::io::ReadyFn>,
        done: Option<crate::io::DoneFn>,
    ) -> Arc<BlockIo> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let lsize = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let nop = props.old_ptr.is_some();
        let dedup = props.dedup;
        self.dirty.add(u64::from(lsize));
        let io = BlockIo::new(
            IoOp::Write,
            class,
            txg,
            lsize,
            IoFlags::default(),
            props,
            BlockPtr::hole(lsize),
            Some(data),
            Self::async_pipeline(class, stage::write_pipeline(nop, dedup)),
            IoCallbacks {
                ready,
                physdone: None,
                done,
            },
        );
        self.execute(&io);
        io
    }

    /// Synchronous write convenience.
    pub fn write_sync(
        self: &Arc<Self>,
        data: Vec<u8>,
        props: WriteProps,
        txg: Txg,
        class: IoClass,
    ) -> Result<BlockPtr> {
        let io = self.write(data, props, txg, class, None, None);
        io.wait()?;
        Ok(io.result_ptr())
    }

    fn make_free(&self, ptr: &BlockPtr, txg: Txg, flags: IoFlags) -> Arc<BlockIo> {
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
        BlockIo::new(
            IoOp::Free,
            IoClass::AsyncWrite,
            txg,
            ptr.lsize,
            flags,
            WriteProps::default(),
            ptr.clone(),
            None,
            stage::free_pipeline(),
            IoCallbacks::default(),
        )
    }

    /// Free the blocks behind a pointer (walks gang trees, honors dedup
    /// reference counts).
    pub fn free(self: &Arc<Self>, ptr: &BlockPtr, txg: Txg) -> Arc<BlockIo> {
        let io = self.make_free(ptr, txg, IoFlags::default());
        self.execute(&io);
        io
    }

    pub fn free_sync(self: &Arc<Self>, ptr: &BlockPtr, txg: Txg) -> Result<()> {
        self.free(ptr, txg).wait()
    }

    /// Claim a pointer during log replay.
    pub fn claim_sync(self: &Arc<Self>, ptr: &BlockPtr, txg: Txg) -> Result<()> {
        self.stats.claims.fetch_add(1, Ordering::Relaxed);
        let io = BlockIo::new(
            IoOp::Claim,
            IoClass::SyncWrite,
            txg,
            ptr.lsize,
            IoFlags::default(),
            WriteProps::default(),
            ptr.clone(),
            None,
            stage::claim_pipeline(),
            IoCallbacks::default(),
        );
        self.execute(&io);
        io.wait()
    }

    /// Flush barrier on one device.
    pub fn flush_sync(self: &Arc<Self>, device: DeviceId) -> Result<()> {
        let io = BlockIo::new(
            IoOp::Flush,
            IoClass::SyncWrite,
            Txg::NONE,
            0,
            IoFlags {
                dont_aggregate: true,
                ..IoFlags::default()
            },
            WriteProps::default(),
            BlockPtr::hole(0),
            None,
            stage::flush_pipeline(),
            IoCallbacks::default(),
        );
        io.state.lock().target = Some(PhysTarget {
            device,
            offset: ByteOffset::ZERO,
            psize: 0,
            direction: Direction::Flush,
        });
        self.execute(&io);
        io.wait()
    }

    /// Grouping-only root request. Children are attached with
    /// [`BlockIo::add_child`]; execute it after the children are linked.
    #[must_use]
    pub fn root(self: &Arc<Self>, flags: IoFlags) -> Arc<BlockIo> {
        BlockIo::new(
            IoOp::Null,
            IoClass::SyncWrite,
            Txg::NONE,
            0,
            flags,
            WriteProps::default(),
            BlockPtr::hole(0),
            None,
            stage::interlock_pipeline(),
            IoCallbacks::default(),
        )
    }

    /// Raw physical write at a fixed device offset (secondary-cache
    /// payloads). Bypasses allocation and transforms. With
    /// `best_effort`, failures reach the callback but never park the
    /// pool. Created suspended: link it, then [`execute`](Self::execute).
    pub fn phys_write(
        self: &Arc<Self>,
        device: DeviceId,
        offset: ByteOffset,
        payload: Vec<u8>,
        class: IoClass,
        best_effort: bool,
        done: Option<crate::io::DoneFn>,
    ) -> Arc<BlockIo> {
        let psize = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        let io = BlockIo::new(
            IoOp::Write,
            class,
            Txg::NONE,
            psize,
            IoFlags {
                raw: true,
                best_effort,
                ..IoFlags::default()
            },
            WriteProps {
                compression: CompressionKind::Off,
                ..WriteProps::default()
            },
            BlockPtr::hole(psize),
            None,
            Self::async_pipeline(class, stage::flush_pipeline()),
            IoCallbacks {
                ready: None,
                physdone: None,
                done,
            },
        );
        {
            let mut st = io.state.lock();
            st.pdata = Some(payload);
            st.target = Some(PhysTarget {
                device,
                offset,
                psize,
                direction: Direction::Write,
            });
        }
        io
    }

    // ── Execution ───────────────────────────────────────────────────────

    /// Drive a request until it stops or completes.
    pub fn execute(self: &Arc<Self>, io: &Arc<BlockIo>) {
        loop {
            let stage = io.state.lock().stage;
            trace!(op = ?io.op, stage = ?stage, "io_stage");
            match self.run_stage(io, stage) {
                Flow::Stop => return,
                Flow::Continue => {
                    let mut st = io.state.lock();
                    match st.pipeline.next_after(st.stage) {
                        Some(next) => st.stage = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Advance past the current stage, then continue executing. Device
    /// completions use this to step from `DeviceStart` to `DeviceDone`.
    pub(crate) fn reenter(self: &Arc<Self>, io: &Arc<BlockIo>) {
        {
            let mut st = io.state.lock();
            if let Some(next) = st.pipeline.next_after(st.stage) {
                st.stage = next;
            }
        }
        self.execute(io);
    }

    fn run_stage(self: &Arc<Self>, io: &Arc<BlockIo>, stage: IoStage) -> Flow {
        match stage {
            IoStage::Open | IoStage::DeviceDone => Flow::Continue,
            IoStage::ReadPtrInit => self.read_ptr_init(io),
            IoStage::WritePtrInit => Self::write_ptr_init(io),
            IoStage::FreePtrInit => Self::free_ptr_init(io),
            IoStage::IssueAsync => self.issue_async(io),
            IoStage::WriteCompress => Self::write_compress(io),
            IoStage::ChecksumGenerate => Self::checksum_generate(io),
            IoStage::NopWrite => self.nop_write(io),
            IoStage::DedupLookup => self.dedup_lookup(io),
            IoStage::DedupFree => self.dedup_free(io),
            IoStage::GangAssemble => self.gang_assemble(io),
            IoStage::GangIssue => self.gang_issue(io),
            IoStage::Allocate => self.allocate(io),
            IoStage::FreeBlocks => self.free_blocks(io),
            IoStage::Claim => self.claim_blocks(io),
            IoStage::Ready => self.ready_stage(io),
            IoStage::DeviceStart => self.device_start(io),
            IoStage::DeviceAssess => self.device_assess(io),
            IoStage::ChecksumVerify => self.checksum_verify(io),
            IoStage::Done => self.done_stage(io),
        }
    }

    // ── Init stages ─────────────────────────────────────────────────────

    fn read_ptr_init(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        let mut st = io.state.lock();
        let bp = st.bp.clone();

        // Holes and empty (all-zero) blocks have nothing on the device.
        if bp.addrs.is_empty() || bp.compression == CompressionKind::Empty {
            let lsize = usize::try_from(io.lsize).expect("lsize fits usize");
            st.data = Some(vec![0_u8; lsize]);
            st.pipeline = st
                .pipeline
                .without(IoStage::DeviceStart)
                .without(IoStage::DeviceDone)
                .without(IoStage::DeviceAssess)
                .without(IoStage::ChecksumVerify);
            return Flow::Continue;
        }

        if bp.is_gang() && !io.flags.raw {
            // The gang stages fan out per-constituent children; the
            // parent itself touches no device.
            let lsize = usize::try_from(io.lsize).expect("lsize fits usize");
            st.data = Some(vec![0_u8; lsize]);
            st.pipeline = st
                .pipeline
                .union(stage::gang_stages())
                .without(IoStage::DeviceStart)
                .without(IoStage::DeviceDone)
                .without(IoStage::DeviceAssess)
                .without(IoStage::ChecksumVerify);
            return Flow::Continue;
        }

        if bp.compression != CompressionKind::Off && !io.flags.raw {
            st.transforms.push(Transform::Decompress {
                kind: bp.compression,
                lsize: bp.lsize,
            });
        }
        let addr = bp.addrs[st.replica_index.min(bp.addrs.len() - 1)];
        st.target = Some(PhysTarget {
            device: addr.device,
            offset: addr.offset,
            psize: bp.psize,
            direction: Direction::Read,
        });
        Flow::Continue
    }

    fn write_ptr_init(io: &Arc<BlockIo>) -> Flow {
        let mut st = io.state.lock();
        let ok = st
            .data
            .as_ref()
            .is_some_and(|d| d.len() == usize::try_from(io.lsize).unwrap_or(usize::MAX));
        if !ok {
            st.error = Some(EngineError::Protocol(
                "write payload missing or size mismatch".to_owned(),
            ));
            let stripped = st
                .pipeline
                .without(IoStage::WriteCompress)
                .without(IoStage::ChecksumGenerate)
                .without(IoStage::NopWrite)
                .without(IoStage::DedupLookup)
                .without(IoStage::Allocate)
                .without(IoStage::DeviceStart)
                .without(IoStage::DeviceDone)
                .without(IoStage::DeviceAssess);
            st.pipeline = stripped;
        }
        st.bp.lsize = io.lsize;
        st.bp.dedup = io.props.dedup;
        Flow::Continue
    }

    fn free_ptr_init(io: &Arc<BlockIo>) -> Flow {
        let mut st = io.state.lock();
        if st.bp.is_hole() {
            st.pipeline = st
                .pipeline
                .without(IoStage::DedupFree)
                .without(IoStage::FreeBlocks)
                .without(IoStage::Claim);
            return Flow::Continue;
        }
        if st.bp.is_gang() {
            st.pipeline = st.pipeline.union(stage::gang_stages());
        }
        if st.bp.dedup && io.op == IoOp::Free {
            st.pipeline = st.pipeline.with(IoStage::DedupFree);
        }
        Flow::Continue
    }

    fn issue_async(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        let engine = Arc::clone(self);
        let io = Arc::clone(io);
        self.taskq.dispatch(move || engine.reenter(&io));
        Flow::Stop
    }

    // ── Write transform stages ──────────────────────────────────────────

    fn write_compress(io: &Arc<BlockIo>) -> Flow {
        let mut st = io.state.lock();
        if st.error.is_some() {
            return Flow::Continue;
        }
        let data = st.data.clone().expect("write payload present");
        if io.props.compression != CompressionKind::Off && transform::is_zeroes(&data) {
            // Nothing to store: the pointer alone reproduces the block.
            st.bp.compression = CompressionKind::Empty;
            st.bp.psize = 0;
            st.bp.checksum_kind = ChecksumKind::Off;
            st.bp.birth = io.txg;
            st.pipeline = st
                .pipeline
                .without(IoStage::ChecksumGenerate)
                .without(IoStage::NopWrite)
                .without(IoStage::DedupLookup)
                .without(IoStage::Allocate)
                .without(IoStage::DeviceStart)
                .without(IoStage::DeviceDone)
                .without(IoStage::DeviceAssess);
            return Flow::Continue;
        }
        match transform::compress(io.props.compression, &data) {
            Some(compressed) => {
                st.bp.compression = io.props.compression;
                st.bp.psize = u32::try_from(compressed.len()).expect("psize < lsize <= u32");
                st.pdata = Some(compressed);
            }
            None => {
                st.bp.compression = CompressionKind::Off;
                st.bp.psize = io.lsize;
                st.pdata = Some(data);
            }
        }
        Flow::Continue
    }

    fn checksum_generate(io: &Arc<BlockIo>) -> Flow {
        let mut st = io.state.lock();
        if st.error.is_some() {
            return Flow::Continue;
        }
        let pdata = st.pdata.as_deref().unwrap_or(&[]);
        st.bp.checksum = Checksum::of(pdata);
        st.bp.checksum_kind = ChecksumKind::Blake3;
        Flow::Continue
    }

    fn nop_write(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        let mut st = io.state.lock();
        if st.error.is_some() {
            return Flow::Continue;
        }
        let Some(old) = io.props.old_ptr.clone() else {
            return Flow::Continue;
        };
        let same = !old.is_hole()
            && old.checksum_kind == st.bp.checksum_kind
            && old.checksum == st.bp.checksum
            && old.compression == st.bp.compression
            && old.lsize == st.bp.lsize
            && !io.props.dedup;
        if same {
            // Content unchanged: keep the existing block, write nothing.
            st.bp = old;
            st.pipeline = st
                .pipeline
                .without(IoStage::Allocate)
                .without(IoStage::DeviceStart)
                .without(IoStage::DeviceDone)
                .without(IoStage::DeviceAssess);
            drop(st);
            self.stats.nop_writes.fetch_add(1, Ordering::Relaxed);
        }
        Flow::Continue
    }

    // ── Dedup stages ────────────────────────────────────────────────────

    fn dedup_lookup(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        if io.wait_for_children(ChildType::Dedup, Phase::Done) {
            return Flow::Stop;
        }
        let (spawned, checksum) = {
            let st = io.state.lock();
            if st.error.is_some() {
                return Flow::Continue;
            }
            (st.dedup_verify_spawned, st.bp.checksum)
        };

        if spawned {
            // Verify read finished: byte-compare against our payload.
            let (existing, ours) = {
                let mut st = io.state.lock();
                (st.dedup_verify_data.take(), st.data.clone())
            };
            let matches = match (existing, ours) {
                (Some(theirs), Some(mine)) => theirs == mine,
                _ => false,
            };
            if matches {
                if let Some(ptr) = self.dedup.add_ref(&checksum) {
                    return self.adopt_shared_ptr(io, ptr);
                }
            } else {
                self.stats.dedup_downgrades.fetch_add(1, Ordering::Relaxed);
            }
            io.state.lock().dedup_insert_on_done = true;
            return Flow::Continue;
        }

        let Some(existing) = self.dedup.lookup(&checksum) else {
            io.state.lock().dedup_insert_on_done = true;
            return Flow::Continue;
        };

        match self.config.dedup_policy {
            DedupPolicy::Trust => match self.dedup.add_ref(&checksum) {
                Some(ptr) => self.adopt_shared_ptr(io, ptr),
                None => {
                    // Lost the race to the last free; write normally.
                    io.state.lock().dedup_insert_on_done = true;
                    Flow::Continue
                }
            },
            DedupPolicy::Verify => {
                io.state.lock().dedup_verify_spawned = true;
                let parent = Arc::clone(io);
                let child = self.make_read(
                    &existing,
                    io.class,
                    IoFlags::default(),
                    Some(Box::new(move |child: &BlockIo, err| {
                        if err.is_none() {
                            parent.state.lock().dedup_verify_data = child.clone_data();
                        }
                    })),
                );
                BlockIo::add_child(io, &child, ChildType::Dedup);
                self.execute(&child);
                self.dedup_lookup(io)
            }
        }
    }

    fn adopt_shared_ptr(self: &Arc<Self>, io: &Arc<BlockIo>, ptr: BlockPtr) -> Flow {
        self.stats.dedup_shared.fetch_add(1, Ordering::Relaxed);
        let mut st = io.state.lock();
        let mut adopted = ptr;
        adopted.dedup = true;
        st.bp = adopted;
        st.pipeline = st
            .pipeline
            .without(IoStage::Allocate)
            .without(IoStage::DeviceStart)
            .without(IoStage::DeviceDone)
            .without(IoStage::DeviceAssess);
        Flow::Continue
    }

    fn dedup_free(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        let checksum = io.state.lock().bp.checksum;
        match self.dedup.release(&checksum) {
            DedupRelease::Shared(remaining) => {
                trace!(remaining, "dedup_free_shared");
                let mut st = io.state.lock();
                st.pipeline = st
                    .pipeline
                    .without(IoStage::GangAssemble)
                    .without(IoStage::GangIssue)
                    .without(IoStage::FreeBlocks);
                Flow::Continue
            }
            DedupRelease::LastReference(_) | DedupRelease::NotFound => Flow::Continue,
        }
    }

    // ── Gang stages ─────────────────────────────────────────────────────

    fn gang_assemble(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        if io.wait_for_children(ChildType::Gang, Phase::Done) {
            return Flow::Stop;
        }
        let requested = io.state.lock().gang_header_requested;
        if requested {
            return Flow::Continue; // header decoded (or error recorded)
        }
        io.state.lock().gang_header_requested = true;

        let (header_bp, class) = {
            let st = io.state.lock();
            let mut header_bp = st.bp.clone();
            header_bp.lsize = GANG_HEADER_SIZE;
            header_bp.psize = GANG_HEADER_SIZE;
            header_bp.compression = CompressionKind::Off;
            (header_bp, io.class)
        };
        let parent = Arc::clone(io);
        let child = BlockIo::new(
            IoOp::Read,
            class,
            header_bp.birth,
            GANG_HEADER_SIZE,
            IoFlags {
                raw: true,
                dont_aggregate: true,
                gang_child: true,
                ..IoFlags::default()
            },
            WriteProps::default(),
            header_bp,
            None,
            stage::read_pipeline(),
            IoCallbacks {
                ready: None,
                physdone: None,
                done: Some(Box::new(move |child: &BlockIo, err| {
                    if err.is_some() {
                        return; // error propagates via the child link
                    }
                    let Some(bytes) = child.clone_data() else {
                        parent.record_error(EngineError::Invariant(
                            "gang header read returned no data".to_owned(),
                        ));
                        return;
                    };
                    match gang::decode_header(&bytes) {
                        Ok(ptrs) => parent.state.lock().gang_child_ptrs = ptrs,
                        Err(err) => parent.record_error(err),
                    }
                })),
            },
        );
        BlockIo::add_child(io, &child, ChildType::Gang);
        self.execute(&child);
        self.gang_assemble(io)
    }

    fn gang_issue(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        if io.wait_for_children(ChildType::Gang, Phase::Done) {
            return Flow::Stop;
        }
        let spawned = io.state.lock().gang_children_spawned;
        if spawned {
            return Flow::Continue;
        }
        let (ptrs, has_error) = {
            let mut st = io.state.lock();
            st.gang_children_spawned = true;
            (st.gang_child_ptrs.clone(), st.error.is_some())
        };
        if has_error {
            return Flow::Continue;
        }

        match io.op {
            IoOp::Read => {
                let mut offset = 0_u32;
                let mut children = Vec::with_capacity(ptrs.len());
                for ptr in &ptrs {
                    let parent = Arc::clone(io);
                    let child_off = offset;
                    let child = self.make_read(
                        ptr,
                        io.class,
                        IoFlags {
                            gang_child: true,
                            ..IoFlags::default()
                        },
                        Some(Box::new(move |child: &BlockIo, err| {
                            if err.is_some() {
                                return;
                            }
                            let Some(bytes) = child.clone_data() else {
                                return;
                            };
                            let mut st = parent.state.lock();
                            if let Some(data) = st.data.as_mut() {
                                let start = usize::try_from(child_off).expect("offset fits");
                                let end = start + bytes.len();
                                if end <= data.len() {
                                    data[start..end].copy_from_slice(&bytes);
                                }
                            }
                        })),
                    );
                    BlockIo::add_child(io, &child, ChildType::Gang);
                    children.push(child);
                    offset += ptr.lsize;
                }
                for child in children {
                    self.execute(&child);
                }
            }
            IoOp::Free => {
                let mut children = Vec::with_capacity(ptrs.len());
                for ptr in &ptrs {
                    let child = self.make_free(
                        ptr,
                        io.txg,
                        IoFlags {
                            gang_child: true,
                            ..IoFlags::default()
                        },
                    );
                    BlockIo::add_child(io, &child, ChildType::Gang);
                    children.push(child);
                }
                for child in children {
                    self.execute(&child);
                }
            }
            IoOp::Claim => {
                for ptr in &ptrs {
                    let io_child = BlockIo::new(
                        IoOp::Claim,
                        io.class,
                        io.txg,
                        ptr.lsize,
                        IoFlags {
                            gang_child: true,
                            ..IoFlags::default()
                        },
                        WriteProps::default(),
                        ptr.clone(),
                        None,
                        stage::claim_pipeline(),
                        IoCallbacks::default(),
                    );
                    BlockIo::add_child(io, &io_child, ChildType::Gang);
                    self.execute(&io_child);
                }
            }
            IoOp::Write | IoOp::Flush | IoOp::Null => {}
        }
        self.gang_issue(io)
    }

    // ── Allocation stages ───────────────────────────────────────────────

    #[allow(clippy::too_many_lines)]
    fn allocate(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        if io.wait_for_children(ChildType::Gang, Phase::Done) {
            return Flow::Stop;
        }
        let (spawned, has_error, unwound) = {
            let st = io.state.lock();
            (
                st.gang_children_spawned,
                st.error.is_some(),
                st.gang_unwound,
            )
        };

        if spawned {
            if has_error {
                if !unwound {
                    return self.gang_unwind(io);
                }
                let mut st = io.state.lock();
                st.pipeline = st
                    .pipeline
                    .without(IoStage::DeviceStart)
                    .without(IoStage::DeviceDone)
                    .without(IoStage::DeviceAssess);
                return Flow::Continue;
            }
            return Self::gang_finalize(io);
        }

        // Plain allocation.
        let (psize, copies) = {
            let st = io.state.lock();
            if st.error.is_some() {
                return Flow::Continue;
            }
            (st.bp.psize, io.props.copies)
        };
        let asize = match transform::allocation_size(psize) {
            Ok(asize) => asize,
            Err(err) => {
                io.record_error(err);
                return Flow::Continue;
            }
        };
        match self.allocator.allocate(asize, copies, io.txg) {
            Ok(addrs) => {
                let mut st = io.state.lock();
                st.bp.addrs = addrs;
                st.bp.birth = io.txg;
                if st.bp.addrs.len() == 1 {
                    st.target = Some(PhysTarget {
                        device: st.bp.addrs[0].device,
                        offset: st.bp.addrs[0].offset,
                        psize,
                        direction: Direction::Write,
                    });
                }
                Flow::Continue
            }
            Err(EngineError::NoSpace) => self.gang_split(io),
            Err(err) => {
                io.record_error(err);
                let mut st = io.state.lock();
                st.pipeline = st
                    .pipeline
                    .without(IoStage::DeviceStart)
                    .without(IoStage::DeviceDone)
                    .without(IoStage::DeviceAssess);
                Flow::Continue
            }
        }
    }

    /// Split a write that cannot be allocated contiguously into a header
    /// plus children. Children recurse through their own pipelines, so a
    /// child that still does not fit gangs again.
    fn gang_split(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        let sizes = gang::split_sizes(io.lsize);
        if sizes.len() <= 1 {
            // Cannot split further; surface the exhaustion.
            io.record_error(EngineError::NoSpace);
            let mut st = io.state.lock();
            st.pipeline = st
                .pipeline
                .without(IoStage::DeviceStart)
                .without(IoStage::DeviceDone)
                .without(IoStage::DeviceAssess);
            return Flow::Continue;
        }
        let header_addrs = match self
            .allocator
            .allocate(GANG_HEADER_SIZE, io.props.copies, io.txg)
        {
            Ok(mut addrs) => {
                for addr in &mut addrs {
                    addr.gang = true;
                }
                addrs
            }
            Err(err) => {
                io.record_error(err);
                let mut st = io.state.lock();
                st.pipeline = st
                    .pipeline
                    .without(IoStage::DeviceStart)
                    .without(IoStage::DeviceDone)
                    .without(IoStage::DeviceAssess);
                return Flow::Continue;
            }
        };
        self.stats.gang_writes.fetch_add(1, Ordering::Relaxed);

        let data = io
            .state
            .lock()
            .data
            .clone()
            .expect("write payload present");
        {
            let mut st = io.state.lock();
            st.gang_children_spawned = true;
            st.gang_results = vec![None; sizes.len()];
            st.gang_header_addrs = header_addrs;
        }
        debug!(lsize = io.lsize, children = sizes.len(), "gang_split");

        let mut start = 0_usize;
        for (slot, size) in sizes.iter().enumerate() {
            let len = usize::try_from(*size).expect("chunk fits usize");
            let chunk = data[start..start + len].to_vec();
            start += len;
            let parent = Arc::clone(io);
            let child = BlockIo::new(
                IoOp::Write,
                io.class,
                io.txg,
                *size,
                IoFlags {
                    gang_child: true,
                    ..IoFlags::default()
                },
                WriteProps {
                    compression: io.props.compression,
                    dedup: false,
                    copies: io.props.copies,
                    old_ptr: None,
                },
                BlockPtr::hole(*size),
                Some(chunk),
                stage::write_pipeline(false, false),
                IoCallbacks {
                    ready: None,
                    physdone: None,
                    done: Some(Box::new(move |child: &BlockIo, err| {
                        let ptr = child.result_ptr();
                        let mut st = parent.state.lock();
                        if err.is_none() {
                            st.gang_results[slot] = Some(ptr);
                        } else if !ptr.addrs.is_empty() {
                            // Allocated, then failed: the unwind frees it.
                            st.gang_failed.push(ptr);
                        }
                    })),
                },
            );
            BlockIo::add_child(io, &child, ChildType::Gang);
            self.execute(&child);
        }
        self.allocate(io)
    }

    /// All gang children wrote successfully: build and stage the header.
    fn gang_finalize(io: &Arc<BlockIo>) -> Flow {
        let mut st = io.state.lock();
        let children: Option<Vec<BlockPtr>> = st.gang_results.iter().cloned().collect();
        let Some(children) = children else {
            st.error = Some(EngineError::Invariant(
                "gang child completed without a result pointer".to_owned(),
            ));
            st.pipeline = st
                .pipeline
                .without(IoStage::DeviceStart)
                .without(IoStage::DeviceDone)
                .without(IoStage::DeviceAssess);
            return Flow::Continue;
        };
        match gang::encode_header(&children) {
            Ok(header) => {
                st.bp.addrs = st.gang_header_addrs.clone();
                st.bp.psize = GANG_HEADER_SIZE;
                st.bp.compression = CompressionKind::Off;
                st.bp.checksum = Checksum::of(&header);
                st.bp.checksum_kind = ChecksumKind::Blake3;
                st.bp.birth = io.txg;
                // Single replica writes directly; multiple header copies
                // fan out as raw device children at device-start.
                if st.bp.addrs.len() == 1 {
                    let addr = st.bp.addrs[0];
                    st.target = Some(PhysTarget {
                        device: addr.device,
                        offset: addr.offset,
                        psize: GANG_HEADER_SIZE,
                        direction: Direction::Write,
                    });
                }
                st.pdata = Some(header);
                Flow::Continue
            }
            Err(err) => {
                st.error = Some(err);
                st.pipeline = st
                    .pipeline
                    .without(IoStage::DeviceStart)
                    .without(IoStage::DeviceDone)
                    .without(IoStage::DeviceAssess);
                Flow::Continue
            }
        }
    }

    /// A gang child failed: free everything the successful children
    /// allocated (recursively, via free pipelines) plus the header, so a
    /// retried write cannot leak space.
    fn gang_unwind(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        self.stats.gang_unwinds.fetch_add(1, Ordering::Relaxed);
        let (results, failed, header_addrs) = {
            let mut st = io.state.lock();
            st.gang_unwound = true;
            (
                st.gang_results.clone(),
                std::mem::take(&mut st.gang_failed),
                std::mem::take(&mut st.gang_header_addrs),
            )
        };
        warn!(
            children = results.iter().filter(|r| r.is_some()).count(),
            failed = failed.len(),
            "gang_unwind"
        );
        for addr in header_addrs {
            if let Err(err) = self.allocator.free(addr, io.txg) {
                io.record_error(err);
            }
        }
        // Failed children never produced a readable tree; their extents
        // go straight back to the allocator.
        for bp in failed {
            for addr in bp.addrs {
                if let Err(err) = self.allocator.free(addr, io.txg) {
                    io.record_error(err);
                }
            }
        }
        let mut children = Vec::new();
        for bp in results.into_iter().flatten() {
            let child = self.make_free(
                &bp,
                io.txg,
                IoFlags {
                    gang_child: true,
                    ..IoFlags::default()
                },
            );
            BlockIo::add_child(io, &child, ChildType::Gang);
            children.push(child);
        }
        for child in children {
            self.execute(&child);
        }
        self.allocate(io)
    }

    fn free_blocks(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        let (addrs, has_error) = {
            let st = io.state.lock();
            (st.bp.addrs.clone(), st.error.is_some())
        };
        if has_error {
            return Flow::Continue;
        }
        for addr in addrs {
            if let Err(err) = self.allocator.free(addr, io.txg) {
                io.record_error(err);
            }
        }
        Flow::Continue
    }

    fn claim_blocks(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        let (addrs, has_error) = {
            let st = io.state.lock();
            (st.bp.addrs.clone(), st.error.is_some())
        };
        if has_error {
            return Flow::Continue;
        }
        for addr in addrs {
            if let Err(err) = self.allocator.claim(addr, io.txg) {
                io.record_error(err);
            }
        }
        Flow::Continue
    }

    // ── Interlock stages ────────────────────────────────────────────────

    fn ready_stage(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        let (cb, parents) = {
            let mut st = io.state.lock();
            if st.ready_fired {
                return Flow::Continue;
            }
            st.ready_fired = true;
            (st.callbacks.ready.take(), st.parents.clone())
        };
        if let Some(cb) = cb {
            cb(io);
        }
        for (weak, ty) in parents {
            if let Some(parent) = weak.upgrade() {
                if parent.notify(ty, Phase::Ready) {
                    self.execute(&parent);
                }
            }
        }
        Flow::Continue
    }

    // ── Device stages ───────────────────────────────────────────────────

    fn device_start(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        if io.wait_for_children(ChildType::Device, Phase::Done) {
            return Flow::Stop;
        }
        let (has_error, fanout_done, needs_fanout) = {
            let st = io.state.lock();
            let needs_fanout =
                io.op == IoOp::Write && st.bp.addrs.len() > 1 && st.target.is_none();
            (st.error.is_some(), st.replica_fanout_spawned, needs_fanout)
        };
        if has_error || fanout_done {
            return Flow::Continue;
        }
        if self.suspend.is_suspended() && !io.flags.godfather {
            self.suspend.defer(Arc::clone(io));
            return Flow::Stop;
        }

        if needs_fanout {
            return self.replica_fanout(io);
        }

        let target = {
            let mut st = io.state.lock();
            if st.target.is_none() && io.op == IoOp::Read {
                let idx = st.replica_index.min(st.bp.addrs.len().saturating_sub(1));
                let addr = st.bp.addrs[idx];
                let psize = st.bp.psize;
                st.target = Some(PhysTarget {
                    device: addr.device,
                    offset: addr.offset,
                    psize,
                    direction: Direction::Read,
                });
            }
            st.target
        };
        let Some(target) = target else {
            io.record_error(EngineError::Invariant(
                "device start without a physical target".to_owned(),
            ));
            return Flow::Continue;
        };
        let handle = match self.device(target.device) {
            Ok(handle) => handle,
            Err(err) => {
                io.record_error(err);
                return Flow::Continue;
            }
        };
        let issues = handle.queue.enqueue(Arc::clone(io));
        if !issues.is_empty() {
            let engine = Arc::clone(self);
            self.taskq
                .dispatch(move || engine.run_issues(&handle, issues));
        }
        Flow::Stop
    }

    /// Multi-replica write: one raw device child per address.
    fn replica_fanout(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        let (addrs, payload) = {
            let mut st = io.state.lock();
            st.replica_fanout_spawned = true;
            (
                st.bp.addrs.clone(),
                st.pdata.clone().expect("write payload staged"),
            )
        };
        for addr in addrs {
            let child = self.phys_write(
                addr.device,
                addr.offset,
                payload.clone(),
                io.class,
                false,
                None,
            );
            BlockIo::add_child(io, &child, ChildType::Device);
            self.execute(&child);
        }
        self.device_start(io)
    }

    fn device_assess(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        let retry_target = {
            let mut st = io.state.lock();
            match st.phys_error.take() {
                None => None,
                Some(err) if err.is_retryable() && !st.retried => {
                    st.retried = true;
                    if io.op == IoOp::Read && st.replica_index + 1 < st.bp.addrs.len() {
                        st.replica_index += 1;
                        let addr = st.bp.addrs[st.replica_index];
                        if let Some(target) = st.target.as_mut() {
                            target.device = addr.device;
                            target.offset = addr.offset;
                        }
                    }
                    // Rewind so the next advance lands on DeviceStart.
                    st.stage = IoStage::Ready;
                    Some(())
                }
                Some(err) => {
                    st.error = Some(match st.error.take() {
                        Some(existing) => existing.worst(err),
                        None => err,
                    });
                    None
                }
            }
        };
        if retry_target.is_some() {
            self.stats.device_retries.fetch_add(1, Ordering::Relaxed);
            io.mark_retry();
            trace!(op = ?io.op, "device_retry");
            return Flow::Continue;
        }
        let cb = io.state.lock().callbacks.physdone.take();
        if let Some(cb) = cb {
            let err = io.error();
            cb(io, err.as_ref());
        }
        Flow::Continue
    }

    fn checksum_verify(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        let (pdata, bp, transforms, has_error) = {
            let mut st = io.state.lock();
            (
                st.pdata.take(),
                st.bp.clone(),
                std::mem::take(&mut st.transforms),
                st.error.is_some(),
            )
        };
        if has_error || io.op != IoOp::Read {
            return Flow::Continue;
        }
        let Some(pdata) = pdata else {
            return Flow::Continue; // hole/empty path filled data already
        };
        if bp.checksum_kind == ChecksumKind::Blake3 {
            let actual = Checksum::of(&pdata);
            if actual != bp.checksum {
                self.stats.checksum_errors.fetch_add(1, Ordering::Relaxed);
                // An unread replica may still hold good data: rewind for
                // one pass per remaining address before giving up.
                let mut st = io.state.lock();
                if st.replica_index + 1 < st.bp.addrs.len() {
                    st.replica_index += 1;
                    let addr = st.bp.addrs[st.replica_index];
                    if let Some(target) = st.target.as_mut() {
                        target.device = addr.device;
                        target.offset = addr.offset;
                    }
                    st.transforms = transforms;
                    st.stage = IoStage::Ready;
                    warn!(replica = st.replica_index, "checksum_replica_fallback");
                    return Flow::Continue;
                }
                drop(st);
                let addr = bp.addrs.first().copied();
                io.record_error(EngineError::ChecksumMismatch {
                    device: addr.map_or(0, |a| a.device.0),
                    offset: addr.map_or(0, |a| a.offset.0),
                    expected: bp.checksum.partial(),
                    actual: actual.partial(),
                });
                return Flow::Continue;
            }
        }
        match transform::apply_read_transforms(&transforms, pdata) {
            Ok(data) => io.state.lock().data = Some(data),
            Err(err) => io.record_error(err),
        }
        Flow::Continue
    }

    // ── Completion ──────────────────────────────────────────────────────

    fn done_stage(self: &Arc<Self>, io: &Arc<BlockIo>) -> Flow {
        for ty in [
            ChildType::Logical,
            ChildType::Gang,
            ChildType::Dedup,
            ChildType::Device,
        ] {
            if io.wait_for_children(ty, Phase::Done) {
                return Flow::Stop;
            }
        }

        // Ready always precedes done, even for requests that erred before
        // reaching their ready stage organically.
        let fire_ready = !io.state.lock().ready_fired;
        if fire_ready {
            let _ = self.ready_stage(io);
        }

        let (error, parents, insert_dedup, bp, park_exempt) = {
            let st = io.state.lock();
            (
                st.error.clone(),
                st.parents.clone(),
                st.dedup_insert_on_done,
                st.bp.clone(),
                st.park_exempt,
            )
        };

        // Park a top-level failure that a retry would repeat, instead of
        // completing it. Godfather parents disown the request first so
        // they can complete independently.
        if let Some(err) = &error {
            let strong_parents: Vec<(Arc<BlockIo>, ChildType)> = parents
                .iter()
                .filter_map(|(w, ty)| w.upgrade().map(|p| (p, *ty)))
                .collect();
            let only_godfathers = strong_parents.iter().all(|(p, _)| p.flags.godfather);
            if self.config.failmode == Failmode::Wait
                && err.is_retryable()
                && !io.flags.godfather
                && !io.flags.best_effort
                && !park_exempt
                && only_godfathers
            {
                for (parent, ty) in &strong_parents {
                    Self::unlink_child(parent, io);
                    if parent.notify(*ty, Phase::Done) {
                        self.execute(parent);
                    }
                }
                io.state.lock().parents.clear();
                io.state.lock().parked = true;
                self.stats.parked.fetch_add(1, Ordering::Relaxed);
                self.suspend.park(Arc::clone(io));
                return Flow::Stop;
            }
        }

        if error.is_none() && insert_dedup && io.op == IoOp::Write {
            self.dedup.insert(bp.checksum, bp.clone());
        }
        // Dirty accounting pairs with the top-level `write` entry point;
        // internal children (gang constituents, raw replicas) never added.
        if io.op == IoOp::Write && !io.flags.raw && !io.flags.gang_child {
            self.dirty.sub(u64::from(io.lsize));
        }

        let done_cb = io.state.lock().callbacks.done.take();
        if let Some(cb) = done_cb {
            cb(io, error.as_ref());
        }

        for (weak, ty) in parents {
            let Some(parent) = weak.upgrade() else {
                continue;
            };
            if let Some(err) = &error {
                parent.record_error(err.clone());
            }
            Self::unlink_child(&parent, io);
            if parent.notify(ty, Phase::Done) {
                self.execute(&parent);
            }
        }
        io.state.lock().parents.clear();
        io.mark_completed();
        Flow::Stop
    }

    fn unlink_child(parent: &Arc<BlockIo>, child: &Arc<BlockIo>) {
        let mut st = parent.state.lock();
        if let Some(pos) = st.children.iter().position(|c| Arc::ptr_eq(c, child)) {
            st.children.remove(pos);
            drop(st);
            parent.children_removed.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ── Physical issue ──────────────────────────────────────────────────

    /// Perform issued operations and feed completions back through the
    /// queue until it stops handing out work.
    fn run_issues(self: &Arc<Self>, handle: &Arc<DeviceHandle>, issues: Vec<Issue<BlockIo>>) {
        let mut work = issues;
        while let Some(issue) = work.pop() {
            self.perform(handle, &issue);
            work.extend(handle.queue.complete(&issue));
            for part in &issue.parts {
                self.reenter(&part.item);
            }
        }
    }

    fn perform(&self, handle: &Arc<DeviceHandle>, issue: &Issue<BlockIo>) {
        let span = usize::try_from(issue.span).unwrap_or(usize::MAX);
        match issue.direction {
            Direction::Read => {
                let mut buf = vec![0_u8; span];
                match handle.dev.read_at(issue.offset, &mut buf) {
                    Ok(()) => {
                        for part in &issue.parts {
                            let rel = usize::try_from(part.offset.0 - issue.offset.0)
                                .expect("part inside span");
                            let len = {
                                let st = part.item.state.lock();
                                st.target.map_or(0, |t| t.psize)
                            };
                            let len = usize::try_from(len).expect("psize fits usize");
                            part.item.state.lock().pdata =
                                Some(buf[rel..rel + len].to_vec());
                        }
                    }
                    Err(err) => {
                        for part in &issue.parts {
                            part.item.state.lock().phys_error = Some(err.clone());
                        }
                    }
                }
            }
            Direction::Write => {
                let mut buf = vec![0_u8; span];
                for part in &issue.parts {
                    let rel = usize::try_from(part.offset.0 - issue.offset.0)
                        .expect("part inside span");
                    let payload = part.item.state.lock().pdata.clone();
                    if let Some(payload) = payload {
                        buf[rel..rel + payload.len()].copy_from_slice(&payload);
                    }
                }
                if let Err(err) = handle.dev.write_at(issue.offset, &buf) {
                    for part in &issue.parts {
                        part.item.state.lock().phys_error = Some(err.clone());
                    }
                }
            }
            Direction::Flush => {
                if let Err(err) = handle.dev.flush() {
                    for part in &issue.parts {
                        part.item.state.lock().phys_error = Some(err.clone());
                    }
                }
            }
            Direction::Discard => {
                if let Err(err) = handle.dev.discard(issue.offset, issue.span) {
                    for part in &issue.parts {
                        part.item.state.lock().phys_error = Some(err.clone());
                    }
                }
            }
        }
    }

    // ── Suspend / resume ────────────────────────────────────────────────

    /// Stop issuing physical I/O pool-wide.
    pub fn suspend_pool(&self) {
        self.suspend.suspend();
    }

    /// Re-drive parked trees from their origin and release deferred
    /// device issues.
    pub fn resume(self: &Arc<Self>) {
        let (parked, deferred) = self.suspend.resume();
        for io in parked {
            self.reset_for_reexecute(&io);
            self.execute(&io);
        }
        for io in deferred {
            self.execute(&io);
        }
    }

    /// Abandon parked trees with a `Suspended` error instead of retrying.
    pub fn fail_suspended(self: &Arc<Self>) {
        let (parked, deferred) = self.suspend.resume();
        for io in parked.into_iter().chain(deferred) {
            {
                let mut st = io.state.lock();
                st.park_exempt = true;
                st.error = Some(EngineError::Suspended);
                st.stage = IoStage::Done;
            }
            self.execute(&io);
        }
    }

    /// Rewind a parked request to its origin so re-execution retries the
    /// whole tree. Extents allocated by the failed attempt in our own
    /// txg are returned first so the retry cannot leak space.
    fn reset_for_reexecute(&self, io: &Arc<BlockIo>) {
        let mut st = io.state.lock();
        if io.op == IoOp::Write && !io.flags.raw && st.bp.birth == io.txg {
            for addr in std::mem::take(&mut st.bp.addrs) {
                if let Err(err) = self.allocator.free(addr, io.txg) {
                    warn!(error = %err, "reexecute_free_failed");
                }
            }
            st.bp.birth = Txg::NONE;
        }
        st.stage = IoStage::Open;
        st.pipeline = st.orig_pipeline;
        st.error = None;
        st.phys_error = None;
        st.pdata = None;
        st.transforms.clear();
        if !io.flags.raw {
            st.target = None;
        }
        st.waits = [[0; Phase::COUNT]; ChildType::COUNT];
        st.stall = None;
        st.gang_children_spawned = false;
        st.gang_unwound = false;
        st.gang_header_requested = false;
        st.gang_child_ptrs.clear();
        st.gang_results.clear();
        st.gang_failed.clear();
        st.gang_header_addrs.clear();
        st.dedup_verify_spawned = false;
        st.dedup_verify_data = None;
        st.dedup_insert_on_done = false;
        st.retried = false;
        st.replica_index = 0;
        st.replica_fanout_spawned = false;
        st.ready_fired = false;
        st.parked = false;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("devices", &self.devices.read().len())
            .field("suspend", &self.suspend)
            .finish_non_exhaustive()
    }
}
