//! The pipeline request: one in-flight logical or physical block
//! operation.
//!
//! A request is shared (`Arc`) between the submitting caller, the device
//! scheduler, and its parents/children in the dependency graph. Mutable
//! state sits behind one mutex that is only ever held for short critical
//! sections — never across a stage handler body, a device call, or a user
//! callback. Parent/child wait counters are the sole wakeup mechanism:
//! nothing in the pipeline polls.

use crate::stage::{IoStage, StageMask};
use crate::transform::Transform;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tp_device::queue::{Direction, Queued};
use tp_error::EngineError;
use tp_types::{BlockPtr, ByteOffset, CompressionKind, DeviceId, IoClass, Txg};

/// Operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    Free,
    Claim,
    Flush,
    /// Grouping-only request (roots, feed-cycle parents): no payload, no
    /// device leg, just the interlock stages and child bookkeeping.
    Null,
}

/// Behavior flags fixed at creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoFlags {
    /// Speculative prefetch: may be dropped from aggregate tails, never
    /// cached as a demand hit.
    pub speculative: bool,
    /// Never coalesce with neighbors.
    pub dont_aggregate: bool,
    /// Root monitoring request: observes child failure, never parks.
    pub godfather: bool,
    /// Physical child: payload is written/verified as-is, no transforms.
    pub raw: bool,
    /// Constituent of a gang tree.
    pub gang_child: bool,
    /// Failure surfaces to the completion callback but never parks the
    /// pool (secondary-cache payload writes).
    pub best_effort: bool,
}

/// Properties of a logical write.
#[derive(Debug, Clone)]
pub struct WriteProps {
    pub compression: CompressionKind,
    pub dedup: bool,
    /// Replica count to allocate.
    pub copies: usize,
    /// Pointer previously holding this logical block; enables the
    /// nop-write elision when content is unchanged.
    pub old_ptr: Option<BlockPtr>,
}

impl Default for WriteProps {
    fn default() -> Self {
        Self {
            compression: CompressionKind::Lz4,
            dedup: false,
            copies: 1,
            old_ptr: None,
        }
    }
}

/// Role a child plays for its parent. Wait counters are tracked per
/// `(type, phase)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildType {
    Logical,
    Gang,
    Dedup,
    Device,
}

impl ChildType {
    pub const COUNT: usize = 4;

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Logical => 0,
            Self::Gang => 1,
            Self::Dedup => 2,
            Self::Device => 3,
        }
    }
}

/// Wait phase a parent can stall on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ready,
    Done,
}

impl Phase {
    pub const COUNT: usize = 2;

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Ready => 0,
            Self::Done => 1,
        }
    }
}

/// Where a physical leg goes.
#[derive(Debug, Clone, Copy)]
pub struct PhysTarget {
    pub device: DeviceId,
    pub offset: ByteOffset,
    pub psize: u32,
    pub direction: Direction,
}

pub type ReadyFn = Box<dyn FnOnce(&BlockIo) + Send>;
pub type PhysDoneFn = Box<dyn FnOnce(&BlockIo, Option<&EngineError>) + Send>;
pub type DoneFn = Box<dyn FnOnce(&BlockIo, Option<&EngineError>) + Send>;

#[derive(Default)]
pub(crate) struct IoCallbacks {
    pub ready: Option<ReadyFn>,
    pub physdone: Option<PhysDoneFn>,
    pub done: Option<DoneFn>,
}

/// Handler verdict: advance to the next selected stage, or park until a
/// child completion or device interrupt re-drives the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub(crate) struct IoState {
    pub bp: BlockPtr,
    /// Logical payload: input for writes, output for reads.
    pub data: Option<Vec<u8>>,
    /// Physical payload (post-transform bytes that hit the device).
    pub pdata: Option<Vec<u8>>,
    pub stage: IoStage,
    pub pipeline: StageMask,
    pub orig_pipeline: StageMask,
    pub error: Option<EngineError>,
    /// Error from the most recent physical leg, staged separately so the
    /// assess stage can decide on retry before it taints the request.
    pub phys_error: Option<EngineError>,
    pub transforms: Vec<Transform>,
    pub target: Option<PhysTarget>,
    pub parents: Vec<(Weak<BlockIo>, ChildType)>,
    pub children: Vec<Arc<BlockIo>>,
    pub waits: [[u64; Phase::COUNT]; ChildType::COUNT],
    pub stall: Option<(ChildType, Phase)>,
    pub callbacks: IoCallbacks,
    // Gang bookkeeping.
    pub gang_children_spawned: bool,
    pub gang_unwound: bool,
    pub gang_header_requested: bool,
    pub gang_child_ptrs: Vec<BlockPtr>,
    pub gang_results: Vec<Option<BlockPtr>>,
    /// Pointers of gang children that failed *after* allocating; the
    /// unwind returns these extents directly.
    pub gang_failed: Vec<BlockPtr>,
    pub gang_header_addrs: Vec<tp_types::BlockAddr>,
    // Dedup bookkeeping.
    pub dedup_verify_spawned: bool,
    pub dedup_verify_data: Option<Vec<u8>>,
    pub dedup_insert_on_done: bool,
    // Device retry bookkeeping.
    pub retried: bool,
    pub replica_index: usize,
    pub replica_fanout_spawned: bool,
    pub ready_fired: bool,
    pub park_exempt: bool,
    pub parked: bool,
}

/// One pipeline request.
pub struct BlockIo {
    pub op: IoOp,
    pub class: IoClass,
    pub txg: Txg,
    pub lsize: u32,
    pub flags: IoFlags,
    pub props: WriteProps,
    pub(crate) state: Mutex<IoState>,
    retry: AtomicBool,
    completed: AtomicBool,
    done_lock: Mutex<bool>,
    done_cv: Condvar,
    /// Balanced child accounting, observable by tests.
    pub children_added: AtomicU64,
    pub children_removed: AtomicU64,
}

impl BlockIo {
    pub(crate) fn new(
        op: IoOp,
        class: IoClass,
        txg: Txg,
        lsize: u32,
        flags: IoFlags,
        props: WriteProps,
        bp: BlockPtr,
        data: Option<Vec<u8>>,
        pipeline: StageMask,
        callbacks: IoCallbacks,
    ) -> Arc<Self> {
        Arc::new(Self {
            op,
            class,
            txg,
            lsize,
            flags,
            props,
            state: Mutex::new(IoState {
                bp,
                data,
                pdata: None,
                stage: IoStage::Open,
                pipeline,
                orig_pipeline: pipeline,
                error: None,
                phys_error: None,
                transforms: Vec::new(),
                target: None,
                parents: Vec::new(),
                children: Vec::new(),
                waits: [[0; Phase::COUNT]; ChildType::COUNT],
                stall: None,
                callbacks,
                gang_children_spawned: false,
                gang_unwound: false,
                gang_header_requested: false,
                gang_child_ptrs: Vec::new(),
                gang_results: Vec::new(),
                gang_failed: Vec::new(),
                gang_header_addrs: Vec::new(),
                dedup_verify_spawned: false,
                dedup_verify_data: None,
                dedup_insert_on_done: false,
                retried: false,
                replica_index: 0,
                replica_fanout_spawned: false,
                ready_fired: false,
                park_exempt: false,
                parked: false,
            }),
            retry: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            done_lock: Mutex::new(false),
            done_cv: Condvar::new(),
            children_added: AtomicU64::new(0),
            children_removed: AtomicU64::new(0),
        })
    }

    /// Register `child` under `parent`. Both ready and done counters are
    /// taken; the child's completion path releases them.
    pub fn add_child(parent: &Arc<Self>, child: &Arc<Self>, ty: ChildType) {
        {
            let mut st = parent.state.lock();
            st.children.push(Arc::clone(child));
            st.waits[ty.index()][Phase::Ready.index()] += 1;
            st.waits[ty.index()][Phase::Done.index()] += 1;
        }
        parent.children_added.fetch_add(1, Ordering::Relaxed);
        child
            .state
            .lock()
            .parents
            .push((Arc::downgrade(parent), ty));
    }

    /// True (and records the stall) when children of `ty` have not yet
    /// passed `phase`. Handlers call this at the top and return
    /// [`Flow::Stop`] on `true`; the last relevant child completion
    /// re-drives the stage.
    pub(crate) fn wait_for_children(&self, ty: ChildType, phase: Phase) -> bool {
        let mut st = self.state.lock();
        if st.waits[ty.index()][phase.index()] > 0 {
            st.stall = Some((ty, phase));
            true
        } else {
            false
        }
    }

    /// Decrement the `(ty, phase)` counter; returns `true` when the
    /// parent was stalled on exactly that counter and is now unblocked.
    pub(crate) fn notify(&self, ty: ChildType, phase: Phase) -> bool {
        let mut st = self.state.lock();
        let count = &mut st.waits[ty.index()][phase.index()];
        debug_assert!(*count > 0, "child wait counter underflow");
        *count = count.saturating_sub(1);
        let unblocked = *count == 0 && st.stall == Some((ty, phase));
        if unblocked {
            st.stall = None;
        }
        unblocked
    }

    /// Merge a child's (or the physical leg's) error, worst wins.
    pub(crate) fn record_error(&self, err: EngineError) {
        let mut st = self.state.lock();
        st.error = Some(match st.error.take() {
            Some(existing) => existing.worst(err),
            None => err,
        });
    }

    /// Snapshot of the current error.
    #[must_use]
    pub fn error(&self) -> Option<EngineError> {
        self.state.lock().error.clone()
    }

    /// The resulting block pointer (meaningful once ready).
    #[must_use]
    pub fn result_ptr(&self) -> BlockPtr {
        self.state.lock().bp.clone()
    }

    /// Take the logical payload out (read results).
    #[must_use]
    pub fn take_data(&self) -> Option<Vec<u8>> {
        self.state.lock().data.take()
    }

    /// Borrow-free copy of the logical payload.
    #[must_use]
    pub fn clone_data(&self) -> Option<Vec<u8>> {
        self.state.lock().data.clone()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_retry(&self) {
        self.retry.store(true, Ordering::Release);
    }

    /// Block until the request reaches done; returns the ranked error.
    pub fn wait(&self) -> Result<(), EngineError> {
        let mut done = self.done_lock.lock();
        while !*done {
            self.done_cv.wait(&mut done);
        }
        drop(done);
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Mark complete and wake synchronous waiters. Exactly once.
    pub(crate) fn mark_completed(&self) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut done = self.done_lock.lock();
        *done = true;
        self.done_cv.notify_all();
        true
    }

    /// Current stage (diagnostics and tests).
    #[must_use]
    pub fn stage(&self) -> IoStage {
        self.state.lock().stage
    }

    /// Outstanding (parents still linked) — diagnostics.
    #[must_use]
    pub fn parent_count(&self) -> usize {
        let st = self.state.lock();
        st.parents.iter().filter(|(w, _)| w.strong_count() > 0).count()
    }
}

impl std::fmt::Debug for BlockIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("BlockIo")
            .field("op", &self.op)
            .field("class", &self.class)
            .field("lsize", &self.lsize)
            .field("stage", &st.stage)
            .field("error", &st.error)
            .finish_non_exhaustive()
    }
}

impl Queued for BlockIo {
    fn io_class(&self) -> IoClass {
        self.class
    }

    fn offset(&self) -> ByteOffset {
        self.state
            .lock()
            .target
            .map_or(ByteOffset::ZERO, |t| t.offset)
    }

    fn len(&self) -> u32 {
        self.state.lock().target.map_or(0, |t| t.psize)
    }

    fn direction(&self) -> Direction {
        self.state
            .lock()
            .target
            .map_or(Direction::Flush, |t| t.direction)
    }

    fn allow_aggregation(&self) -> bool {
        !self.flags.dont_aggregate && !self.flags.raw
    }

    fn is_optional(&self) -> bool {
        self.flags.speculative
    }

    fn is_retry(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }
}
