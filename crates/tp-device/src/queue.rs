//! Per-device priority scheduler.
//!
//! Orders, aggregates, and throttles the physical operations issued to one
//! leaf device. Six priority classes, each with a minimum and maximum
//! concurrent-operation bound, plus a device-wide aggregate cap.
//!
//! # Issue order
//!
//! 1. Any class holding pending work below its minimum, in class-priority
//!    order. This bounds starvation: a nonempty class below its minimum is
//!    always picked before a class at or above its own.
//! 2. Otherwise, any class below its (effective) maximum.
//! 3. Otherwise nothing is issued.
//!
//! Synchronous classes issue in submission order (fairness). All other
//! classes issue by device offset relative to a last-issued cursor, so
//! successive picks favor forward motion across the device.
//!
//! # Aggregation
//!
//! Adjacent same-class, same-direction requests coalesce into one physical
//! span up to `aggregation_limit`, tolerating inter-request gaps up to a
//! per-direction limit (read gaps are read and discarded; write gaps are
//! zero filled). An *optional* request (speculative read) is absorbed only
//! when a mandatory request follows it into the same aggregate; trailing
//! optionals stay queued.
//!
//! # Write throttle
//!
//! The asynchronous-write class's maximum is not fixed: it is linearly
//! interpolated between its configured min and max by the fraction of the
//! dirty-data budget currently outstanding ([`DirtyState`]). Heavier
//! commit backlog ⇒ more concurrent writes; light backlog ⇒ fewer, which
//! leaves device bandwidth for latency-sensitive classes.

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tp_types::{ByteOffset, IoClass};
use tracing::trace;

/// One class's concurrency bounds.
#[derive(Debug, Clone, Copy)]
pub struct ClassLimits {
    pub min_active: u32,
    pub max_active: u32,
}

/// Scheduler tunables. Every field is configuration; the defaults suit a
/// single spinning or solid-state leaf behind a busy pool.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Per-class `(min, max)` bounds, indexed by [`IoClass::index`].
    pub classes: [ClassLimits; 6],
    /// Device-wide cap on concurrently active operations.
    pub device_max_active: u32,
    /// Maximum aggregated span in bytes.
    pub aggregation_limit: u32,
    /// Largest tolerated gap between aggregated reads.
    pub read_gap_limit: u32,
    /// Largest tolerated gap between aggregated writes.
    pub write_gap_limit: u32,
    /// Dirty fraction at or below which async writes run at `min_active`.
    pub async_write_min_dirty_fraction: f64,
    /// Dirty fraction at or above which async writes run at `max_active`.
    pub async_write_max_dirty_fraction: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            classes: [
                ClassLimits { min_active: 10, max_active: 10 }, // sync read
                ClassLimits { min_active: 10, max_active: 10 }, // sync write
                ClassLimits { min_active: 1, max_active: 3 },   // async read
                ClassLimits { min_active: 1, max_active: 10 },  // async write
                ClassLimits { min_active: 1, max_active: 2 },   // scan
                ClassLimits { min_active: 1, max_active: 64 },  // trim
            ],
            device_max_active: 1000,
            aggregation_limit: 128 * 1024,
            read_gap_limit: 32 * 1024,
            write_gap_limit: 4 * 1024,
            async_write_min_dirty_fraction: 0.30,
            async_write_max_dirty_fraction: 0.60,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn limits(&self, class: IoClass) -> ClassLimits {
        self.classes[class.index()]
    }
}

/// Outstanding-unsynced-bytes accounting shared between the pool's write
/// path and every device queue. The async-write throttle reads it.
#[derive(Debug)]
pub struct DirtyState {
    outstanding: AtomicU64,
    budget: u64,
}

impl DirtyState {
    #[must_use]
    pub fn new(budget: u64) -> Self {
        Self {
            outstanding: AtomicU64::new(0),
            budget: budget.max(1),
        }
    }

    pub fn add(&self, bytes: u64) {
        self.outstanding.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub(&self, bytes: u64) {
        let prev = self.outstanding.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "dirty accounting underflow");
    }

    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Fraction of the budget currently outstanding, uncapped.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // budgets are far below 2^52
    pub fn fraction(&self) -> f64 {
        self.outstanding() as f64 / self.budget as f64
    }
}

/// Direction of a physical operation. Aggregation never mixes directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    Flush,
    Discard,
}

/// What the scheduler needs to know about a queued request.
pub trait Queued: Send + Sync {
    fn io_class(&self) -> IoClass;
    fn offset(&self) -> ByteOffset;
    fn len(&self) -> u32;
    fn direction(&self) -> Direction;
    /// Requests that opted out (already-verified scrub repair, gang
    /// headers) are never coalesced.
    fn allow_aggregation(&self) -> bool {
        true
    }
    /// Speculative work that must not be the tail of an aggregate.
    fn is_optional(&self) -> bool {
        false
    }
    /// Re-queued after a device error: admitted at the front of its class.
    fn is_retry(&self) -> bool {
        false
    }
}

/// One request inside an [`Issue`], with its absolute device offset.
pub struct IssuePart<T> {
    pub item: Arc<T>,
    pub offset: ByteOffset,
}

/// One physical operation to perform: a single request or an aggregate
/// span covering several. The caller performs the device I/O for
/// `[offset, offset + span)` and then hands the issue back to
/// [`DeviceQueue::complete`].
pub struct Issue<T> {
    pub class: IoClass,
    pub direction: Direction,
    pub offset: ByteOffset,
    pub span: u64,
    /// Constituent requests in ascending offset order.
    pub parts: Vec<IssuePart<T>>,
}

impl<T: Queued> Issue<T> {
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        self.parts.len() > 1
    }
}

type PendKey = (u64, u64); // (offset, seq)

struct Pending<T> {
    item: Arc<T>,
    seq: u64,
}

struct ClassQueue<T> {
    by_offset: BTreeMap<PendKey, Pending<T>>,
    /// Submission-order index; the head of FIFO classes comes from here.
    by_seq: BTreeMap<u64, PendKey>,
    /// Keys to pick before anything else (bounded retry boost).
    boosted: VecDeque<PendKey>,
    active: u32,
    last_offset: u64,
}

impl<T> ClassQueue<T> {
    fn new() -> Self {
        Self {
            by_offset: BTreeMap::new(),
            by_seq: BTreeMap::new(),
            boosted: VecDeque::new(),
            active: 0,
            last_offset: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    fn insert(&mut self, item: Arc<T>, seq: u64, offset: u64, boost: bool) {
        let key = (offset, seq);
        self.by_seq.insert(seq, key);
        if boost {
            self.boosted.push_back(key);
        }
        self.by_offset.insert(key, Pending { item, seq });
    }

    fn remove(&mut self, key: PendKey) -> Option<Pending<T>> {
        let pending = self.by_offset.remove(&key)?;
        self.by_seq.remove(&pending.seq);
        Some(pending)
    }
}

struct Inner<T> {
    classes: Vec<ClassQueue<T>>,
    active_total: u32,
    next_seq: u64,
}

/// The per-leaf-device scheduler. All state sits behind one lock; the
/// lock is never held across device I/O — `enqueue`/`complete` only
/// decide *what* to issue, the caller performs it.
pub struct DeviceQueue<T> {
    config: QueueConfig,
    dirty: Arc<DirtyState>,
    inner: Mutex<Inner<T>>,
}

impl<T: Queued> DeviceQueue<T> {
    #[must_use]
    pub fn new(config: QueueConfig, dirty: Arc<DirtyState>) -> Self {
        let classes = (0..IoClass::ALL.len()).map(|_| ClassQueue::new()).collect();
        Self {
            config,
            dirty,
            inner: Mutex::new(Inner {
                classes,
                active_total: 0,
                next_seq: 0,
            }),
        }
    }

    /// Admit one request and return every operation the bounds now permit.
    pub fn enqueue(&self, item: Arc<T>) -> Vec<Issue<T>> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let class = item.io_class();
        let offset = item.offset().0;
        let boost = item.is_retry();
        inner.classes[class.index()].insert(item, seq, offset, boost);
        trace!(
            class = class.index(),
            offset,
            seq,
            boost,
            "device_queue_enqueue"
        );
        self.issue_more(&mut inner)
    }

    /// Retire one issued operation and return follow-on operations.
    ///
    /// An aggregate retires as a single operation, however many requests
    /// it absorbed.
    pub fn complete(&self, issue: &Issue<T>) -> Vec<Issue<T>> {
        let mut inner = self.inner.lock();
        let class = &mut inner.classes[issue.class.index()];
        debug_assert!(class.active >= 1, "active accounting underflow");
        class.active -= 1;
        inner.active_total -= 1;
        self.issue_more(&mut inner)
    }

    /// Currently active operations (device-wide).
    #[must_use]
    pub fn active_count(&self) -> u32 {
        self.inner.lock().active_total
    }

    /// Pending (not yet issued) operations, device-wide.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.classes.iter().map(|c| c.by_offset.len()).sum()
    }

    #[must_use]
    pub fn class_active(&self, class: IoClass) -> u32 {
        self.inner.lock().classes[class.index()].active
    }

    /// Effective maximum for a class. Fixed except for async writes,
    /// which interpolate on the dirty-data backlog.
    #[must_use]
    pub fn effective_max(&self, class: IoClass) -> u32 {
        let limits = self.config.limits(class);
        if class != IoClass::AsyncWrite {
            return limits.max_active;
        }
        let lo_frac = self.config.async_write_min_dirty_fraction;
        let hi_frac = self.config.async_write_max_dirty_fraction;
        let frac = self.dirty.fraction();
        if frac <= lo_frac || hi_frac <= lo_frac {
            return limits.min_active;
        }
        if frac >= hi_frac {
            return limits.max_active;
        }
        let scale = (frac - lo_frac) / (hi_frac - lo_frac);
        let extra = f64::from(limits.max_active - limits.min_active) * scale;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let extra = extra.floor() as u32;
        (limits.min_active + extra).min(limits.max_active)
    }

    fn pick_class(&self, inner: &Inner<T>) -> Option<IoClass> {
        if inner.active_total >= self.config.device_max_active {
            return None;
        }
        // First serve any class starved below its minimum.
        for class in IoClass::ALL {
            let queue = &inner.classes[class.index()];
            if !queue.is_empty() && queue.active < self.config.limits(class).min_active {
                return Some(class);
            }
        }
        // Then anything with headroom below its effective maximum.
        for class in IoClass::ALL {
            let queue = &inner.classes[class.index()];
            if !queue.is_empty() && queue.active < self.effective_max(class) {
                return Some(class);
            }
        }
        None
    }

    fn head_key(inner: &mut Inner<T>, class: IoClass) -> Option<PendKey> {
        let queue = &mut inner.classes[class.index()];
        // Boosted retries jump the line regardless of ordering mode.
        while let Some(key) = queue.boosted.pop_front() {
            if queue.by_offset.contains_key(&key) {
                return Some(key);
            }
            // Absorbed into an earlier aggregate; skip the stale key.
        }
        if class.is_fifo() {
            return queue.by_seq.values().next().copied();
        }
        let cursor = (queue.last_offset, 0_u64);
        queue
            .by_offset
            .range(cursor..)
            .next()
            .map(|(key, _)| *key)
            .or_else(|| queue.by_offset.keys().next().copied())
    }

    fn gap_limit(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Read => u64::from(self.config.read_gap_limit),
            Direction::Write => u64::from(self.config.write_gap_limit),
            Direction::Flush | Direction::Discard => 0,
        }
    }

    /// Remove the head request of `class` and coalesce neighbors into one
    /// physical span.
    fn build_issue(&self, inner: &mut Inner<T>, class: IoClass) -> Option<Issue<T>> {
        let head_key = Self::head_key(inner, class)?;
        let queue = &mut inner.classes[class.index()];
        let head = queue.remove(head_key).expect("head key was just observed");
        let direction = head.item.direction();
        let head_offset = head.item.offset().0;
        let head_len = u64::from(head.item.len());

        let mut parts: VecDeque<IssuePart<T>> = VecDeque::new();
        let mut first_offset = head_offset;
        let mut last_end = head_offset + head_len;
        let aggregatable = matches!(direction, Direction::Read | Direction::Write)
            && head.item.allow_aggregation();
        parts.push_back(IssuePart {
            item: head.item,
            offset: ByteOffset(head_offset),
        });

        if aggregatable {
            let limit = u64::from(self.config.aggregation_limit);
            let maxgap = self.gap_limit(direction);

            // Backward: extend toward lower offsets through mandatory
            // neighbors only.
            loop {
                let Some((&key, pending)) = queue.by_offset.range(..(first_offset, 0)).next_back()
                else {
                    break;
                };
                let p_off = pending.item.offset().0;
                let p_end = p_off + u64::from(pending.item.len());
                if pending.item.direction() != direction
                    || !pending.item.allow_aggregation()
                    || pending.item.is_optional()
                    || p_end > first_offset
                    || first_offset - p_end > maxgap
                    || last_end - p_off > limit
                {
                    break;
                }
                let pending = queue.remove(key).expect("neighbor key exists");
                parts.push_front(IssuePart {
                    item: pending.item,
                    offset: ByteOffset(p_off),
                });
                first_offset = p_off;
            }

            // Forward: optionals ride along only if a mandatory request
            // later joins; a run of trailing optionals stays queued.
            let mut optional_run: Vec<PendKey> = Vec::new();
            loop {
                let Some((&key, pending)) = queue.by_offset.range((last_end, 0)..).next() else {
                    break;
                };
                let p_off = pending.item.offset().0;
                let p_end = p_off + u64::from(pending.item.len());
                if pending.item.direction() != direction
                    || !pending.item.allow_aggregation()
                    || p_off < last_end
                    || p_off - last_end > maxgap
                    || p_end - first_offset > limit
                {
                    break;
                }
                if pending.item.is_optional() {
                    optional_run.push(key);
                    // Probe past the optional without absorbing it yet.
                    last_end = p_end;
                    continue;
                }
                for opt_key in optional_run.drain(..) {
                    let opt = queue.remove(opt_key).expect("optional key exists");
                    let opt_off = opt.item.offset().0;
                    parts.push_back(IssuePart {
                        item: opt.item,
                        offset: ByteOffset(opt_off),
                    });
                }
                let pending = queue.remove(key).expect("neighbor key exists");
                parts.push_back(IssuePart {
                    item: pending.item,
                    offset: ByteOffset(p_off),
                });
                last_end = p_end;
            }
            // Rewind past unabsorbed trailing optionals.
            if let Some(last) = parts.back() {
                last_end = last.offset.0 + u64::from(last.item.len());
            }
        }

        // The aggregate is one physical operation on the device.
        queue.active += 1;
        queue.last_offset = last_end;
        inner.active_total += 1;

        trace!(
            class = class.index(),
            offset = first_offset,
            span = last_end - first_offset,
            parts = parts.len(),
            "device_queue_issue"
        );
        Some(Issue {
            class,
            direction,
            offset: ByteOffset(first_offset),
            span: last_end - first_offset,
            parts: parts.into(),
        })
    }

    fn issue_more(&self, inner: &mut Inner<T>) -> Vec<Issue<T>> {
        let mut out = Vec::new();
        while let Some(class) = self.pick_class(inner) {
            match self.build_issue(inner, class) {
                Some(issue) => out.push(issue),
                None => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestIo {
        class: IoClass,
        offset: u64,
        len: u32,
        direction: Direction,
        optional: bool,
        retry: bool,
    }

    impl TestIo {
        fn write(offset: u64, len: u32, class: IoClass) -> Arc<Self> {
            Arc::new(Self {
                class,
                offset,
                len,
                direction: Direction::Write,
                optional: false,
                retry: false,
            })
        }

        fn read(offset: u64, len: u32, class: IoClass) -> Arc<Self> {
            Arc::new(Self {
                class,
                offset,
                len,
                direction: Direction::Read,
                optional: false,
                retry: false,
            })
        }
    }

    impl Queued for TestIo {
        fn io_class(&self) -> IoClass {
            self.class
        }
        fn offset(&self) -> ByteOffset {
            ByteOffset(self.offset)
        }
        fn len(&self) -> u32 {
            self.len
        }
        fn direction(&self) -> Direction {
            self.direction
        }
        fn is_optional(&self) -> bool {
            self.optional
        }
        fn is_retry(&self) -> bool {
            self.retry
        }
    }

    fn queue_with(config: QueueConfig) -> DeviceQueue<TestIo> {
        DeviceQueue::new(config, Arc::new(DirtyState::new(1 << 20)))
    }

    fn tight_config(max_active: u32) -> QueueConfig {
        let mut config = QueueConfig::default();
        for limits in &mut config.classes {
            *limits = ClassLimits {
                min_active: 1,
                max_active,
            };
        }
        config.device_max_active = max_active;
        config
    }

    #[test]
    fn sync_reads_issue_in_submission_order() {
        let config = tight_config(1);
        let queue = queue_with(config);

        // Higher offset submitted first must still issue first.
        let first = queue.enqueue(TestIo::read(8192, 512, IoClass::SyncRead));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].offset, ByteOffset(8192));
        let none = queue.enqueue(TestIo::read(0, 512, IoClass::SyncRead));
        assert!(none.is_empty(), "max_active=1 holds the second request");

        let next = queue.complete(&first[0]);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].offset, ByteOffset(0));
    }

    #[test]
    fn async_class_orders_by_offset_cursor() {
        let mut config = tight_config(1);
        config.aggregation_limit = 0; // isolate ordering
        let queue = queue_with(config);

        let issued = queue.enqueue(TestIo::read(4096, 512, IoClass::AsyncRead));
        assert_eq!(issued[0].offset, ByteOffset(4096));
        // Cursor sits at 4608 now. A lower offset waits behind a higher one.
        assert!(queue.enqueue(TestIo::read(0, 512, IoClass::AsyncRead)).is_empty());
        assert!(queue
            .enqueue(TestIo::read(100_000, 512, IoClass::AsyncRead))
            .is_empty());

        let second = queue.complete(&issued[0]);
        assert_eq!(second[0].offset, ByteOffset(100_000), "forward of cursor first");
        let third = queue.complete(&second[0]);
        assert_eq!(third[0].offset, ByteOffset(0), "wraps to lowest offset");
    }

    #[test]
    fn class_below_min_preempts_class_below_max() {
        let mut config = QueueConfig::default();
        config.classes[IoClass::Scan.index()] = ClassLimits {
            min_active: 1,
            max_active: 2,
        };
        config.classes[IoClass::AsyncRead.index()] = ClassLimits {
            min_active: 0,
            max_active: 3,
        };
        config.device_max_active = 1;
        let queue = queue_with(config);

        // Both classes pending; only one slot. Scan is below its min while
        // async read's min is already satisfied (0), so scan wins even
        // though async read has higher class priority.
        let mut inner = queue.inner.lock();
        inner.classes[IoClass::AsyncRead.index()].insert(
            TestIo::read(0, 512, IoClass::AsyncRead),
            0,
            0,
            false,
        );
        inner.classes[IoClass::Scan.index()].insert(
            TestIo::read(512, 512, IoClass::Scan),
            1,
            512,
            false,
        );
        let picked = queue.pick_class(&inner).expect("one slot free");
        assert_eq!(picked, IoClass::Scan);
    }

    #[test]
    fn device_wide_cap_is_never_exceeded() {
        let mut config = tight_config(8);
        config.device_max_active = 3;
        config.aggregation_limit = 0;
        let queue = queue_with(config);

        let mut active: Vec<Issue<TestIo>> = Vec::new();
        for i in 0..10_u64 {
            for issue in queue.enqueue(TestIo::read(i * 4096, 512, IoClass::AsyncRead)) {
                active.push(issue);
            }
            assert!(queue.active_count() <= 3);
        }
        assert_eq!(queue.active_count(), 3);
        while let Some(done) = active.pop() {
            for issue in queue.complete(&done) {
                assert!(queue.active_count() <= 3);
                active.push(issue);
            }
        }
        assert_eq!(queue.active_count(), 0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn adjacent_writes_aggregate_into_one_span() {
        let config = tight_config(4);
        let queue = queue_with(config);

        // Occupy the class's single slot (dirty fraction 0 keeps the
        // async-write effective max at min_active = 1), then stage three
        // contiguous writes behind it.
        let blocker = queue.enqueue(TestIo::write(1 << 30, 512, IoClass::AsyncWrite));
        assert_eq!(blocker.len(), 1);
        // Dirty fraction 0 -> effective max is min_active (1): queued
        // writes accumulate behind the blocker.
        assert!(queue.enqueue(TestIo::write(0, 4096, IoClass::AsyncWrite)).is_empty());
        assert!(queue.enqueue(TestIo::write(4096, 4096, IoClass::AsyncWrite)).is_empty());
        assert!(queue.enqueue(TestIo::write(8192, 4096, IoClass::AsyncWrite)).is_empty());

        let issues = queue.complete(&blocker[0]);
        assert_eq!(issues.len(), 1);
        let agg = &issues[0];
        assert!(agg.is_aggregate());
        assert_eq!(agg.parts.len(), 3);
        assert_eq!(agg.offset, ByteOffset(0));
        assert_eq!(agg.span, 12288);
        assert_eq!(agg.direction, Direction::Write);
    }

    #[test]
    fn write_gap_larger_than_limit_splits_aggregate() {
        let config = tight_config(4);
        let queue = queue_with(config);

        let blocker = queue.enqueue(TestIo::write(1 << 30, 512, IoClass::AsyncWrite));
        assert!(queue.enqueue(TestIo::write(0, 4096, IoClass::AsyncWrite)).is_empty());
        // Gap of 8 KiB > 4 KiB write gap limit.
        assert!(queue
            .enqueue(TestIo::write(4096 + 8192, 4096, IoClass::AsyncWrite))
            .is_empty());

        let issues = queue.complete(&blocker[0]);
        assert_eq!(issues.len(), 1, "second write stays pending");
        assert_eq!(issues[0].parts.len(), 1);
        assert_eq!(issues[0].span, 4096);
    }

    #[test]
    fn read_gap_within_limit_is_spanned() {
        let config = tight_config(4);
        let queue = queue_with(config);

        let blocker = queue.enqueue(TestIo::read(1 << 30, 512, IoClass::AsyncRead));
        assert!(queue.enqueue(TestIo::read(0, 4096, IoClass::AsyncRead)).is_empty());
        // 8 KiB gap is fine for reads (32 KiB limit): span covers it.
        assert!(queue
            .enqueue(TestIo::read(4096 + 8192, 4096, IoClass::AsyncRead))
            .is_empty());

        let issues = queue.complete(&blocker[0]);
        assert_eq!(issues[0].parts.len(), 2);
        assert_eq!(issues[0].span, 4096 + 8192 + 4096);
    }

    #[test]
    fn trailing_optional_is_not_absorbed() {
        let config = tight_config(1);
        let queue = queue_with(config);

        let blocker = queue.enqueue(TestIo::read(1 << 30, 512, IoClass::AsyncRead));
        assert!(queue.enqueue(TestIo::read(0, 4096, IoClass::AsyncRead)).is_empty());
        let optional = Arc::new(TestIo {
            class: IoClass::AsyncRead,
            offset: 4096,
            len: 4096,
            direction: Direction::Read,
            optional: true,
            retry: false,
        });
        assert!(queue.enqueue(optional).is_empty());

        let issues = queue.complete(&blocker[0]);
        assert_eq!(issues[0].parts.len(), 1, "optional tail stays queued");
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn optional_bridges_to_following_mandatory() {
        let config = tight_config(1);
        let queue = queue_with(config);

        let blocker = queue.enqueue(TestIo::read(1 << 30, 512, IoClass::AsyncRead));
        assert!(queue.enqueue(TestIo::read(0, 4096, IoClass::AsyncRead)).is_empty());
        let optional = Arc::new(TestIo {
            class: IoClass::AsyncRead,
            offset: 4096,
            len: 4096,
            direction: Direction::Read,
            optional: true,
            retry: false,
        });
        assert!(queue.enqueue(optional).is_empty());
        assert!(queue.enqueue(TestIo::read(8192, 4096, IoClass::AsyncRead)).is_empty());

        let issues = queue.complete(&blocker[0]);
        assert_eq!(
            issues[0].parts.len(),
            3,
            "optional rides along when a mandatory follows"
        );
        assert_eq!(issues[0].span, 12288);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn retry_jumps_the_fifo_line() {
        let config = tight_config(1);
        let queue = queue_with(config);

        let first = queue.enqueue(TestIo::read(0, 512, IoClass::SyncRead));
        assert!(queue.enqueue(TestIo::read(512, 512, IoClass::SyncRead)).is_empty());
        let retry = Arc::new(TestIo {
            class: IoClass::SyncRead,
            offset: 99_999,
            len: 512,
            direction: Direction::Read,
            optional: false,
            retry: true,
        });
        assert!(queue.enqueue(retry).is_empty());

        let next = queue.complete(&first[0]);
        assert_eq!(next[0].offset, ByteOffset(99_999), "retry issues first");
    }

    #[test]
    fn async_write_max_interpolates_on_dirty_fraction() {
        let dirty = Arc::new(DirtyState::new(1000));
        let queue: DeviceQueue<TestIo> = DeviceQueue::new(QueueConfig::default(), Arc::clone(&dirty));

        // Below 30%: min (1).
        assert_eq!(queue.effective_max(IoClass::AsyncWrite), 1);
        dirty.add(300);
        assert_eq!(queue.effective_max(IoClass::AsyncWrite), 1);
        // Midpoint 45%: halfway between 1 and 10.
        dirty.add(150);
        assert_eq!(queue.effective_max(IoClass::AsyncWrite), 5);
        // At or above 60%: max (10).
        dirty.add(150);
        assert_eq!(queue.effective_max(IoClass::AsyncWrite), 10);
        dirty.add(10_000);
        assert_eq!(queue.effective_max(IoClass::AsyncWrite), 10);
        // Other classes are fixed.
        assert_eq!(queue.effective_max(IoClass::SyncRead), 10);
    }

    #[test]
    fn starved_class_below_min_is_eventually_served() {
        let mut config = QueueConfig::default();
        config.classes[IoClass::SyncRead.index()] = ClassLimits {
            min_active: 2,
            max_active: 4,
        };
        config.classes[IoClass::Scan.index()] = ClassLimits {
            min_active: 1,
            max_active: 1,
        };
        config.device_max_active = 3;
        config.aggregation_limit = 0;
        let queue = queue_with(config);

        let mut issues = Vec::new();
        for i in 0..6_u64 {
            issues.extend(queue.enqueue(TestIo::read(i * 4096, 512, IoClass::SyncRead)));
        }
        issues.extend(queue.enqueue(TestIo::read(1 << 20, 512, IoClass::Scan)));

        // Drain everything; the scan request must complete even while sync
        // reads keep the device busy.
        let mut scan_issued = issues.iter().any(|i| i.class == IoClass::Scan);
        let mut rounds = 0;
        while let Some(done) = issues.pop() {
            rounds += 1;
            assert!(rounds < 100, "drain must terminate");
            for next in queue.complete(&done) {
                scan_issued |= next.class == IoClass::Scan;
                issues.push(next);
            }
        }
        assert!(scan_issued, "scan class must not be starved");
    }

    #[test]
    fn flush_and_discard_never_aggregate() {
        let config = tight_config(4);
        let queue = queue_with(config);

        let mut issues = Vec::new();
        for i in 0..4_u64 {
            issues.extend(queue.enqueue(Arc::new(TestIo {
                class: IoClass::Trim,
                offset: i * 512,
                len: 512,
                direction: Direction::Discard,
                optional: false,
                retry: false,
            })));
        }
        assert_eq!(issues.len(), 4);
        for issue in &issues {
            assert_eq!(issue.parts.len(), 1, "discards issue one at a time");
        }
    }
}
