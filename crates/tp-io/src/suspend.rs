//! Pool-wide suspend/resume.
//!
//! When a top-level request would fail identically on re-execution, the
//! whole dependent tree parks here instead of completing with an error.
//! `resume` re-drives every parked tree from its origin; `fail` abandons
//! them with a `Suspended` error. Requests that reached the device-start
//! stage while the pool is suspended defer here too and are re-driven on
//! resume without losing their place in the pipeline.

use crate::io::BlockIo;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Default)]
struct Inner {
    suspended: bool,
    /// Failed top-level trees awaiting operator action.
    parked: Vec<Arc<BlockIo>>,
    /// Requests that hit device-start during suspension.
    deferred: Vec<Arc<BlockIo>>,
}

#[derive(Default)]
pub struct SuspendState {
    inner: Mutex<Inner>,
}

impl SuspendState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.inner.lock().suspended
    }

    /// Stop issuing new physical I/O.
    pub fn suspend(&self) {
        let mut inner = self.inner.lock();
        if !inner.suspended {
            inner.suspended = true;
            warn!("pool_suspended");
        }
    }

    /// Park a failed top-level request tree.
    pub fn park(&self, io: Arc<BlockIo>) {
        let mut inner = self.inner.lock();
        inner.suspended = true;
        warn!(parked = inner.parked.len() + 1, "request_parked");
        inner.parked.push(io);
    }

    /// Defer a request that wants to issue device I/O while suspended.
    pub fn defer(&self, io: Arc<BlockIo>) {
        self.inner.lock().deferred.push(io);
    }

    /// Clear the suspension and hand back everything to re-drive:
    /// `(parked trees, deferred device issues)`.
    #[must_use]
    pub fn resume(&self) -> (Vec<Arc<BlockIo>>, Vec<Arc<BlockIo>>) {
        let mut inner = self.inner.lock();
        inner.suspended = false;
        let parked = std::mem::take(&mut inner.parked);
        let deferred = std::mem::take(&mut inner.deferred);
        info!(
            parked = parked.len(),
            deferred = deferred.len(),
            "pool_resumed"
        );
        (parked, deferred)
    }

    #[must_use]
    pub fn parked_count(&self) -> usize {
        self.inner.lock().parked.len()
    }

    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.inner.lock().deferred.len()
    }
}

impl std::fmt::Debug for SuspendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SuspendState")
            .field("suspended", &inner.suspended)
            .field("parked", &inner.parked.len())
            .field("deferred", &inner.deferred.len())
            .finish()
    }
}
