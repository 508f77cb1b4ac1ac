#![forbid(unsafe_code)]
//! Extent allocation service.
//!
//! The pipeline consumes allocation as an external service: it asks for
//! extents, frees them, or claims them during replay, always scoped to a
//! transaction group. The placement policy behind that interface is not
//! this crate's concern — [`RegionAllocator`] is a deliberately simple
//! first-fit free list used by tests and the harness, with one knob the
//! pipeline tests rely on: `max_contiguous` caps the largest extent a
//! single allocation may return, which forces gang splitting upstream.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tp_error::{EngineError, Result};
use tp_types::{alloc_size, BlockAddr, ByteOffset, DeviceId, Txg};
use tracing::trace;

/// Allocation service consumed by the I/O pipeline.
///
/// `allocate` returns `copies` extents of `size` bytes, on distinct
/// devices when the pool has enough of them. `NoSpace` means no single
/// extent of `size` is available; the caller may retry with a smaller
/// size (gang splitting) but must not assume partial progress.
pub trait Allocator: Send + Sync {
    fn allocate(&self, size: u32, copies: usize, txg: Txg) -> Result<Vec<BlockAddr>>;

    /// Return an extent to the free pool.
    fn free(&self, addr: BlockAddr, txg: Txg) -> Result<()>;

    /// Mark an extent allocated during replay. Idempotent: claiming an
    /// extent that is already allocated succeeds, so replaying the same
    /// log twice is harmless.
    fn claim(&self, addr: BlockAddr, txg: Txg) -> Result<()>;
}

struct Region {
    device: DeviceId,
    /// offset → run length, both in bytes. Non-adjacent by invariant.
    free: BTreeMap<u64, u64>,
    /// offset → allocated length, for double-free detection.
    allocated: BTreeMap<u64, u64>,
}

impl Region {
    fn find_first_fit(&self, size: u64) -> Option<u64> {
        self.free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&offset, _)| offset)
    }

    fn take(&mut self, offset: u64, size: u64) {
        let run = self.free.remove(&offset).expect("free run exists");
        debug_assert!(run >= size);
        if run > size {
            self.free.insert(offset + size, run - size);
        }
        self.allocated.insert(offset, size);
    }

    fn put_back(&mut self, offset: u64, size: u64) {
        // Coalesce with the runs on either side.
        let mut start = offset;
        let mut len = size;
        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                start = prev_off;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(offset + size)) {
            self.free.remove(&(offset + size));
            len += next_len;
        }
        self.free.insert(start, len);
    }
}

/// First-fit free-list allocator over fixed per-device regions.
pub struct RegionAllocator {
    regions: Mutex<Vec<Region>>,
    /// Largest extent a single allocation may return; larger requests get
    /// `NoSpace` so the pipeline falls back to gang allocation.
    max_contiguous: Option<u32>,
}

impl RegionAllocator {
    /// One region per `(device, start, len)` triple.
    #[must_use]
    pub fn new(regions: &[(DeviceId, u64, u64)]) -> Self {
        let regions = regions
            .iter()
            .map(|&(device, start, len)| Region {
                device,
                free: BTreeMap::from([(start, len)]),
                allocated: BTreeMap::new(),
            })
            .collect();
        Self {
            regions: Mutex::new(regions),
            max_contiguous: None,
        }
    }

    #[must_use]
    pub fn with_max_contiguous(mut self, max: u32) -> Self {
        self.max_contiguous = Some(max);
        self
    }

    /// Bytes currently allocated across all regions (leak accounting).
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.regions
            .lock()
            .iter()
            .map(|r| r.allocated.values().sum::<u64>())
            .sum()
    }

    /// Bytes currently free across all regions.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.regions
            .lock()
            .iter()
            .map(|r| r.free.values().sum::<u64>())
            .sum()
    }

    fn region_index(regions: &[Region], addr: BlockAddr) -> Result<usize> {
        regions
            .iter()
            .position(|r| r.device == addr.device)
            .ok_or_else(|| EngineError::Protocol(format!("unknown device {}", addr.device)))
    }
}

impl Allocator for RegionAllocator {
    fn allocate(&self, size: u32, copies: usize, txg: Txg) -> Result<Vec<BlockAddr>> {
        let asize = alloc_size(size, "allocation size")
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        if asize == 0 || copies == 0 {
            return Err(EngineError::Protocol(format!(
                "degenerate allocation: size={size} copies={copies}"
            )));
        }
        if self.max_contiguous.is_some_and(|max| asize > max) {
            return Err(EngineError::NoSpace);
        }

        let mut regions = self.regions.lock();
        let mut out = Vec::with_capacity(copies);
        // Prefer distinct devices per copy; fall back to reusing a region
        // when the pool has fewer devices than copies.
        let region_count = regions.len();
        let mut picked: Vec<usize> = Vec::new();
        for _ in 0..copies {
            let candidate = regions
                .iter()
                .enumerate()
                .filter(|(idx, region)| {
                    (picked.len() >= region_count || !picked.contains(idx))
                        && region.find_first_fit(u64::from(asize)).is_some()
                })
                .map(|(idx, _)| idx)
                .next();
            let Some(idx) = candidate else {
                // Roll back partial progress before reporting exhaustion.
                for addr in &out {
                    let r_idx = Self::region_index(&regions, *addr)?;
                    regions[r_idx].put_back(addr.offset.0, u64::from(addr.size));
                    regions[r_idx].allocated.remove(&addr.offset.0);
                }
                return Err(EngineError::NoSpace);
            };
            let offset = regions[idx]
                .find_first_fit(u64::from(asize))
                .expect("candidate was checked");
            regions[idx].take(offset, u64::from(asize));
            picked.push(idx);
            out.push(BlockAddr {
                device: regions[idx].device,
                offset: ByteOffset(offset),
                size: asize,
                gang: false,
            });
        }
        trace!(size, asize, copies, txg = txg.0, "region_alloc");
        Ok(out)
    }

    fn free(&self, addr: BlockAddr, txg: Txg) -> Result<()> {
        let mut regions = self.regions.lock();
        let idx = Self::region_index(&regions, addr)?;
        let region = &mut regions[idx];
        match region.allocated.remove(&addr.offset.0) {
            Some(len) if len == u64::from(addr.size) => {
                region.put_back(addr.offset.0, len);
                trace!(offset = addr.offset.0, len, txg = txg.0, "region_free");
                Ok(())
            }
            Some(len) => {
                // Restore the record before failing: state must not tear.
                region.allocated.insert(addr.offset.0, len);
                Err(EngineError::Invariant(format!(
                    "free size mismatch at offset {}: allocated {len}, freeing {}",
                    addr.offset.0, addr.size
                )))
            }
            None => Err(EngineError::Invariant(format!(
                "double free at device {} offset {}",
                addr.device, addr.offset.0
            ))),
        }
    }

    fn claim(&self, addr: BlockAddr, txg: Txg) -> Result<()> {
        let mut regions = self.regions.lock();
        let idx = Self::region_index(&regions, addr)?;
        let region = &mut regions[idx];
        if region.allocated.get(&addr.offset.0) == Some(&u64::from(addr.size)) {
            return Ok(()); // replayed claim
        }
        // The extent must lie entirely inside one free run.
        let run = region
            .free
            .range(..=addr.offset.0)
            .next_back()
            .map(|(&off, &len)| (off, len));
        match run {
            Some((off, len))
                if addr.offset.0 + u64::from(addr.size) <= off + len =>
            {
                let before = addr.offset.0 - off;
                region.free.remove(&off);
                if before > 0 {
                    region.free.insert(off, before);
                }
                let after = off + len - (addr.offset.0 + u64::from(addr.size));
                if after > 0 {
                    region
                        .free
                        .insert(addr.offset.0 + u64::from(addr.size), after);
                }
                region.allocated.insert(addr.offset.0, u64::from(addr.size));
                trace!(offset = addr.offset.0, txg = txg.0, "region_claim");
                Ok(())
            }
            _ => Err(EngineError::Protocol(format!(
                "claim of unallocatable extent at device {} offset {}",
                addr.device, addr.offset.0
            ))),
        }
    }
}
