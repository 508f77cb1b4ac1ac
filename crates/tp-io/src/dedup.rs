//! Shared deduplication table.
//!
//! Maps content checksums to the block pointer that first stored that
//! content plus a reference count. A dedup-eligible write that matches an
//! entry bumps the count instead of allocating; a dedup free decrements
//! and only the last reference releases the physical block.

use parking_lot::Mutex;
use std::collections::HashMap;
use tp_types::{BlockPtr, Checksum};
use tracing::trace;

/// Whether a checksum match is trusted or verified byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupPolicy {
    /// Trust the 256-bit checksum.
    #[default]
    Trust,
    /// Read the existing block back and compare contents before sharing.
    Verify,
}

#[derive(Debug, Clone)]
struct DedupEntry {
    ptr: BlockPtr,
    refs: u64,
}

/// Outcome of releasing one reference.
#[derive(Debug)]
pub enum DedupRelease {
    /// Other references remain; the physical block stays.
    Shared(u64),
    /// That was the last reference: the caller frees the block.
    LastReference(BlockPtr),
    /// The checksum was never in the table (not a dedup-managed block).
    NotFound,
}

#[derive(Debug, Default)]
pub struct DedupTable {
    entries: Mutex<HashMap<Checksum, DedupEntry>>,
}

impl DedupTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing pointer for this content, if any.
    #[must_use]
    pub fn lookup(&self, checksum: &Checksum) -> Option<BlockPtr> {
        self.entries.lock().get(checksum).map(|e| e.ptr.clone())
    }

    /// Take one more reference on existing content. Returns `None` if the
    /// entry vanished between lookup and here (lost the race to a free).
    #[must_use]
    pub fn add_ref(&self, checksum: &Checksum) -> Option<BlockPtr> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(checksum)?;
        entry.refs += 1;
        trace!(partial = checksum.partial(), refs = entry.refs, "dedup_ref");
        Some(entry.ptr.clone())
    }

    /// Record freshly written content at one reference.
    pub fn insert(&self, checksum: Checksum, ptr: BlockPtr) {
        let mut entries = self.entries.lock();
        entries
            .entry(checksum)
            .and_modify(|e| e.refs += 1)
            .or_insert(DedupEntry { ptr, refs: 1 });
    }

    /// Drop one reference.
    #[must_use]
    pub fn release(&self, checksum: &Checksum) -> DedupRelease {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(checksum) else {
            return DedupRelease::NotFound;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            let entry = entries.remove(checksum).expect("entry present");
            trace!(partial = checksum.partial(), "dedup_last_release");
            DedupRelease::LastReference(entry.ptr)
        } else {
            DedupRelease::Shared(entry.refs)
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total references across all entries (diagnostics).
    #[must_use]
    pub fn total_refs(&self) -> u64 {
        self.entries.lock().values().map(|e| e.refs).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tp_types::BlockPtr;

    fn ptr_for(payload: &[u8]) -> (Checksum, BlockPtr) {
        let checksum = Checksum::of(payload);
        let mut ptr = BlockPtr::hole(u32::try_from(payload.len()).expect("fits"));
        ptr.checksum = checksum;
        ptr.dedup = true;
        (checksum, ptr)
    }

    #[test]
    fn insert_ref_release_cycle() {
        let table = DedupTable::new();
        let (ck, ptr) = ptr_for(b"shared content");

        table.insert(ck, ptr.clone());
        assert_eq!(table.len(), 1);
        assert!(table.lookup(&ck).is_some());

        let shared = table.add_ref(&ck).expect("entry exists");
        assert_eq!(shared, ptr);
        assert_eq!(table.total_refs(), 2);

        assert!(matches!(table.release(&ck), DedupRelease::Shared(1)));
        match table.release(&ck) {
            DedupRelease::LastReference(freed) => assert_eq!(freed, ptr),
            other => panic!("expected last reference, got {other:?}"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn release_of_unknown_checksum() {
        let table = DedupTable::new();
        let (ck, _) = ptr_for(b"never stored");
        assert!(matches!(table.release(&ck), DedupRelease::NotFound));
    }

    #[test]
    fn add_ref_after_last_release_misses() {
        let table = DedupTable::new();
        let (ck, ptr) = ptr_for(b"transient");
        table.insert(ck, ptr);
        let _ = table.release(&ck);
        assert!(table.add_ref(&ck).is_none());
    }

    #[test]
    fn distinct_content_keeps_distinct_entries() {
        let table = DedupTable::new();
        let (ck_a, ptr_a) = ptr_for(b"aaaa");
        let (ck_b, ptr_b) = ptr_for(b"bbbb");
        table.insert(ck_a, ptr_a);
        table.insert(ck_b, ptr_b);
        assert_eq!(table.len(), 2);
        assert_ne!(
            table.lookup(&ck_a).expect("a"),
            table.lookup(&ck_b).expect("b")
        );
    }
}
