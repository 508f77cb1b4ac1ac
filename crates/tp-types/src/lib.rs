#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum number of replica addresses a block pointer may carry.
pub const MAX_REPLICAS: usize = 3;

/// Number of child pointers a gang header block holds.
pub const GANG_FANOUT: usize = 3;

/// Size of a gang header block on the device (fixed, self-checksummed).
pub const GANG_HEADER_SIZE: u32 = 512;

/// Smallest allocatable unit. Allocations and physical sizes are rounded
/// up to this.
pub const ALLOC_ALIGN: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

/// Transaction group number. Allocation and free operations are scoped to
/// the txg they were issued in; txg 0 never identifies live data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Txg(pub u64);

impl Txg {
    pub const NONE: Self = Self(0);
}

/// Byte offset on a leaf device (pread/pwrite semantics).
///
/// Unit-carrying wrapper to keep byte offsets and block counts apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Subtract a byte count, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }

    /// Narrow to `usize`, with an explicit error path for 32-bit targets.
    pub fn to_usize(self) -> Result<usize, TypeError> {
        usize::try_from(self.0).map_err(|_| TypeError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

// ── Checksums ───────────────────────────────────────────────────────────────

/// Content checksum algorithm recorded in a block pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumKind {
    /// No checksum carried (holes, scratch I/O).
    Off,
    /// blake3 over the physical (post-transform) payload.
    Blake3,
}

/// 256-bit content checksum of a block's physical payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    pub const ZERO: Self = Self([0_u8; 32]);

    /// Checksum a payload.
    #[must_use]
    pub fn of(payload: &[u8]) -> Self {
        Self(*blake3::hash(payload).as_bytes())
    }

    /// The low 64 bits, used as the identity fragment in cache keys.
    #[must_use]
    pub fn partial(&self) -> u64 {
        u64::from_le_bytes([
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7],
        ])
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full 32 bytes are noise in logs; the partial identifies the block.
        write!(f, "Checksum({:016x}…)", self.partial())
    }
}

// ── Compression ─────────────────────────────────────────────────────────────

/// Compression applied to a block's payload before it went to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionKind {
    /// Stored uncompressed.
    Off,
    /// lz4 frame; `psize < lsize`.
    Lz4,
    /// All-zero payload: nothing stored on the device at all.
    Empty,
}

// ── Block addresses and pointers ────────────────────────────────────────────

/// One allocated replica of a block: device + offset + allocated size.
///
/// `gang` marks the address as a gang header rather than plain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockAddr {
    pub device: DeviceId,
    pub offset: ByteOffset,
    /// Allocated (on-device) size in bytes.
    pub size: u32,
    pub gang: bool,
}

impl BlockAddr {
    /// End offset of this allocation, `None` on overflow.
    #[must_use]
    pub fn end(&self) -> Option<ByteOffset> {
        self.offset.checked_add(u64::from(self.size))
    }
}

/// Immutable identity of a stored block: first replica address, creation
/// txg, and the low 64 bits of the content checksum.
///
/// Once assigned this triple is never reused for different content; the
/// cache and the pipeline join on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockIdentity {
    pub addr: BlockAddr,
    pub birth: Txg,
    pub partial: u64,
}

/// Fully describes one stored block: replica addresses plus the codes the
/// pipeline needs to read it back (sizes, compression, checksum, dedup).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPtr {
    /// Up to [`MAX_REPLICAS`] replica addresses. Empty for holes.
    pub addrs: Vec<BlockAddr>,
    /// Logical (uncompressed) size in bytes.
    pub lsize: u32,
    /// Physical (on-device) size in bytes. Equals `lsize` when uncompressed.
    pub psize: u32,
    pub compression: CompressionKind,
    pub checksum_kind: ChecksumKind,
    pub dedup: bool,
    pub birth: Txg,
    pub checksum: Checksum,
}

impl BlockPtr {
    /// A hole: no replicas, never born. Reads of a hole yield zeroes.
    #[must_use]
    pub fn hole(lsize: u32) -> Self {
        Self {
            addrs: Vec::new(),
            lsize,
            psize: 0,
            compression: CompressionKind::Off,
            checksum_kind: ChecksumKind::Off,
            dedup: false,
            birth: Txg::NONE,
            checksum: Checksum::ZERO,
        }
    }

    /// Validate replica count and size relationship.
    pub fn validate(&self) -> Result<(), TypeError> {
        if self.addrs.len() > MAX_REPLICAS {
            return Err(TypeError::TooManyReplicas {
                count: self.addrs.len(),
            });
        }
        if self.psize > self.lsize && self.compression != CompressionKind::Off {
            return Err(TypeError::SizeInversion {
                lsize: self.lsize,
                psize: self.psize,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.addrs.is_empty() && self.birth == Txg::NONE
    }

    #[must_use]
    pub fn is_gang(&self) -> bool {
        self.addrs.first().is_some_and(|a| a.gang)
    }

    /// The cache/pipeline identity, or `None` for holes.
    #[must_use]
    pub fn identity(&self) -> Option<BlockIdentity> {
        self.addrs.first().map(|addr| BlockIdentity {
            addr: *addr,
            birth: self.birth,
            partial: self.checksum.partial(),
        })
    }
}

// ── Classification ──────────────────────────────────────────────────────────

/// Content class a cached block belongs to. Recency lists are split by
/// class so metadata and data evict independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentClass {
    Metadata,
    Data,
}

impl ContentClass {
    pub const ALL: [Self; 2] = [Self::Metadata, Self::Data];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Metadata => 0,
            Self::Data => 1,
        }
    }
}

/// Scheduler priority class. Declaration order is class-priority order:
/// when several classes are below their minimum the lowest-indexed wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoClass {
    SyncRead,
    SyncWrite,
    AsyncRead,
    AsyncWrite,
    Scan,
    Trim,
}

impl IoClass {
    pub const ALL: [Self; 6] = [
        Self::SyncRead,
        Self::SyncWrite,
        Self::AsyncRead,
        Self::AsyncWrite,
        Self::Scan,
        Self::Trim,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::SyncRead => 0,
            Self::SyncWrite => 1,
            Self::AsyncRead => 2,
            Self::AsyncWrite => 3,
            Self::Scan => 4,
            Self::Trim => 5,
        }
    }

    /// Sync classes are issued in submission order; the rest by offset.
    #[must_use]
    pub fn is_fifo(self) -> bool {
        matches!(self, Self::SyncRead | Self::SyncWrite)
    }
}

// ── Errors and helpers ──────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("too many replicas: {count} (max {MAX_REPLICAS})")]
    TooManyReplicas { count: usize },
    #[error("physical size {psize} exceeds logical size {lsize} under compression")]
    SizeInversion { lsize: u32, psize: u32 },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Round `value` down to the nearest multiple of `alignment`.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Narrow a `u64` to `usize` with an explicit error path.
///
/// Infallible on 64-bit targets; the `field` label feeds diagnostics.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, TypeError> {
    usize::try_from(value).map_err(|_| TypeError::IntegerConversion { field })
}

/// Allocated size for a payload of `psize` bytes ([`ALLOC_ALIGN`] rounding).
pub fn alloc_size(psize: u32, field: &'static str) -> Result<u32, TypeError> {
    let rounded = align_up(u64::from(psize), ALLOC_ALIGN)
        .ok_or(TypeError::IntegerConversion { field })?;
    u32::try_from(rounded).map_err(|_| TypeError::IntegerConversion { field })
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Txg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_partial_is_low_64_le() {
        let payload = b"tidepool block payload";
        let ck = Checksum::of(payload);
        let expected = u64::from_le_bytes(ck.0[..8].try_into().expect("8 bytes"));
        assert_eq!(ck.partial(), expected);
        // Stable across recomputation.
        assert_eq!(Checksum::of(payload), ck);
    }

    #[test]
    fn hole_has_no_identity() {
        let hole = BlockPtr::hole(4096);
        assert!(hole.is_hole());
        assert!(!hole.is_gang());
        assert_eq!(hole.identity(), None);
        assert!(hole.validate().is_ok());
    }

    #[test]
    fn block_ptr_identity_uses_first_replica() {
        let addr0 = BlockAddr {
            device: DeviceId(1),
            offset: ByteOffset(4096),
            size: 512,
            gang: false,
        };
        let addr1 = BlockAddr {
            device: DeviceId(2),
            offset: ByteOffset(8192),
            size: 512,
            gang: false,
        };
        let ck = Checksum::of(b"payload");
        let bp = BlockPtr {
            addrs: vec![addr0, addr1],
            lsize: 512,
            psize: 512,
            compression: CompressionKind::Off,
            checksum_kind: ChecksumKind::Blake3,
            dedup: false,
            birth: Txg(7),
            checksum: ck,
        };
        let identity = bp.identity().expect("identity");
        assert_eq!(identity.addr, addr0);
        assert_eq!(identity.birth, Txg(7));
        assert_eq!(identity.partial, ck.partial());
    }

    #[test]
    fn validate_rejects_four_replicas() {
        let addr = BlockAddr {
            device: DeviceId(0),
            offset: ByteOffset::ZERO,
            size: 512,
            gang: false,
        };
        let bp = BlockPtr {
            addrs: vec![addr; 4],
            lsize: 512,
            psize: 512,
            compression: CompressionKind::Off,
            checksum_kind: ChecksumKind::Off,
            dedup: false,
            birth: Txg(1),
            checksum: Checksum::ZERO,
        };
        assert!(matches!(
            bp.validate(),
            Err(TypeError::TooManyReplicas { count: 4 })
        ));
    }

    #[test]
    fn gang_bit_comes_from_first_replica() {
        let mut addr = BlockAddr {
            device: DeviceId(0),
            offset: ByteOffset(512),
            size: GANG_HEADER_SIZE,
            gang: true,
        };
        let bp = BlockPtr {
            addrs: vec![addr],
            lsize: 1 << 20,
            psize: GANG_HEADER_SIZE,
            compression: CompressionKind::Off,
            checksum_kind: ChecksumKind::Blake3,
            dedup: false,
            birth: Txg(3),
            checksum: Checksum::ZERO,
        };
        assert!(bp.is_gang());
        addr.gang = false;
        let plain = BlockPtr { addrs: vec![addr], ..bp };
        assert!(!plain.is_gang());
    }

    #[test]
    fn io_class_priority_order() {
        for (i, class) in IoClass::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
        }
        assert!(IoClass::SyncRead.is_fifo());
        assert!(IoClass::SyncWrite.is_fifo());
        assert!(!IoClass::AsyncWrite.is_fifo());
        assert!(!IoClass::Trim.is_fifo());
    }

    #[test]
    fn byte_offset_checked_ops() {
        assert_eq!(ByteOffset(10).checked_add(5), Some(ByteOffset(15)));
        assert_eq!(ByteOffset(u64::MAX).checked_add(1), None);
        assert_eq!(ByteOffset(10).checked_sub(3), Some(ByteOffset(7)));
        assert_eq!(ByteOffset(0).checked_sub(1), None);
    }

    #[test]
    fn align_helpers() {
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(u64::MAX, 4096), None);
        assert_eq!(align_up(100, 3), None);
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_down(100, 0), None);
    }

    #[test]
    fn alloc_size_rounds_to_sector() {
        assert_eq!(alloc_size(1, "t").expect("fits"), 512);
        assert_eq!(alloc_size(512, "t").expect("fits"), 512);
        assert_eq!(alloc_size(513, "t").expect("fits"), 1024);
        assert_eq!(alloc_size(0, "t").expect("fits"), 0);
    }

    #[test]
    fn block_addr_end() {
        let addr = BlockAddr {
            device: DeviceId(0),
            offset: ByteOffset(1024),
            size: 512,
            gang: false,
        };
        assert_eq!(addr.end(), Some(ByteOffset(1536)));
        let huge = BlockAddr {
            offset: ByteOffset(u64::MAX),
            ..addr
        };
        assert_eq!(huge.end(), None);
    }
}
