//! Gang header blocks.
//!
//! When the allocator cannot produce one contiguous extent for a write,
//! the payload is split into up to [`GANG_FANOUT`] children and a small
//! header block records their pointers. Children may themselves be gang
//! headers, so arbitrarily fragmented pools still make progress.
//!
//! The header occupies one [`GANG_HEADER_SIZE`]-byte block: a magic, a
//! child count, and each child's full block pointer, little-endian, with
//! zero padding to the block boundary. The header block is checksummed
//! like any other physical block; child payloads carry their own
//! checksums inside their pointers.

use tp_error::{EngineError, Result};
use tp_types::{
    BlockAddr, BlockPtr, ByteOffset, Checksum, ChecksumKind, CompressionKind, DeviceId, Txg,
    GANG_FANOUT, GANG_HEADER_SIZE, MAX_REPLICAS,
};

const GANG_MAGIC: u64 = 0x6761_6e67_6864_7231; // "ganghdr1"

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn get_u32(data: &[u8], cursor: &mut usize) -> Result<u32> {
    let bytes = take(data, cursor, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn get_u64(data: &[u8], cursor: &mut usize) -> Result<u64> {
    let bytes = take(data, cursor, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

fn take<'a>(data: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let start = *cursor;
    let end = start.checked_add(len).ok_or_else(|| {
        EngineError::Protocol("gang header cursor overflow".to_owned())
    })?;
    if end > data.len() {
        return Err(EngineError::Protocol(format!(
            "gang header truncated: need {len} bytes at {start}, have {}",
            data.len().saturating_sub(start)
        )));
    }
    *cursor = end;
    Ok(&data[start..end])
}

fn encode_ptr(out: &mut Vec<u8>, ptr: &BlockPtr) {
    out.push(u8::try_from(ptr.addrs.len()).expect("replica count bounded"));
    for addr in &ptr.addrs {
        put_u64(out, addr.device.0);
        put_u64(out, addr.offset.0);
        put_u32(out, addr.size);
        out.push(u8::from(addr.gang));
    }
    put_u32(out, ptr.lsize);
    put_u32(out, ptr.psize);
    out.push(match ptr.compression {
        CompressionKind::Off => 0,
        CompressionKind::Lz4 => 1,
        CompressionKind::Empty => 2,
    });
    out.push(match ptr.checksum_kind {
        ChecksumKind::Off => 0,
        ChecksumKind::Blake3 => 1,
    });
    out.push(u8::from(ptr.dedup));
    put_u64(out, ptr.birth.0);
    out.extend_from_slice(&ptr.checksum.0);
}

fn decode_ptr(data: &[u8], cursor: &mut usize) -> Result<BlockPtr> {
    let replica_count = usize::from(take(data, cursor, 1)?[0]);
    if replica_count > MAX_REPLICAS {
        return Err(EngineError::Protocol(format!(
            "gang child has {replica_count} replicas"
        )));
    }
    let mut addrs = Vec::with_capacity(replica_count);
    for _ in 0..replica_count {
        let device = DeviceId(get_u64(data, cursor)?);
        let offset = ByteOffset(get_u64(data, cursor)?);
        let size = get_u32(data, cursor)?;
        let gang = take(data, cursor, 1)?[0] != 0;
        addrs.push(BlockAddr {
            device,
            offset,
            size,
            gang,
        });
    }
    let lsize = get_u32(data, cursor)?;
    let psize = get_u32(data, cursor)?;
    let compression = match take(data, cursor, 1)?[0] {
        0 => CompressionKind::Off,
        1 => CompressionKind::Lz4,
        2 => CompressionKind::Empty,
        other => {
            return Err(EngineError::Protocol(format!(
                "unknown compression code {other} in gang header"
            )))
        }
    };
    let checksum_kind = match take(data, cursor, 1)?[0] {
        0 => ChecksumKind::Off,
        1 => ChecksumKind::Blake3,
        other => {
            return Err(EngineError::Protocol(format!(
                "unknown checksum code {other} in gang header"
            )))
        }
    };
    let dedup = take(data, cursor, 1)?[0] != 0;
    let birth = Txg(get_u64(data, cursor)?);
    let checksum_bytes = take(data, cursor, 32)?;
    let mut checksum = [0_u8; 32];
    checksum.copy_from_slice(checksum_bytes);
    Ok(BlockPtr {
        addrs,
        lsize,
        psize,
        compression,
        checksum_kind,
        dedup,
        birth,
        checksum: Checksum(checksum),
    })
}

/// Serialize child pointers into one header block.
pub fn encode_header(children: &[BlockPtr]) -> Result<Vec<u8>> {
    if children.is_empty() || children.len() > GANG_FANOUT {
        return Err(EngineError::Protocol(format!(
            "gang header takes 1..={GANG_FANOUT} children, got {}",
            children.len()
        )));
    }
    let mut out = Vec::with_capacity(usize::try_from(GANG_HEADER_SIZE).expect("fits"));
    put_u64(&mut out, GANG_MAGIC);
    out.push(u8::try_from(children.len()).expect("fanout bounded"));
    for child in children {
        encode_ptr(&mut out, child);
    }
    let target = usize::try_from(GANG_HEADER_SIZE).expect("fits");
    if out.len() > target {
        return Err(EngineError::Invariant(format!(
            "gang header overflow: {} bytes",
            out.len()
        )));
    }
    out.resize(target, 0);
    Ok(out)
}

/// Parse a header block back into child pointers.
pub fn decode_header(data: &[u8]) -> Result<Vec<BlockPtr>> {
    let mut cursor = 0_usize;
    let magic = get_u64(data, &mut cursor)?;
    if magic != GANG_MAGIC {
        return Err(EngineError::Protocol(format!(
            "bad gang header magic: {magic:#x}"
        )));
    }
    let count = usize::from(take(data, &mut cursor, 1)?[0]);
    if count == 0 || count > GANG_FANOUT {
        return Err(EngineError::Protocol(format!(
            "bad gang child count: {count}"
        )));
    }
    let mut children = Vec::with_capacity(count);
    for _ in 0..count {
        children.push(decode_ptr(data, &mut cursor)?);
    }
    Ok(children)
}

/// Split `lsize` logical bytes into at most [`GANG_FANOUT`] chunk sizes.
///
/// Chunks are as even as possible and sector aligned except the last, so
/// repeated splitting converges quickly even under heavy fragmentation.
#[must_use]
pub fn split_sizes(lsize: u32) -> Vec<u32> {
    let fanout = u32::try_from(GANG_FANOUT).expect("small");
    let raw = lsize.div_ceil(fanout);
    let align = u32::try_from(tp_types::ALLOC_ALIGN).expect("small");
    let chunk = raw.div_ceil(align) * align;
    let mut sizes = Vec::new();
    let mut remaining = lsize;
    while remaining > 0 {
        let take = remaining.min(chunk);
        sizes.push(take);
        remaining -= take;
    }
    sizes
}
