//! Reversible data transforms applied between a request's logical buffer
//! and the bytes that hit the device.
//!
//! The write side applies transforms eagerly (compression happens in its
//! own stage); the read side records what must be undone on a stack and
//! pops it once the physical payload has been checksum-verified.

use tp_error::{EngineError, Result};
use tp_types::{alloc_size, u64_to_usize, CompressionKind};

/// One recorded inverse step for a read.
#[derive(Debug, Clone)]
pub enum Transform {
    /// Payload was compressed; inflate back to `lsize`.
    Decompress { kind: CompressionKind, lsize: u32 },
    /// The wanted logical bytes are a sub-range of the fetched block.
    Subrange { offset: u32, len: u32 },
}

/// Returns `true` for an all-zero payload (stored as nothing at all).
#[must_use]
pub fn is_zeroes(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

/// Compress `data`, keeping the result only when it is strictly smaller
/// after allocation rounding — otherwise compression buys nothing on the
/// device and costs a transform on every read.
#[must_use]
pub fn compress(kind: CompressionKind, data: &[u8]) -> Option<Vec<u8>> {
    match kind {
        CompressionKind::Off | CompressionKind::Empty => None,
        CompressionKind::Lz4 => {
            let compressed = lz4_flex::block::compress(data);
            let logical = u64::try_from(data.len()).ok()?;
            let physical = u64::try_from(compressed.len()).ok()?;
            let logical_alloc = tp_types::align_up(logical, tp_types::ALLOC_ALIGN)?;
            let physical_alloc = tp_types::align_up(physical, tp_types::ALLOC_ALIGN)?;
            (physical_alloc < logical_alloc).then_some(compressed)
        }
    }
}

/// Inflate a compressed payload back to exactly `lsize` bytes.
pub fn decompress(kind: CompressionKind, data: &[u8], lsize: u32) -> Result<Vec<u8>> {
    let lsize_usize = u64_to_usize(u64::from(lsize), "logical size")
        .map_err(|e| EngineError::Protocol(e.to_string()))?;
    match kind {
        CompressionKind::Off => Ok(data.to_vec()),
        CompressionKind::Empty => Ok(vec![0_u8; lsize_usize]),
        CompressionKind::Lz4 => {
            let out = lz4_flex::block::decompress(data, lsize_usize).map_err(|e| {
                EngineError::Protocol(format!("lz4 inflate failed: {e}"))
            })?;
            if out.len() != lsize_usize {
                return Err(EngineError::Protocol(format!(
                    "inflated size mismatch: got {}, expected {lsize}",
                    out.len()
                )));
            }
            Ok(out)
        }
    }
}

/// Pop a read's transform stack, turning the physical payload into the
/// logical bytes the caller asked for.
pub fn apply_read_transforms(stack: &[Transform], payload: Vec<u8>) -> Result<Vec<u8>> {
    let mut bytes = payload;
    for transform in stack.iter().rev() {
        bytes = match transform {
            Transform::Decompress { kind, lsize } => decompress(*kind, &bytes, *lsize)?,
            Transform::Subrange { offset, len } => {
                let start = u64_to_usize(u64::from(*offset), "subrange offset")
                    .map_err(|e| EngineError::Protocol(e.to_string()))?;
                let want = u64_to_usize(u64::from(*len), "subrange length")
                    .map_err(|e| EngineError::Protocol(e.to_string()))?;
                let end = start.checked_add(want).ok_or_else(|| {
                    EngineError::Protocol("subrange overflows".to_owned())
                })?;
                if end > bytes.len() {
                    return Err(EngineError::Protocol(format!(
                        "subrange [{start}, {end}) outside payload of {}",
                        bytes.len()
                    )));
                }
                bytes[start..end].to_vec()
            }
        };
    }
    Ok(bytes)
}

/// Physical size a payload will occupy given a compression decision.
pub fn physical_size(compressed: Option<&Vec<u8>>, lsize: u32) -> Result<u32> {
    match compressed {
        Some(bytes) => u32::try_from(bytes.len())
            .map_err(|_| EngineError::Protocol("compressed payload exceeds u32".to_owned())),
        None => Ok(lsize),
    }
}

/// Allocation size helper with engine error mapping.
pub fn allocation_size(psize: u32) -> Result<u32> {
    alloc_size(psize, "physical size").map_err(|e| EngineError::Protocol(e.to_string()))
}
