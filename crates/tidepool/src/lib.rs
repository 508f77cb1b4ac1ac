#![forbid(unsafe_code)]
//! Tidepool public API facade.
//!
//! Re-exports the pool context and the building blocks beneath it
//! through one stable external interface. Downstream consumers (export
//! drivers, harnesses) depend on this crate.

pub use tp_pool::backend::{Backend, BackendOp, BackendReply, Token};
pub use tp_pool::{Pool, PoolConfig, PoolStats};

pub use tp_cache::{
    BlockCache, CacheConfig, CacheState, DataBuf, MemoryPressure, NoPressure, SettablePressure,
};
pub use tp_io::{DedupPolicy, Engine, EngineConfig, Failmode, IoFlags, WriteProps};

pub use tp_alloc::{Allocator, RegionAllocator};
pub use tp_device::{Device, FileDevice, MemDevice};
pub use tp_error::{EngineError, Result};
pub use tp_types::{
    BlockAddr, BlockIdentity, BlockPtr, ByteOffset, Checksum, ChecksumKind, CompressionKind,
    ContentClass, DeviceId, IoClass, Txg,
};
