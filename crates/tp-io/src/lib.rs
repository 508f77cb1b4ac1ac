#![forbid(unsafe_code)]
//! Staged I/O pipeline for the tidepool storage engine.
//!
//! Turns logical block operations (read, write, free, claim) into
//! physical device operations via an explicit stage state machine:
//! compression, checksumming, nop-write elision, deduplication, gang
//! splitting for fragmented pools, extent allocation, and per-device
//! scheduled issue — with parent/child dependency tracking, a single
//! bounded device retry, and pool-wide suspend/resume for failures that
//! a retry would only repeat.
//!
//! # Shape
//!
//! - [`engine::Engine`] — the explicitly-constructed context everything
//!   runs in: devices + schedulers, allocator, dedup table, worker pool,
//!   suspend state.
//! - [`io::BlockIo`] — one request; shared between caller, scheduler,
//!   and the dependency graph.
//! - [`stage`] — the fixed stage order and per-operation pipelines.
//! - [`transform`] — compression and sub-range transforms with their
//!   read-side inverse stack.
//! - [`gang`] — header block encoding and split policy.
//! - [`dedup`] — the shared content-checksum table.
//!
//! Parents never poll children: a request that must wait registers a
//! `(child-type, phase)` counter and the last relevant child completion
//! re-drives it.

pub mod dedup;
pub mod engine;
pub mod gang;
pub mod io;
pub mod stage;
pub mod suspend;
pub mod taskq;
pub mod transform;

pub use dedup::{DedupPolicy, DedupRelease, DedupTable};
pub use engine::{DeviceHandle, Engine, EngineConfig, EngineStatsSnapshot, Failmode};
pub use io::{BlockIo, ChildType, DoneFn, Flow, IoFlags, IoOp, Phase, ReadyFn, WriteProps};
pub use stage::{IoStage, StageMask};
pub use suspend::SuspendState;
pub use taskq::TaskPool;
pub use transform::Transform;
