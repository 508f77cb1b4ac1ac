#![forbid(unsafe_code)]
//! Error types for the tidepool storage engine.
//!
//! # Error Taxonomy
//!
//! Every failure the engine can surface falls into one of five classes:
//!
//! | Class | Variants | Recovery |
//! |-------|----------|----------|
//! | Device | `Io` | transient; bounded retry through the scheduler |
//! | Integrity | `ChecksumMismatch` | fall back to another replica or the primary store |
//! | Resource | `NoSpace` | caller-visible; triggers gang splitting on writes |
//! | Protocol | `Protocol` | malformed request or unsupported operation; never retried |
//! | Coordination | `Invariant` | lock-order or refcount violation; always fatal, never masked |
//!
//! Two additional variants are plumbing rather than taxonomy: `Suspended`
//! (the pool parked a failed request tree and an operator gave up on it)
//! and `WouldBlock` (a non-blocking cache probe found I/O in flight).
//!
//! # Ranking
//!
//! A parent request inherits the *worst* error among its children.
//! [`EngineError::rank`] defines that order exhaustively — no wildcard
//! arm, so a new variant is a compile error until it is ranked. Integrity
//! outranks device errors: a checksum mismatch proves the data is wrong,
//! while an I/O error merely failed to fetch it.
//!
//! # Design Constraints
//!
//! - This crate depends on nothing else in the workspace (no cycles).
//! - String payloads are owned so errors cross thread boundaries freely.

use thiserror::Error;

/// Unified error type for all tidepool operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Physical I/O failed at the device layer (may be transient).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Read verification failed: stored checksum does not match payload.
    #[error("checksum mismatch at device {device} offset {offset}: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch {
        device: u64,
        offset: u64,
        /// Low 64 bits of the expected content checksum.
        expected: u64,
        /// Low 64 bits of the recomputed checksum.
        actual: u64,
    },

    /// The allocator could not satisfy a contiguous allocation.
    #[error("no space left in pool")]
    NoSpace,

    /// Malformed request or unsupported operation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Internal invariant violated (lock order, refcount, stage order).
    ///
    /// Always fatal. Code that catches errors must never downgrade or
    /// swallow this variant.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The pool is suspended and the request tree was abandoned.
    #[error("pool suspended")]
    Suspended,

    /// A non-blocking lookup found an I/O already in flight.
    #[error("operation would block on in-flight I/O")]
    WouldBlock,
}

impl EngineError {
    /// Worst-error-wins severity. Parents keep the highest-ranked error
    /// among their children. Exhaustive by construction.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Invariant(_) => 7,
            Self::ChecksumMismatch { .. } => 6,
            Self::Io(_) => 5,
            Self::NoSpace => 4,
            Self::Suspended => 3,
            Self::Protocol(_) => 2,
            Self::WouldBlock => 1,
        }
    }

    /// Only coordination errors are fatal to the process.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }

    /// Device errors are candidates for one boosted retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Keep the worse of two errors (see [`rank`](Self::rank)).
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl Clone for EngineError {
    fn clone(&self) -> Self {
        match self {
            // io::Error is not Clone; preserve kind and text.
            Self::Io(err) => Self::Io(std::io::Error::new(err.kind(), err.to_string())),
            Self::ChecksumMismatch {
                device,
                offset,
                expected,
                actual,
            } => Self::ChecksumMismatch {
                device: *device,
                offset: *offset,
                expected: *expected,
                actual: *actual,
            },
            Self::NoSpace => Self::NoSpace,
            Self::Protocol(s) => Self::Protocol(s.clone()),
            Self::Invariant(s) => Self::Invariant(s.clone()),
            Self::Suspended => Self::Suspended,
            Self::WouldBlock => Self::WouldBlock,
        }
    }
}

/// Result alias using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn io_err() -> EngineError {
        EngineError::Io(std::io::Error::other("disk fell over"))
    }

    fn mismatch() -> EngineError {
        EngineError::ChecksumMismatch {
            device: 1,
            offset: 4096,
            expected: 0xDEAD,
            actual: 0xBEEF,
        }
    }

    #[test]
    fn ranking_is_strictly_ordered() {
        let ordered = [
            EngineError::WouldBlock,
            EngineError::Protocol("bad op".into()),
            EngineError::Suspended,
            EngineError::NoSpace,
            io_err(),
            mismatch(),
            EngineError::Invariant("refcount underflow".into()),
        ];
        for pair in ordered.windows(2) {
            assert!(
                pair[0].rank() < pair[1].rank(),
                "{:?} must rank below {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn integrity_outranks_device() {
        assert!(mismatch().rank() > io_err().rank());
        let worst = io_err().worst(mismatch());
        assert!(matches!(worst, EngineError::ChecksumMismatch { .. }));
        // Ties keep the incumbent.
        let kept = EngineError::NoSpace.worst(EngineError::NoSpace);
        assert!(matches!(kept, EngineError::NoSpace));
    }

    #[test]
    fn only_invariant_is_fatal() {
        assert!(EngineError::Invariant("x".into()).is_fatal());
        assert!(!io_err().is_fatal());
        assert!(!mismatch().is_fatal());
        assert!(!EngineError::NoSpace.is_fatal());
    }

    #[test]
    fn only_io_is_retryable() {
        assert!(io_err().is_retryable());
        assert!(!mismatch().is_retryable());
        assert!(!EngineError::Suspended.is_retryable());
    }

    #[test]
    fn clone_preserves_io_kind() {
        let original = EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "slow device",
        ));
        let cloned = original.clone();
        match cloned {
            EngineError::Io(err) => {
                assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
                assert!(err.to_string().contains("slow device"));
            }
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn display_formatting() {
        assert_eq!(EngineError::NoSpace.to_string(), "no space left in pool");
        assert!(mismatch().to_string().contains("checksum mismatch"));
        assert!(mismatch().to_string().contains("000000000000dead"));
        assert_eq!(EngineError::Suspended.to_string(), "pool suspended");
    }
}
