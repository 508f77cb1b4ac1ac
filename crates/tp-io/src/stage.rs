//! Pipeline stages and per-request stage masks.
//!
//! Each request carries a subset of the fixed stage order, chosen at
//! creation from its operation type and flags, and refined by the early
//! init stages (a read of a gang pointer gains the gang stages, a hole
//! read sheds its device stages). Execution repeatedly advances to the
//! next selected stage; it never moves backward except for the single
//! bounded device retry, which rewinds to `DeviceStart` exactly once.

/// One pipeline stage. Discriminants are single bits so a pipeline is a
/// plain mask; declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum IoStage {
    Open = 1 << 0,
    ReadPtrInit = 1 << 1,
    WritePtrInit = 1 << 2,
    FreePtrInit = 1 << 3,
    IssueAsync = 1 << 4,
    WriteCompress = 1 << 5,
    ChecksumGenerate = 1 << 6,
    NopWrite = 1 << 7,
    DedupLookup = 1 << 8,
    DedupFree = 1 << 9,
    GangAssemble = 1 << 10,
    GangIssue = 1 << 11,
    Allocate = 1 << 12,
    FreeBlocks = 1 << 13,
    Claim = 1 << 14,
    Ready = 1 << 15,
    DeviceStart = 1 << 16,
    DeviceDone = 1 << 17,
    DeviceAssess = 1 << 18,
    ChecksumVerify = 1 << 19,
    Done = 1 << 20,
}

impl IoStage {
    pub const ALL: [Self; 21] = [
        Self::Open,
        Self::ReadPtrInit,
        Self::WritePtrInit,
        Self::FreePtrInit,
        Self::IssueAsync,
        Self::WriteCompress,
        Self::ChecksumGenerate,
        Self::NopWrite,
        Self::DedupLookup,
        Self::DedupFree,
        Self::GangAssemble,
        Self::GangIssue,
        Self::Allocate,
        Self::FreeBlocks,
        Self::Claim,
        Self::Ready,
        Self::DeviceStart,
        Self::DeviceDone,
        Self::DeviceAssess,
        Self::ChecksumVerify,
        Self::Done,
    ];

    #[must_use]
    pub fn bit(self) -> u32 {
        self as u32
    }

    /// Stage for a given bit, if it names one.
    #[must_use]
    pub fn from_bit(bit: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.bit() == bit)
    }
}

/// A subset of the stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageMask(pub u32);

impl StageMask {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn contains(self, stage: IoStage) -> bool {
        self.0 & stage.bit() != 0
    }

    #[must_use]
    pub fn with(self, stage: IoStage) -> Self {
        Self(self.0 | stage.bit())
    }

    #[must_use]
    pub fn without(self, stage: IoStage) -> Self {
        Self(self.0 & !stage.bit())
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// The next selected stage strictly after `current`.
    #[must_use]
    pub fn next_after(self, current: IoStage) -> Option<IoStage> {
        let above = self.0 & !(current.bit() | (current.bit() - 1));
        if above == 0 {
            return None;
        }
        IoStage::from_bit(1 << above.trailing_zeros())
    }
}

fn mask(stages: &[IoStage]) -> u32 {
    stages.iter().fold(0, |acc, s| acc | s.bit())
}

/// Stages every request executes.
#[must_use]
pub fn interlock_pipeline() -> StageMask {
    StageMask(mask(&[IoStage::Open, IoStage::Ready, IoStage::Done]))
}

/// Physical device leg shared by reads and writes.
#[must_use]
pub fn device_stages() -> StageMask {
    StageMask(mask(&[
        IoStage::DeviceStart,
        IoStage::DeviceDone,
        IoStage::DeviceAssess,
    ]))
}

/// Gang tree walking (reads, frees, claims of gang pointers).
#[must_use]
pub fn gang_stages() -> StageMask {
    StageMask(mask(&[IoStage::GangAssemble, IoStage::GangIssue]))
}

/// Logical read: init may add gang stages or shed the device leg.
#[must_use]
pub fn read_pipeline() -> StageMask {
    interlock_pipeline()
        .with(IoStage::ReadPtrInit)
        .union(device_stages())
        .with(IoStage::ChecksumVerify)
}

/// Logical write. `nop_write` and `dedup` are caller properties.
#[must_use]
pub fn write_pipeline(nop_write: bool, dedup: bool) -> StageMask {
    let mut pipeline = interlock_pipeline()
        .with(IoStage::WritePtrInit)
        .with(IoStage::WriteCompress)
        .with(IoStage::ChecksumGenerate)
        .with(IoStage::Allocate)
        .union(device_stages());
    if nop_write {
        pipeline = pipeline.with(IoStage::NopWrite);
    }
    if dedup {
        pipeline = pipeline.with(IoStage::DedupLookup);
    }
    pipeline
}

/// Free: no device I/O unless the pointer turns out to be a gang header.
#[must_use]
pub fn free_pipeline() -> StageMask {
    interlock_pipeline()
        .with(IoStage::FreePtrInit)
        .with(IoStage::FreeBlocks)
}

/// Claim (log replay).
#[must_use]
pub fn claim_pipeline() -> StageMask {
    interlock_pipeline()
        .with(IoStage::FreePtrInit)
        .with(IoStage::Claim)
}

/// Device flush barrier.
#[must_use]
pub fn flush_pipeline() -> StageMask {
    interlock_pipeline().union(device_stages())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_bits_are_distinct_and_ordered() {
        for pair in IoStage::ALL.windows(2) {
            assert!(pair[0].bit() < pair[1].bit());
        }
        let all = IoStage::ALL.iter().fold(0_u32, |acc, s| {
            assert_eq!(acc & s.bit(), 0, "{s:?} bit reused");
            acc | s.bit()
        });
        assert_eq!(all.count_ones(), 21);
    }

    #[test]
    fn next_after_walks_selected_stages_only() {
        let pipeline = read_pipeline();
        assert_eq!(pipeline.next_after(IoStage::Open), Some(IoStage::ReadPtrInit));
        // Write stages are not selected; the walk skips to Ready.
        assert_eq!(
            pipeline.next_after(IoStage::ReadPtrInit),
            Some(IoStage::Ready)
        );
        assert_eq!(
            pipeline.next_after(IoStage::DeviceAssess),
            Some(IoStage::ChecksumVerify)
        );
        assert_eq!(pipeline.next_after(IoStage::Done), None);
    }

    #[test]
    fn next_after_from_unselected_stage() {
        // Rewinding for retry sets the cursor to a stage that may not be
        // in the mask; the walk must still find the next selected one.
        let pipeline = read_pipeline().without(IoStage::ChecksumVerify);
        assert_eq!(
            pipeline.next_after(IoStage::Ready),
            Some(IoStage::DeviceStart)
        );
        assert_eq!(pipeline.next_after(IoStage::DeviceAssess), Some(IoStage::Done));
    }

    #[test]
    fn write_pipeline_options() {
        let plain = write_pipeline(false, false);
        assert!(!plain.contains(IoStage::NopWrite));
        assert!(!plain.contains(IoStage::DedupLookup));
        assert!(plain.contains(IoStage::WriteCompress));
        assert!(plain.contains(IoStage::Allocate));

        let full = write_pipeline(true, true);
        assert!(full.contains(IoStage::NopWrite));
        assert!(full.contains(IoStage::DedupLookup));
    }

    #[test]
    fn free_pipeline_has_no_device_leg() {
        let pipeline = free_pipeline();
        assert!(!pipeline.contains(IoStage::DeviceStart));
        assert!(pipeline.contains(IoStage::FreeBlocks));
        assert!(pipeline.contains(IoStage::Done));
    }
}
