#![forbid(unsafe_code)]
//! Leaf device layer: the capability trait the rest of the engine issues
//! physical I/O against, plus the per-device priority scheduler.
//!
//! Provides [`Device`] (open/read/write/flush/discard), a file-backed
//! implementation using `pread`/`pwrite` semantics, an in-memory fault-
//! injecting test device, and [`queue::DeviceQueue`], which orders,
//! aggregates, and throttles the physical operations.
//!
//! The capability set is a small closed family selected once at attach
//! time; nothing downstream branches on the concrete device type.

pub mod queue;

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tp_error::{EngineError, Result};
use tp_types::ByteOffset;
use tracing::debug;

/// Byte-addressed leaf device with fixed-offset I/O.
///
/// Implementations must be safe for concurrent calls; the scheduler bounds
/// how many operations are outstanding, not the driver.
pub trait Device: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset`.
    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`.
    fn write_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn flush(&self) -> Result<()>;

    /// Hint that `[offset, offset+len)` no longer holds live data.
    fn discard(&self, _offset: ByteOffset, _len: u64) -> Result<()> {
        Ok(())
    }
}

/// Cumulative per-device I/O counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DeviceStats {
    pub reads: u64,
    pub writes: u64,
    pub flushes: u64,
    pub discards: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_errors: u64,
    pub write_errors: u64,
}

fn check_range(offset: ByteOffset, len: usize, device_len: u64) -> Result<()> {
    let len = u64::try_from(len)
        .map_err(|_| EngineError::Protocol("I/O length overflows u64".to_owned()))?;
    let end = offset
        .checked_add(len)
        .ok_or_else(|| EngineError::Protocol("I/O range overflows u64".to_owned()))?;
    if end.0 > device_len {
        return Err(EngineError::Protocol(format!(
            "I/O out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

// ── File-backed device ──────────────────────────────────────────────────────

/// File-backed device using thread-safe positional I/O (`FileExt`), so no
/// shared seek cursor exists.
pub struct FileDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
    stats: Mutex<DeviceStats>,
}

impl FileDevice {
    /// Open read-write if possible, read-only otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        debug!(len, writable, "file_device_open");
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
            stats: Mutex::new(DeviceStats::default()),
        })
    }

    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        self.stats.lock().clone()
    }
}

impl std::fmt::Debug for FileDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDevice")
            .field("len", &self.len)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

impl Device for FileDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        check_range(offset, buf.len(), self.len)?;
        match self.file.read_exact_at(buf, offset.0) {
            Ok(()) => {
                let mut s = self.stats.lock();
                s.reads += 1;
                s.bytes_read += u64::try_from(buf.len()).unwrap_or(0);
                Ok(())
            }
            Err(err) => {
                self.stats.lock().read_errors += 1;
                Err(EngineError::Io(err))
            }
        }
    }

    fn write_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        if !self.writable {
            return Err(EngineError::Protocol(
                "write to read-only device".to_owned(),
            ));
        }
        check_range(offset, buf.len(), self.len)?;
        match self.file.write_all_at(buf, offset.0) {
            Ok(()) => {
                let mut s = self.stats.lock();
                s.writes += 1;
                s.bytes_written += u64::try_from(buf.len()).unwrap_or(0);
                Ok(())
            }
            Err(err) => {
                self.stats.lock().write_errors += 1;
                Err(EngineError::Io(err))
            }
        }
    }

    fn flush(&self) -> Result<()> {
        self.stats.lock().flushes += 1;
        self.file.sync_all().map_err(EngineError::Io)
    }
}

// ── In-memory device (tests, secondary-cache benches) ───────────────────────

/// Fault plan for [`MemDevice`]: fail the nth read or write (0-based,
/// counted per direction) once, or every operation in a direction until
/// the plan is replaced.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultPlan {
    pub fail_read_nth: Option<u64>,
    pub fail_write_nth: Option<u64>,
    pub fail_all_reads: bool,
    pub fail_all_writes: bool,
}

/// In-memory device. Records an operation trace and supports one-shot
/// fault injection so pipeline retry and fallback paths are testable.
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    stats: Mutex<DeviceStats>,
    faults: Mutex<FaultPlan>,
    trace: Mutex<Vec<(char, u64, usize)>>,
}

impl MemDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0_u8; len]),
            stats: Mutex::new(DeviceStats::default()),
            faults: Mutex::new(FaultPlan::default()),
            trace: Mutex::new(Vec::new()),
        }
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        *self.faults.lock() = plan;
    }

    /// Recorded `(direction, offset, len)` trace, in completion order.
    #[must_use]
    pub fn trace(&self) -> Vec<(char, u64, usize)> {
        self.trace.lock().clone()
    }

    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        self.stats.lock().clone()
    }

    fn injected(&self, read: bool, count_so_far: u64) -> bool {
        let mut plan = self.faults.lock();
        if (read && plan.fail_all_reads) || (!read && plan.fail_all_writes) {
            return true;
        }
        let slot = if read {
            &mut plan.fail_read_nth
        } else {
            &mut plan.fail_write_nth
        };
        if *slot == Some(count_so_far) {
            *slot = None;
            return true;
        }
        false
    }
}

impl std::fmt::Debug for MemDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDevice")
            .field("len", &self.data.lock().len())
            .finish_non_exhaustive()
    }
}

impl Device for MemDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.data.lock().len()).unwrap_or(0)
    }

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        check_range(offset, buf.len(), u64::try_from(data.len()).unwrap_or(0))?;
        let reads_so_far = self.stats.lock().reads;
        if self.injected(true, reads_so_far) {
            self.stats.lock().read_errors += 1;
            return Err(EngineError::Io(std::io::Error::other("injected read fault")));
        }
        let start = offset.to_usize().map_err(|_| {
            EngineError::Protocol("offset does not fit usize".to_owned())
        })?;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        drop(data);
        let mut s = self.stats.lock();
        s.reads += 1;
        s.bytes_read += u64::try_from(buf.len()).unwrap_or(0);
        drop(s);
        self.trace.lock().push(('r', offset.0, buf.len()));
        Ok(())
    }

    fn write_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        check_range(offset, buf.len(), u64::try_from(data.len()).unwrap_or(0))?;
        let writes_so_far = self.stats.lock().writes;
        if self.injected(false, writes_so_far) {
            self.stats.lock().write_errors += 1;
            return Err(EngineError::Io(std::io::Error::other(
                "injected write fault",
            )));
        }
        let start = offset.to_usize().map_err(|_| {
            EngineError::Protocol("offset does not fit usize".to_owned())
        })?;
        data[start..start + buf.len()].copy_from_slice(buf);
        drop(data);
        let mut s = self.stats.lock();
        s.writes += 1;
        s.bytes_written += u64::try_from(buf.len()).unwrap_or(0);
        drop(s);
        self.trace.lock().push(('w', offset.0, buf.len()));
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.stats.lock().flushes += 1;
        self.trace.lock().push(('f', 0, 0));
        Ok(())
    }

    fn discard(&self, offset: ByteOffset, len: u64) -> Result<()> {
        let mut data = self.data.lock();
        let device_len = u64::try_from(data.len()).unwrap_or(0);
        let len_usize = usize::try_from(len)
            .map_err(|_| EngineError::Protocol("discard length overflows usize".to_owned()))?;
        check_range(offset, len_usize, device_len)?;
        let start = offset.to_usize().map_err(|_| {
            EngineError::Protocol("offset does not fit usize".to_owned())
        })?;
        data[start..start + len_usize].fill(0);
        drop(data);
        self.stats.lock().discards += 1;
        self.trace.lock().push(('d', offset.0, len_usize));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_roundtrip() {
        let dev = MemDevice::new(8192);
        dev.write_at(ByteOffset(4096), &[0xAB; 512]).expect("write");
        let mut buf = [0_u8; 512];
        dev.read_at(ByteOffset(4096), &mut buf).expect("read");
        assert_eq!(buf, [0xAB; 512]);

        let stats = dev.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_written, 512);
    }

    #[test]
    fn mem_device_out_of_bounds() {
        let dev = MemDevice::new(1024);
        let mut buf = [0_u8; 1024];
        let err = dev.read_at(ByteOffset(512), &mut buf).expect_err("oob");
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn mem_device_fault_injection_is_one_shot() {
        let dev = MemDevice::new(4096);
        dev.set_faults(FaultPlan {
            fail_write_nth: Some(1),
            ..FaultPlan::default()
        });

        dev.write_at(ByteOffset(0), &[1; 512]).expect("write 0");
        let err = dev.write_at(ByteOffset(512), &[2; 512]).expect_err("nth");
        assert!(matches!(err, EngineError::Io(_)));
        // Retry of the same write succeeds: the fault fires once.
        dev.write_at(ByteOffset(512), &[2; 512]).expect("retry");
    }

    #[test]
    fn mem_device_discard_zeroes() {
        let dev = MemDevice::new(2048);
        dev.write_at(ByteOffset(0), &[0xFF; 1024]).expect("write");
        dev.discard(ByteOffset(512), 512).expect("discard");
        let mut buf = [0_u8; 1024];
        dev.read_at(ByteOffset(0), &mut buf).expect("read");
        assert_eq!(&buf[..512], &[0xFF; 512][..]);
        assert_eq!(&buf[512..], &[0_u8; 512][..]);
    }

    #[test]
    fn file_device_roundtrip_and_stats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dev.img");
        std::fs::write(&path, vec![0_u8; 8192]).expect("create");

        let dev = FileDevice::open(&path).expect("open");
        assert_eq!(dev.len_bytes(), 8192);

        dev.write_at(ByteOffset(1024), &[0x42; 256]).expect("write");
        let mut buf = [0_u8; 256];
        dev.read_at(ByteOffset(1024), &mut buf).expect("read");
        assert_eq!(buf, [0x42; 256]);
        dev.flush().expect("flush");

        let stats = dev.stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.flushes, 1);
    }

    #[test]
    fn file_device_write_out_of_bounds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("small.img");
        std::fs::write(&path, vec![0_u8; 1024]).expect("create");

        let dev = FileDevice::open(&path).expect("open");
        let err = dev
            .write_at(ByteOffset(1000), &[0_u8; 100])
            .expect_err("oob");
        assert!(matches!(err, EngineError::Protocol(_)));
    }
}
