//! Backend export surface for protocol front-ends.
//!
//! A SCSI target (or any other block front-end) pushes logical
//! operations into the pool with [`Backend::submit`] and gets notified
//! when the operation completes. Read payloads stay parked inside the
//! backend — holding their cache reference — until the front-end has
//! moved the data out and calls [`Backend::data_move_done`], which is
//! the moment the buffer reference is released. This mirrors the
//! two-phase data-movement handshake such front-ends use internally;
//! the protocol machinery itself lives outside this crate.

use crate::Pool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tp_cache::DataBuf;
use tp_error::EngineError;
use tp_io::WriteProps;
use tp_types::{BlockPtr, ContentClass, DeviceId, IoClass};
use tracing::trace;

/// Opaque handle for one submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// One logical operation from a front-end.
pub enum BackendOp {
    Read {
        ptr: BlockPtr,
        class: ContentClass,
    },
    Write {
        data: Vec<u8>,
        class: ContentClass,
        props: WriteProps,
    },
    Free {
        ptr: BlockPtr,
    },
    Flush {
        device: DeviceId,
    },
}

/// Completion delivered to the front-end.
#[derive(Debug)]
pub enum BackendReply {
    /// Payload is parked; fetch it with [`Backend::with_data`] and
    /// release it with [`Backend::data_move_done`].
    Read { len: usize },
    Written { ptr: BlockPtr },
    Freed,
    Flushed,
}

pub type BackendNotify =
    Box<dyn FnOnce(Token, std::result::Result<BackendReply, EngineError>) + Send>;

struct Parked {
    buf: DataBuf,
}

/// The queue between a front-end and the pool.
pub struct Backend {
    pool: Arc<Pool>,
    next_token: AtomicU64,
    parked: Mutex<HashMap<Token, Parked>>,
}

impl Backend {
    #[must_use]
    pub fn new(pool: Arc<Pool>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            next_token: AtomicU64::new(1),
            parked: Mutex::new(HashMap::new()),
        })
    }

    /// Queue one operation. Returns immediately; `notify` fires on
    /// completion (possibly before this returns, for cache hits).
    pub fn submit(self: &Arc<Self>, op: BackendOp, notify: BackendNotify) -> Token {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        trace!(token = token.0, "backend_submit");
        match op {
            BackendOp::Read { ptr, class } => {
                let backend = Arc::clone(self);
                self.pool.read_async(
                    &ptr,
                    class,
                    false,
                    Box::new(move |result| match result {
                        Ok(buf) => {
                            let len = buf.len();
                            backend.parked.lock().insert(token, Parked { buf });
                            notify(token, Ok(BackendReply::Read { len }));
                        }
                        Err(err) => notify(token, Err(err)),
                    }),
                );
            }
            BackendOp::Write { data, class, props } => {
                let buf = self.pool.cache().alloc_buf(data, class);
                self.pool.write_async(
                    &buf,
                    props,
                    IoClass::SyncWrite,
                    Box::new(move |result| match result {
                        Ok(ptr) => notify(token, Ok(BackendReply::Written { ptr })),
                        Err(err) => notify(token, Err(err)),
                    }),
                );
                drop(buf);
            }
            BackendOp::Free { ptr } => {
                let result = self.pool.free(&ptr);
                match result {
                    Ok(()) => notify(token, Ok(BackendReply::Freed)),
                    Err(err) => notify(token, Err(err)),
                }
            }
            BackendOp::Flush { device } => {
                let result = self.pool.flush(device);
                match result {
                    Ok(()) => notify(token, Ok(BackendReply::Flushed)),
                    Err(err) => notify(token, Err(err)),
                }
            }
        }
        token
    }

    /// Access a parked read payload.
    pub fn with_data<R>(&self, token: Token, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let parked = self.parked.lock();
        parked.get(&token).map(|p| f(p.buf.bytes()))
    }

    /// The front-end finished moving data; release the cache reference.
    pub fn data_move_done(&self, token: Token) {
        let parked = self.parked.lock().remove(&token);
        drop(parked);
        trace!(token = token.0, "backend_data_move_done");
    }

    /// Outstanding parked payloads (diagnostics).
    #[must_use]
    pub fn parked_count(&self) -> usize {
        self.parked.lock().len()
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("parked", &self.parked.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PoolConfig;
    use std::sync::mpsc;
    use std::time::Duration;
    use tp_alloc::{Allocator, RegionAllocator};
    use tp_device::MemDevice;

    fn backend() -> Arc<Backend> {
        let alloc = Arc::new(RegionAllocator::new(&[(DeviceId(1), 0, 16 << 20)]));
        let pool = Pool::new(PoolConfig::default(), alloc as Arc<dyn Allocator>);
        pool.attach_device(DeviceId(1), Arc::new(MemDevice::new(16 << 20)));
        Backend::new(pool)
    }

    #[test]
    fn write_then_read_with_data_movement() {
        let backend = backend();

        let (tx, rx) = mpsc::channel();
        backend.submit(
            BackendOp::Write {
                data: vec![0x5C; 4096],
                class: ContentClass::Data,
                props: WriteProps::default(),
            },
            Box::new(move |_token, result| {
                tx.send(result).expect("send");
            }),
        );
        let reply = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("written")
            .expect("no error");
        let BackendReply::Written { ptr } = reply else {
            panic!("expected Written, got {reply:?}");
        };

        let (tx, rx) = mpsc::channel();
        let token = backend.submit(
            BackendOp::Read {
                ptr,
                class: ContentClass::Data,
            },
            Box::new(move |token, result| {
                tx.send((token, result)).expect("send");
            }),
        );
        let (reply_token, reply) = rx.recv_timeout(Duration::from_secs(5)).expect("read");
        assert_eq!(reply_token, token);
        let BackendReply::Read { len } = reply.expect("read ok") else {
            panic!("expected Read reply");
        };
        assert_eq!(len, 4096);

        // The payload stays parked until the data movement completes.
        assert_eq!(backend.parked_count(), 1);
        let first = backend
            .with_data(token, |bytes| bytes[0])
            .expect("data parked");
        assert_eq!(first, 0x5C);
        backend.data_move_done(token);
        assert_eq!(backend.parked_count(), 0);
        assert!(backend.with_data(token, |bytes| bytes.len()).is_none());
    }

    #[test]
    fn free_and_flush_complete_inline() {
        let backend = backend();
        let (tx, rx) = mpsc::channel();
        backend.submit(
            BackendOp::Write {
                data: vec![1; 4096],
                class: ContentClass::Data,
                props: WriteProps::default(),
            },
            Box::new(move |_t, result| {
                tx.send(result).expect("send");
            }),
        );
        let BackendReply::Written { ptr } = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("written")
            .expect("ok")
        else {
            panic!("expected Written");
        };

        let (tx, rx) = mpsc::channel();
        backend.submit(
            BackendOp::Free { ptr },
            Box::new(move |_t, result| {
                tx.send(result).expect("send");
            }),
        );
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).expect("freed"),
            Ok(BackendReply::Freed)
        ));

        let (tx, rx) = mpsc::channel();
        backend.submit(
            BackendOp::Flush {
                device: DeviceId(1),
            },
            Box::new(move |_t, result| {
                tx.send(result).expect("send");
            }),
        );
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).expect("flushed"),
            Ok(BackendReply::Flushed)
        ));
    }

    #[test]
    fn read_error_is_reported_not_parked() {
        let backend = backend();
        // A pointer to space nothing ever wrote: the checksum cannot
        // match.
        let bogus = BlockPtr {
            addrs: vec![tp_types::BlockAddr {
                device: DeviceId(1),
                offset: tp_types::ByteOffset(4096),
                size: 4096,
                gang: false,
            }],
            lsize: 4096,
            psize: 4096,
            compression: tp_types::CompressionKind::Off,
            checksum_kind: tp_types::ChecksumKind::Blake3,
            dedup: false,
            birth: tp_types::Txg(1),
            checksum: tp_types::Checksum::of(b"something else entirely"),
        };
        let (tx, rx) = mpsc::channel();
        backend.submit(
            BackendOp::Read {
                ptr: bogus,
                class: ContentClass::Data,
            },
            Box::new(move |_t, result| {
                tx.send(result).expect("send");
            }),
        );
        let result = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
        assert!(matches!(result, Err(EngineError::ChecksumMismatch { .. })));
        assert_eq!(backend.parked_count(), 0);
    }
}
