//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking; the exchange helpers call
//! `.wait()` on every handle before they trust that a buffer is ready.

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

/// Message tag for one phase of a collective operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    /// Tag used by all-gather style collectives.
    pub const ALLGATHER: CommTag = CommTag(0x0100);
    /// Tag used for coarse-mesh tree record transfers.
    pub const TREES: CommTag = CommTag(0x0200);
    /// Tag used for forest element transfers during partition.
    pub const ELEMENTS: CommTag = CommTag(0x0300);

    pub const fn new(tag: u16) -> Self {
        CommTag(tag)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// This process's index within the group.
    fn rank(&self) -> usize;
    /// Number of processes in the group.
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive for the next message from `peer` with `tag`.
    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Compile-time no-op comm for single-process runs and serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16) {}
}

// --- RayonComm: intra-process / multi-thread ---
type Key = (usize, usize, u16); // (src, dst, tag)

/// Shared FIFO mailboxes for one group of in-process ranks.
#[derive(Default)]
pub struct Mailbox {
    queues: DashMap<Key, VecDeque<Bytes>>,
    lock: Mutex<()>,
    posted: Condvar,
}

impl Mailbox {
    fn post(&self, key: Key, data: Bytes) {
        self.queues.entry(key).or_default().push_back(data);
        let _guard = self.lock.lock();
        self.posted.notify_all();
    }

    fn take(&self, key: &Key) -> Option<Bytes> {
        self.queues.get_mut(key).and_then(|mut q| q.pop_front())
    }

    fn take_blocking(&self, key: &Key) -> Bytes {
        loop {
            if let Some(bytes) = self.take(key) {
                return bytes;
            }
            let mut guard = self.lock.lock();
            // Re-check under the lock so a post between `take` and `wait` is not lost.
            if let Some(bytes) = self.take(key) {
                return bytes;
            }
            self.posted.wait(&mut guard);
        }
    }
}

static MAILBOX: Lazy<Arc<Mailbox>> = Lazy::new(|| Arc::new(Mailbox::default()));

pub struct LocalHandle {
    mailbox: Arc<Mailbox>,
    key: Key,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        Some(self.mailbox.take_blocking(&self.key).to_vec())
    }
}

/// Ranks simulated as threads of one process; messages go through a shared mailbox.
#[derive(Clone)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl std::fmt::Debug for RayonComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl RayonComm {
    /// Rank `rank` of `size`, on the process-global mailbox.
    pub fn new(rank: usize, size: usize) -> Self {
        Self {
            rank,
            size,
            mailbox: MAILBOX.clone(),
        }
    }

    /// Build `size` ranks sharing a private mailbox, isolated from other groups.
    pub fn group(size: usize) -> Vec<Self> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                mailbox: mailbox.clone(),
            })
            .collect()
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        self.mailbox
            .post((self.rank, peer, tag), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16) -> Self::RecvHandle {
        LocalHandle {
            mailbox: self.mailbox.clone(),
            key: (peer, self.rank, tag),
        }
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    struct MpiWorld {
        world: SimpleCommunicator,
        _universe: Universe,
    }

    // MPI calls are issued from the thread that initialised MPI; the engine
    // never touches a communicator from more than one thread.
    unsafe impl Send for MpiWorld {}
    unsafe impl Sync for MpiWorld {}

    /// World communicator; keeps the MPI universe alive while any handle exists.
    #[derive(Clone)]
    pub struct MpiComm {
        inner: Arc<MpiWorld>,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        /// Initialise MPI and wrap the world communicator. Returns `None` if
        /// MPI was already initialised.
        pub fn new() -> Option<Self> {
            let universe = mpi::initialize()?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Some(Self {
                inner: Arc::new(MpiWorld {
                    world,
                    _universe: universe,
                }),
                rank,
                size,
            })
        }
    }

    pub struct MpiSendHandle {
        request: Request<'static, [u8], StaticScope>,
        buf: *mut [u8],
    }

    impl Wait for MpiSendHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.request.wait();
            // SAFETY: `buf` came from `Box::into_raw` in `isend` and the only
            // request borrowing it has completed.
            drop(unsafe { Box::from_raw(self.buf) });
            None
        }
    }

    pub struct MpiRecvHandle {
        inner: Arc<MpiWorld>,
        peer: i32,
        tag: i32,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let (data, _status) = self
                .inner
                .world
                .process_at_rank(self.peer)
                .receive_vec_with_tag::<u8>(self.tag);
            Some(data)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let ptr = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: the allocation stays alive until `MpiSendHandle::wait` frees it.
            let data: &'static [u8] = unsafe { &*ptr };
            let request = self
                .inner
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, tag as i32);
            MpiSendHandle { request, buf: ptr }
        }

        fn irecv(&self, peer: usize, tag: u16) -> MpiRecvHandle {
            MpiRecvHandle {
                inner: self.inner.clone(),
                peer: peer as i32,
                tag: tag as i32,
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
