//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking: sends are buffered by every
//! back-end, so a rank may post all sends of a round before waiting on any
//! receive without risking deadlock. Setup code calls `.wait()` before it
//! trusts that a buffer is ready.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Barrier};
use std::time::Duration;

/// Non-blocking communication interface (minimal by design).
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Rank of the calling process.
    fn rank(&self) -> usize;
    /// Number of participating processes.
    fn size(&self) -> usize;
    /// Block until every rank has reached the same barrier.
    fn barrier(&self);

    /// `true` for the serial no-op back-end.
    fn is_no_comm(&self) -> bool {
        false
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Typed message tag. Every protocol phase derives its own tag with [`CommTag::offset`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(base: u16) -> Self {
        Self(base)
    }
    pub const fn base(self) -> u16 {
        self.0
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// Tag `n` steps above this one (wrapping).
    pub const fn offset(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }
}

/// Compile-time no-op comm for pure serial runs and unit tests.
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

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) {}
    fn is_no_comm(&self) -> bool {
        true
    }
}

// --- RayonComm: intra-process / multi-thread ---
type Key = (usize, usize, u16); // (src, dst, tag)

/// Shared state of one in-process world: FIFO mailbox per key plus a barrier.
struct World {
    mailbox: DashMap<Key, VecDeque<Bytes>>,
    gate: Mutex<()>,
    arrived: Condvar,
    barrier: Barrier,
}

impl World {
    fn new(size: usize) -> Self {
        Self {
            mailbox: DashMap::new(),
            gate: Mutex::new(()),
            arrived: Condvar::new(),
            barrier: Barrier::new(size),
        }
    }

    fn post(&self, key: Key, data: Bytes) {
        self.mailbox.entry(key).or_default().push_back(data);
        let _guard = self.gate.lock();
        self.arrived.notify_all();
    }

    fn try_take(&self, key: &Key) -> Option<Bytes> {
        self.mailbox.get_mut(key).and_then(|mut q| q.pop_front())
    }

    fn take_blocking(&self, key: Key) -> Bytes {
        let mut guard = self.gate.lock();
        loop {
            if let Some(bytes) = self.try_take(&key) {
                return bytes;
            }
            self.arrived.wait_for(&mut guard, Duration::from_millis(10));
        }
    }
}

/// Receive handle of [`RayonComm`]; the message is dequeued in `wait`.
pub struct LocalHandle {
    world: Arc<World>,
    key: Key,
    len: usize,
}

impl Wait for LocalHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let bytes = self.world.take_blocking(self.key);
        let n = self.len.min(bytes.len());
        Some(bytes[..n].to_vec())
    }
}

/// In-process communicator: one instance per simulated rank, each driven by its own thread.
#[derive(Clone)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    world: Arc<World>,
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
    /// Build an isolated world of `size` ranks sharing one mailbox.
    ///
    /// Worlds never see each other's messages, so independent tests can run
    /// concurrently.
    pub fn world(size: usize) -> Vec<RayonComm> {
        let world = Arc::new(World::new(size.max(1)));
        (0..size)
            .map(|rank| RayonComm {
                rank,
                size,
                world: Arc::clone(&world),
            })
            .collect()
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        log::trace!("rank {} -> {} tag {:#06x}: {} bytes", self.rank, peer, tag, buf.len());
        self.world
            .post((self.rank, peer, tag), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        LocalHandle {
            world: Arc::clone(&self.world),
            key: (peer, self.rank, tag),
            len: buf.len(),
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
    fn barrier(&self) {
        self.world.barrier.wait();
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// MPI communicator over `MPI_COMM_WORLD`.
    ///
    /// The caller keeps the `mpi::environment::Universe` returned by
    /// `mpi::initialize()` alive for as long as this value is used.
    #[derive(Clone, Debug)]
    pub struct MpiComm {
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        /// Returns `None` when MPI has not been initialized.
        pub fn new() -> Option<Self> {
            if !mpi::environment::is_initialized() {
                return None;
            }
            let world = SimpleCommunicator::world();
            Some(Self {
                rank: world.rank() as usize,
                size: world.size() as usize,
            })
        }
    }

    /// Send handle owning a leaked copy of the payload until completion.
    pub struct MpiSendHandle {
        req: Request<'static, [u8], StaticScope>,
        buf: *mut [u8],
    }

    impl Wait for MpiSendHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            // SAFETY: `buf` came from `Box::leak` in `isend` and the request
            // that borrowed it has completed.
            unsafe { drop(Box::from_raw(self.buf)) };
            None
        }
    }

    /// Receive handle; the blocking receive happens in `wait`.
    pub struct MpiRecvHandle {
        peer: i32,
        tag: i32,
        len: usize,
    }

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let world = SimpleCommunicator::world();
            let (mut data, _status) = world
                .process_at_rank(self.peer)
                .receive_vec_with_tag::<u8>(self.tag);
            data.truncate(self.len);
            Some(data)
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let leaked: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let ptr: *mut [u8] = leaked;
            // SAFETY: the leaked buffer lives until `MpiSendHandle::wait` frees it.
            let shared: &'static [u8] = unsafe { &*ptr };
            let world = SimpleCommunicator::world();
            let req = world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, shared, tag as i32);
            MpiSendHandle { req, buf: ptr }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiRecvHandle {
            MpiRecvHandle {
                peer: peer as i32,
                tag: tag as i32,
                len: buf.len(),
            }
        }

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }
        fn barrier(&self) {
            SimpleCommunicator::world().barrier();
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
