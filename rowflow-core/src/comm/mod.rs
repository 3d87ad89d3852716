//! Parallel substrate adapter.
//!
//! All cross-rank coordination in rowflow goes through the [`Communicator`]
//! trait. The rest of the crate never inspects the substrate directly: the
//! data manager, generator, and stages see only `rank`, `size`, and a small
//! set of collectives. When no substrate is present the [`LocalComm`] stub
//! reports rank 0 of size 1 and every collective is the identity.
//!
//! [`SharedComm`] provides an in-process group of thread-ranks that
//! synchronize through a shared rendezvous. It backs the multi-rank tests
//! and marks the seam where a real message-passing binding would plug in.

mod local;
mod shared;

pub use local::LocalComm;
pub use shared::SharedComm;

use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether a parallel substrate has been initialized for this process.
static HAS_PARALLEL: AtomicBool = AtomicBool::new(false);

/// Mark the parallel substrate as initialized.
///
/// Called once at process start by whichever backend brings up a real
/// multi-rank group. [`LocalComm`] never sets this.
pub fn mark_parallel() {
    HAS_PARALLEL.store(true, Ordering::Release);
}

/// Check whether a parallel substrate is initialized.
pub fn has_parallel() -> bool {
    HAS_PARALLEL.load(Ordering::Acquire)
}

/// Identity and collectives of one rank in the workflow group.
///
/// Every collective is a synchronization point: all ranks must enter it
/// together and it may block arbitrarily long. Implementations must keep
/// collective calls aligned across ranks; there is no cancellation.
pub trait Communicator: Send + Sync {
    /// This rank's index within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Every rank receives `root`'s value.
    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64>;

    /// Every rank receives the values of all ranks, indexed by rank.
    ///
    /// This is the primitive the data manager builds its exclusive prefix
    /// sums on, so offsets stay a deterministic function of rank order.
    fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>>;

    /// Sum of `value` over all ranks.
    fn allreduce_sum(&self, value: u64) -> Result<u64> {
        Ok(self.all_gather_u64(value)?.iter().sum())
    }

    /// Minimum of `value` over all ranks.
    fn allreduce_min(&self, value: u64) -> Result<u64> {
        Ok(self
            .all_gather_u64(value)?
            .into_iter()
            .min()
            .unwrap_or(value))
    }

    /// Maximum of `value` over all ranks.
    fn allreduce_max(&self, value: u64) -> Result<u64> {
        Ok(self
            .all_gather_u64(value)?
            .into_iter()
            .max()
            .unwrap_or(value))
    }

    /// Tear the group down on the abort path.
    ///
    /// Peers blocked in a collective observe an error instead of wedging.
    /// The default is a no-op; backends without cancellable collectives
    /// leave detection to the substrate.
    fn abort(&self) {}
}
