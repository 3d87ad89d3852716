//! In-process thread-rank group.
//!
//! Ranks share a generation-counted rendezvous: each collective gathers one
//! value per rank, publishes a snapshot when the last rank arrives, and
//! bumps the generation so the rendezvous can be reused for the next
//! collective. A rank that lags in round `g` blocks every other rank from
//! completing round `g + 1`, which is exactly the alignment the data
//! manager's collectives rely on.

use super::Communicator;
use crate::error::{FlowError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

struct RendezvousState {
    generation: u64,
    arrived: usize,
    values: Vec<u64>,
    snapshot: Vec<u64>,
    poisoned: bool,
}

struct Rendezvous {
    state: Mutex<RendezvousState>,
    cond: Condvar,
    size: usize,
}

impl Rendezvous {
    fn new(size: usize) -> Self {
        Self {
            state: Mutex::new(RendezvousState {
                generation: 0,
                arrived: 0,
                values: vec![0; size],
                snapshot: Vec::new(),
                poisoned: false,
            }),
            cond: Condvar::new(),
            size,
        }
    }

    /// Gather one value per rank; every rank receives the full vector.
    fn gather(&self, rank: usize, value: u64) -> Result<Vec<u64>> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(FlowError::Comm {
                cause: "rank group poisoned by an aborted peer".to_string(),
            });
        }
        let generation = state.generation;
        state.values[rank] = value;
        state.arrived += 1;
        if state.arrived == self.size {
            state.snapshot = state.values.clone();
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
        } else {
            while state.generation == generation && !state.poisoned {
                self.cond.wait(&mut state);
            }
            if state.poisoned {
                return Err(FlowError::Comm {
                    cause: "rank group poisoned by an aborted peer".to_string(),
                });
            }
        }
        Ok(state.snapshot.clone())
    }

    /// Wake all waiters with an error; used when a rank drops mid-collective.
    fn poison(&self) {
        let mut state = self.state.lock();
        state.poisoned = true;
        self.cond.notify_all();
    }
}

/// One rank of an in-process thread group.
///
/// Create the whole group with [`SharedComm::group`] and hand one handle to
/// each worker thread:
///
/// ```
/// use rowflow_core::comm::{Communicator, SharedComm};
///
/// let ranks = SharedComm::group(2);
/// let handles: Vec<_> = ranks
///     .into_iter()
///     .map(|comm| {
///         std::thread::spawn(move || comm.all_gather_u64(comm.rank() as u64).unwrap())
///     })
///     .collect();
/// for handle in handles {
///     assert_eq!(handle.join().unwrap(), vec![0, 1]);
/// }
/// ```
pub struct SharedComm {
    rank: usize,
    size: usize,
    rendezvous: Arc<Rendezvous>,
}

impl SharedComm {
    /// Create a group of `size` connected rank handles.
    pub fn group(size: usize) -> Vec<Self> {
        assert!(size > 0, "rank group must have at least one member");
        super::mark_parallel();
        let rendezvous = Arc::new(Rendezvous::new(size));
        (0..size)
            .map(|rank| Self {
                rank,
                size,
                rendezvous: Arc::clone(&rendezvous),
            })
            .collect()
    }

    /// Poison the group so blocked peers fail instead of hanging.
    ///
    /// Called on the abort path; a wedged rank otherwise wedges the group.
    pub fn abort(&self) {
        self.rendezvous.poison();
    }
}

impl Communicator for SharedComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<()> {
        self.rendezvous.gather(self.rank, 0).map(|_| ())
    }

    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64> {
        let gathered = self.rendezvous.gather(self.rank, value)?;
        Ok(gathered[root])
    }

    fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>> {
        self.rendezvous.gather(self.rank, value)
    }

    fn abort(&self) {
        self.rendezvous.poison();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_ranks<F>(size: usize, f: F) -> Vec<u64>
    where
        F: Fn(SharedComm) -> u64 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut handles = Vec::new();
        for comm in SharedComm::group(size) {
            let f = Arc::clone(&f);
            handles.push(thread::spawn(move || f(comm)));
        }
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn all_gather_orders_by_rank() {
        let results = run_ranks(4, |comm| {
            let gathered = comm.all_gather_u64(10 + comm.rank() as u64).unwrap();
            assert_eq!(gathered, vec![10, 11, 12, 13]);
            gathered.iter().sum()
        });
        assert_eq!(results, vec![46, 46, 46, 46]);
    }

    #[test]
    fn broadcast_takes_root_value() {
        run_ranks(3, |comm| {
            let v = comm.broadcast_u64(comm.rank() as u64 * 100, 1).unwrap();
            assert_eq!(v, 100);
            v
        });
    }

    #[test]
    fn reductions() {
        run_ranks(3, |comm| {
            let r = comm.rank() as u64;
            assert_eq!(comm.allreduce_sum(r + 1).unwrap(), 6);
            assert_eq!(comm.allreduce_min(r).unwrap(), 0);
            assert_eq!(comm.allreduce_max(r).unwrap(), 2);
            0
        });
    }

    #[test]
    fn rendezvous_is_reusable_across_rounds() {
        run_ranks(2, |comm| {
            for round in 0..100u64 {
                let gathered = comm.all_gather_u64(round * 2 + comm.rank() as u64).unwrap();
                assert_eq!(gathered, vec![round * 2, round * 2 + 1]);
            }
            0
        });
    }

    #[test]
    fn poison_unblocks_waiters() {
        let mut ranks = SharedComm::group(2);
        let waiter = ranks.remove(0);
        let killer = ranks.remove(0);
        let handle = thread::spawn(move || waiter.barrier());
        thread::sleep(std::time::Duration::from_millis(20));
        killer.abort();
        assert!(handle.join().unwrap().is_err());
    }
}
