//! Single-rank stub used when the substrate is absent.

use super::Communicator;
use crate::error::Result;

/// Rank 0 of size 1; all collectives are the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalComm;

impl LocalComm {
    /// Create the stub communicator.
    pub fn new() -> Self {
        Self
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn broadcast_u64(&self, value: u64, _root: usize) -> Result<u64> {
        Ok(value)
    }

    fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>> {
        Ok(vec![value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collectives_are_identity() {
        let comm = LocalComm::new();
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
        comm.barrier().unwrap();
        assert_eq!(comm.broadcast_u64(7, 0).unwrap(), 7);
        assert_eq!(comm.all_gather_u64(3).unwrap(), vec![3]);
        assert_eq!(comm.allreduce_sum(5).unwrap(), 5);
        assert_eq!(comm.allreduce_min(5).unwrap(), 5);
        assert_eq!(comm.allreduce_max(5).unwrap(), 5);
    }
}
