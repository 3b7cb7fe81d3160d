//! MPI process context.

use crate::error::{Error, Result};
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Threading;

/// Rank-local view of the cluster, passed down from the frame entry instead
/// of living in a global. Only the master thread of a rank may touch the
/// communicator.
pub struct Cluster {
    world: Option<SimpleCommunicator>,
    rank: i32,
    size: i32,
}

impl Cluster {
    /// Initialize MPI with the funneled threading level and build the
    /// context. Refuses to run if the provided level is lower.
    pub fn init() -> Result<(Universe, Cluster)> {
        let (universe, threading) = mpi::initialize_with_threading(Threading::Funneled)
            .ok_or_else(|| Error::Mpi("MPI_Init_thread failed".to_string()))?;
        if threading < Threading::Funneled {
            return Err(Error::Mpi(format!(
                "thread level {:?} below funneled",
                threading
            )));
        }
        let world = universe.world();
        let rank = world.rank();
        let size = world.size();
        info!("rank {rank} (world size: {size})");
        Ok((
            universe,
            Cluster {
                world: Some(world),
                rank,
                size,
            },
        ))
    }

    /// A context for a single process without MPI. All collective paths are
    /// guarded by `is_multi`, so the communicator is never touched.
    pub fn single() -> Cluster {
        Cluster {
            world: None,
            rank: 0,
            size: 1,
        }
    }

    /// The world communicator. Callers reach this only on multi-rank paths.
    pub fn world(&self) -> &SimpleCommunicator {
        self.world
            .as_ref()
            .expect("communicator touched in a single-process context")
    }

    /// This process' rank.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Number of ranks.
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Returns true if this is rank 0.
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    /// Returns true if more than one rank participates.
    pub fn is_multi(&self) -> bool {
        self.size > 1
    }
}

/// Carries the cluster handle across a fork-join thread team under the
/// funneled threading contract.
///
/// `MPI_THREAD_FUNNELED` licenses MPI calls from the master thread only, and
/// every collective and point-to-point call in the depth loop happens in a
/// master critical section while the other workers are parked at a barrier.
/// The wrapper exists solely to cross the thread boundary; `master()` hands
/// the handle back and must only be called from the team's master thread.
pub struct Funneled<'a> {
    cluster: &'a Cluster,
}

impl<'a> Funneled<'a> {
    /// Wrap a context for the team.
    pub fn new(cluster: &'a Cluster) -> Self {
        Self { cluster }
    }

    /// The wrapped context. Master thread only.
    pub fn master(&self) -> &'a Cluster {
        self.cluster
    }
}

// Safety: all access is funneled through the master thread; the worker
// threads never touch the communicator behind this reference.
unsafe impl Send for Funneled<'_> {}
unsafe impl Sync for Funneled<'_> {}
