//! Per-rank work counters and distributed termination.

use crate::cluster::Cluster;
use crate::partition::InsituPartition;
use mpi::collective::SystemOperation;
use mpi::traits::*;

/// Per-rank share of the reduced block counts.
#[derive(Clone, Copy, Debug, Default, Equivalence)]
#[repr(C)]
struct ScatterEntry {
    world_num_blocks: i32,
    rank_num_blocks: i32,
}

/// Counts of outstanding domain-blocks, indexed by the rank that must process
/// them. A domain-block is a (domain, nonempty queue) pair, tracked as a flag
/// so it counts at most once per (domain, kind) no matter how many threads
/// hold rays for it: one wire message carries a whole block, and the receive
/// prediction must match the message count exactly. The frame terminates when
/// the global sum of blocks reaches zero.
pub struct WorkStats {
    rad: Vec<bool>,
    shad: Vec<bool>,
    cached: bool,
    reduce_buf: Vec<i32>,
    world_num_blocks: i32,
    num_blocks_to_recv: i32,
}

impl WorkStats {
    /// Create counters for a scene and cluster.
    ///
    /// * `ndomains` - Number of domains.
    /// * `nranks`   - Number of ranks.
    pub fn new(ndomains: usize, nranks: usize) -> Self {
        Self {
            rad: vec![false; ndomains],
            shad: vec![false; ndomains],
            cached: false,
            reduce_buf: vec![0; nranks],
            world_num_blocks: 0,
            num_blocks_to_recv: 0,
        }
    }

    /// Clear all block flags.
    pub fn reset(&mut self) {
        self.rad.iter_mut().for_each(|b| *b = false);
        self.shad.iter_mut().for_each(|b| *b = false);
        self.cached = false;
    }

    /// Flag an outstanding radiance block.
    ///
    /// * `id` - Domain id.
    pub fn set_rad_block(&mut self, id: usize) {
        self.rad[id] = true;
    }

    /// Flag an outstanding shadow block.
    ///
    /// * `id` - Domain id.
    pub fn set_shad_block(&mut self, id: usize) {
        self.shad[id] = true;
    }

    /// Flag outstanding speculative replay work, owed to this rank itself.
    pub fn set_cached_block(&mut self) {
        self.cached = true;
    }

    /// Fold another thread's flags into this one.
    ///
    /// * `other` - The other counters.
    pub fn merge(&mut self, other: &WorkStats) {
        for (a, b) in self.rad.iter_mut().zip(&other.rad) {
            *a |= *b;
        }
        for (a, b) in self.shad.iter_mut().zip(&other.shad) {
            *a |= *b;
        }
        self.cached |= other.cached;
    }

    /// Convert the merged block flags into per-destination counts.
    ///
    /// * `partition` - The domain partition.
    /// * `self_rank` - This process' rank (owner of the cached block).
    pub fn update_reduce_buffer(&mut self, partition: &InsituPartition, self_rank: i32) {
        self.reduce_buf.iter_mut().for_each(|v| *v = 0);
        for id in 0..self.rad.len() {
            let dest = partition.rank(id) as usize;
            if self.rad[id] {
                self.reduce_buf[dest] += 1;
            }
            if self.shad[id] {
                self.reduce_buf[dest] += 1;
            }
        }
        if self.cached {
            self.reduce_buf[self_rank as usize] += 1;
        }
    }

    /// Blocks this rank currently owes a destination, valid after
    /// [`update_reduce_buffer`](Self::update_reduce_buffer).
    ///
    /// * `rank` - Destination rank.
    pub fn num_domains(&self, rank: i32) -> i32 {
        self.reduce_buf[rank as usize]
    }

    /// Collective termination test: sum the per-destination counters to rank
    /// 0, then scatter each rank its `(world total, own portion)`. The
    /// difference between a rank's portion and the blocks it already holds
    /// predicts how many messages are still inbound this depth.
    ///
    /// * `cluster` - The process context.
    pub fn reduce(&mut self, cluster: &Cluster) {
        if !cluster.is_multi() {
            self.world_num_blocks = self.reduce_buf[0];
            self.num_blocks_to_recv = 0;
            return;
        }

        let rank = cluster.rank();
        let num_blocks_already_owned = self.reduce_buf[rank as usize];
        let root = cluster.world().process_at_rank(0);

        let mut entry = ScatterEntry::default();
        if rank == 0 {
            let mut summed = vec![0i32; self.reduce_buf.len()];
            root.reduce_into_root(&self.reduce_buf[..], &mut summed[..], SystemOperation::sum());
            let total: i32 = summed.iter().sum();
            let entries: Vec<ScatterEntry> = summed
                .iter()
                .map(|&n| ScatterEntry {
                    world_num_blocks: total,
                    rank_num_blocks: n,
                })
                .collect();
            root.scatter_into_root(&entries[..], &mut entry);
        } else {
            root.reduce_into(&self.reduce_buf[..], SystemOperation::sum());
            root.scatter_into(&mut entry);
        }

        self.world_num_blocks = entry.world_num_blocks;
        self.num_blocks_to_recv = entry.rank_num_blocks - num_blocks_already_owned;
        debug_assert!(
            self.num_blocks_to_recv >= 0,
            "negative inbound block count {}",
            self.num_blocks_to_recv
        );
    }

    /// Returns true once no rank has outstanding work.
    pub fn all_done(&self) -> bool {
        self.world_num_blocks == 0
    }

    /// Returns true once all predicted inbound messages have arrived.
    ///
    /// * `num_blocks_recved` - Messages received so far this depth.
    pub fn recv_done(&self, num_blocks_recved: i32) -> bool {
        num_blocks_recved >= self.num_blocks_to_recv
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_clamps_per_domain_block() {
        let partition = InsituPartition::new(4, 2);
        let mut a = WorkStats::new(4, 2);
        a.set_rad_block(3);
        let mut b = WorkStats::new(4, 2);
        // three threads with rays for the same block still count once
        b.set_rad_block(3);
        b.set_shad_block(3);
        a.merge(&b);
        a.update_reduce_buffer(&partition, 0);
        assert_eq!(a.num_domains(partition.rank(3)), 2);
    }

    #[test]
    fn cached_block_counts_toward_self() {
        let partition = InsituPartition::new(2, 2);
        let mut s = WorkStats::new(2, 2);
        s.set_cached_block();
        s.update_reduce_buffer(&partition, 1);
        assert_eq!(s.num_domains(0), 0);
        assert_eq!(s.num_domains(1), 1);
    }

    #[test]
    fn single_rank_reduce_is_local() {
        let cluster = Cluster::single();
        let partition = InsituPartition::new(2, 1);
        let mut s = WorkStats::new(2, 1);
        s.set_rad_block(0);
        s.set_shad_block(1);
        s.update_reduce_buffer(&partition, 0);
        s.reduce(&cluster);
        assert!(!s.all_done());
        assert!(s.recv_done(0));

        s.reset();
        s.update_reduce_buffer(&partition, 0);
        s.reduce(&cluster);
        assert!(s.all_done());
    }
}
