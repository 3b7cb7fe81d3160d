//! Domain-load scheduling statistics.

use crate::cluster::Cluster;
use crate::common::HISTORY_SIZE;
use mpi::collective::SystemOperation;
use mpi::traits::*;

/// Per-(domain, virtual depth) ray counters driving the out-of-core domain
/// schedule. Counters are summed across ranks each depth; a domain's score
/// weights rays near the root of the history window more heavily, since work
/// done there unblocks the most downstream work.
pub struct DomainStats {
    num_domains: usize,
    stats: Vec<i64>,
    scores: Vec<(i64, usize)>,
    schedule: Vec<usize>,
}

impl DomainStats {
    /// Create counters for a scene.
    ///
    /// * `num_domains` - Number of domains.
    pub fn new(num_domains: usize) -> Self {
        Self {
            num_domains,
            stats: vec![0; num_domains * HISTORY_SIZE as usize],
            scores: vec![(0, 0); num_domains],
            schedule: (0..num_domains).collect(),
        }
    }

    /// Zero all counters.
    pub fn reset(&mut self) {
        self.stats.iter_mut().for_each(|v| *v = 0);
    }

    /// Count rays queued for a domain at a virtual depth.
    ///
    /// * `id`    - Domain id.
    /// * `depth` - Virtual depth of the rays.
    /// * `n`     - Ray count.
    pub fn add(&mut self, id: usize, depth: i32, n: i64) {
        let bucket = depth.clamp(0, HISTORY_SIZE - 1) as usize;
        self.stats[id * HISTORY_SIZE as usize + bucket] += n;
    }

    /// Counter for one (domain, depth) pair.
    ///
    /// * `id`    - Domain id.
    /// * `depth` - Virtual depth.
    pub fn get(&self, id: usize, depth: i32) -> i64 {
        self.stats[id * HISTORY_SIZE as usize + depth as usize]
    }

    /// Fold another thread's counters into this one.
    ///
    /// * `other` - The other counters.
    pub fn merge(&mut self, other: &DomainStats) {
        for (a, b) in self.stats.iter_mut().zip(&other.stats) {
            *a += *b;
        }
    }

    /// Sum counters across ranks so every rank schedules from the same
    /// global view.
    ///
    /// * `cluster` - The process context.
    pub fn reduce(&mut self, cluster: &Cluster) {
        if !cluster.is_multi() {
            return;
        }
        let local = self.stats.clone();
        cluster
            .world()
            .all_reduce_into(&local[..], &mut self.stats[..], SystemOperation::sum());
    }

    /// Total rays outstanding across all domains and depths.
    pub fn total(&self) -> i64 {
        self.stats.iter().sum()
    }

    /// Order domains by descending score for the next depth wave. Ties break
    /// to the lower domain id so every rank derives the same schedule.
    pub fn schedule(&mut self) -> &[usize] {
        for id in 0..self.num_domains {
            let mut score = 0i64;
            for depth in 0..HISTORY_SIZE {
                let w = (HISTORY_SIZE - depth) as i64;
                score += self.get(id, depth) * w;
            }
            self.scores[id] = (score, id);
        }
        self.scores
            .sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (i, (_, id)) in self.scores.iter().enumerate() {
            self.schedule[i] = *id;
        }
        &self.schedule
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallow_rays_outweigh_deep_ones() {
        let mut s = DomainStats::new(2);
        // same ray count, but domain 1 holds rays closer to the root
        s.add(0, HISTORY_SIZE - 1, 10);
        s.add(1, 0, 10);
        let schedule = s.schedule().to_vec();
        assert_eq!(schedule, vec![1, 0]);
    }

    #[test]
    fn more_pressure_schedules_first() {
        let mut s = DomainStats::new(3);
        s.add(0, 0, 1);
        s.add(2, 0, 50);
        s.add(1, 0, 5);
        assert_eq!(s.schedule().to_vec(), vec![2, 1, 0]);
        assert_eq!(s.total(), 56);
    }

    #[test]
    fn score_ties_break_by_id() {
        let mut s = DomainStats::new(3);
        s.add(2, 1, 4);
        s.add(1, 1, 4);
        assert_eq!(s.schedule().to_vec(), vec![1, 2, 0]);
    }

    #[test]
    fn merge_and_reset() {
        let mut a = DomainStats::new(1);
        a.add(0, 0, 2);
        let mut b = DomainStats::new(1);
        b.add(0, 3, 1);
        a.merge(&b);
        assert_eq!(a.total(), 3);
        a.reset();
        assert_eq!(a.total(), 0);
    }
}
