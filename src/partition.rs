//! Domain-to-rank partition.

/// Total function from domain id to owning rank, built once at scene load and
/// never mutated. Domains are assigned in contiguous blocks so neighboring
/// ids tend to share a rank.
pub struct InsituPartition {
    ranks: Vec<i32>,
    by_rank: Vec<Vec<usize>>,
}

impl InsituPartition {
    /// Build the partition.
    ///
    /// * `ndomains` - Number of domains.
    /// * `nranks`   - Number of ranks.
    pub fn new(ndomains: usize, nranks: usize) -> Self {
        let mut ranks = vec![0; ndomains];
        let mut by_rank: Vec<Vec<usize>> = vec![Vec::new(); nranks];
        let base = ndomains / nranks;
        let extra = ndomains % nranks;
        let mut id = 0;
        for (r, owned) in by_rank.iter_mut().enumerate() {
            let count = base + usize::from(r < extra);
            for _ in 0..count {
                ranks[id] = r as i32;
                owned.push(id);
                id += 1;
            }
        }
        Self { ranks, by_rank }
    }

    /// The owning rank of a domain.
    ///
    /// * `id` - Domain id.
    pub fn rank(&self, id: usize) -> i32 {
        self.ranks[id]
    }

    /// The domains owned by a rank, in ascending id order.
    ///
    /// * `rank` - The rank.
    pub fn domains(&self, rank: i32) -> &[usize] {
        &self.by_rank[rank as usize]
    }

    /// Number of domains partitioned.
    pub fn num_domains(&self) -> usize {
        self.ranks.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_all_domains_once() {
        let p = InsituPartition::new(10, 3);
        let mut seen = vec![false; 10];
        for r in 0..3 {
            for &id in p.domains(r) {
                assert_eq!(p.rank(id), r);
                assert!(!seen[id]);
                seen[id] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn balanced_within_one() {
        let p = InsituPartition::new(11, 4);
        let sizes: Vec<usize> = (0..4).map(|r| p.domains(r).len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 11);
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
    }

    #[test]
    fn fewer_domains_than_ranks() {
        let p = InsituPartition::new(2, 5);
        assert_eq!(p.rank(0), 0);
        assert_eq!(p.rank(1), 1);
        assert!(p.domains(4).is_empty());
    }
}
