//! Visibility buffer.

use crate::cluster::Cluster;
use crate::common::Float;
use mpi::collective::SystemOperation;
use mpi::traits::*;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Word stored in an empty slot: an infinite hit distance with the maximal
/// tie key, so any real hit wins the integer minimum.
const TBUF_EMPTY: u64 = 0x7f80_0000_ffff_ffff;

/// Pack a hit into one visibility word: the distance bits above a tie key of
/// `(rank, domain)`. Hit distances are non-negative IEEE floats, which
/// compare monotonically as integers, so an integer minimum over these words
/// is "closest hit, ties broken to the lowest (rank, domain)". Because the
/// equality test compares whole words, at most one (rank, domain) candidate
/// survives reconciliation per sample.
fn pack_entry(t: Float, rank: i32, domain: usize) -> u64 {
    ((t.to_bits() as u64) << 32) | (((rank as u64) & 0xffff) << 16) | ((domain as u64) & 0xffff)
}

fn entry_t(word: u64) -> Float {
    Float::from_bits((word >> 32) as u32)
}

/// Authoritative per-sample records of the closest hit distance and
/// per-(sample, light) occlusion.
///
/// Two banks of atomic words alternate between input and output roles: a
/// depth's hits are folded into the output bank with an atomic minimum while
/// the input bank holds the previous depth's reconciled values, so readers of
/// `tbuf_in` never race writers of `tbuf_out`. The swap is a generation flip
/// and leaves the banks untouched.
pub struct VBuf {
    tbufs: [Vec<AtomicU64>; 2],
    input: AtomicUsize,
    obuf: Vec<AtomicU64>,
    num_samples: usize,
    num_lights: usize,
}

impl VBuf {
    /// Create a buffer.
    ///
    /// * `num_samples` - Samples covered by the frame.
    /// * `num_lights`  - Light samples per sample (occlusion bits each).
    pub fn new(num_samples: usize, num_lights: usize) -> Self {
        let make = || (0..num_samples).map(|_| AtomicU64::new(TBUF_EMPTY)).collect();
        let obits = num_samples * num_lights;
        Self {
            tbufs: [make(), make()],
            input: AtomicUsize::new(0),
            obuf: (0..obits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            num_samples,
            num_lights,
        }
    }

    /// Number of samples covered.
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Light samples per sample.
    pub fn num_lights(&self) -> usize {
        self.num_lights
    }

    fn tbuf_in(&self) -> &[AtomicU64] {
        &self.tbufs[self.input.load(Ordering::Acquire)]
    }

    fn tbuf_out(&self) -> &[AtomicU64] {
        &self.tbufs[self.input.load(Ordering::Acquire) ^ 1]
    }

    /// Atomic minimum into the output bank. Returns true iff this hit
    /// lowered the stored word and is therefore the shading candidate so far.
    ///
    /// * `samid`  - Sample id.
    /// * `t`      - Hit distance.
    /// * `rank`   - Originating rank (tie key).
    /// * `domain` - Originating domain (tie key).
    pub fn update_tbuf_out(&self, samid: i32, t: Float, rank: i32, domain: usize) -> bool {
        let word = pack_entry(t, rank, domain);
        let prev = self.tbuf_out()[samid as usize].fetch_min(word, Ordering::AcqRel);
        word < prev
    }

    /// Returns true iff the stored output word is exactly this hit.
    ///
    /// * `samid`  - Sample id.
    /// * `t`      - Hit distance.
    /// * `rank`   - Originating rank (tie key).
    /// * `domain` - Originating domain (tie key).
    pub fn equal_to_tbuf_out(&self, samid: i32, t: Float, rank: i32, domain: usize) -> bool {
        self.tbuf_out()[samid as usize].load(Ordering::Acquire) == pack_entry(t, rank, domain)
    }

    /// Returns true iff a hit at `t` is still authoritative against the
    /// reconciled previous depth. Used to discard speculative work whose
    /// originating hit has been beaten by a closer surface.
    ///
    /// * `samid` - Sample id.
    /// * `t`     - Stashed hit distance.
    pub fn correct(&self, samid: i32, t: Float) -> bool {
        t <= entry_t(self.tbuf_in()[samid as usize].load(Ordering::Acquire))
    }

    /// Current closest distance in the output bank.
    ///
    /// * `samid` - Sample id.
    pub fn tbuf_out_t(&self, samid: i32) -> Float {
        entry_t(self.tbuf_out()[samid as usize].load(Ordering::Acquire))
    }

    /// Mark a (sample, light) pair occluded. Bits are only ever set within a
    /// depth generation; nothing clears a set bit until the generation ends.
    ///
    /// * `samid` - Sample id.
    /// * `light` - Light sample index.
    pub fn set_obuf(&self, samid: i32, light: i32) {
        let bit = samid as usize * self.num_lights + light as usize;
        self.obuf[bit / 64].fetch_or(1 << (bit % 64), Ordering::AcqRel);
    }

    /// Returns true if the (sample, light) pair is occluded.
    ///
    /// * `samid` - Sample id.
    /// * `light` - Light sample index.
    pub fn occluded(&self, samid: i32, light: i32) -> bool {
        let bit = samid as usize * self.num_lights + light as usize;
        (self.obuf[bit / 64].load(Ordering::Acquire) >> (bit % 64)) & 1 == 1
    }

    /// All-reduce the output bank across ranks with MIN, so every rank sees
    /// the same reconciled closest hits.
    ///
    /// * `cluster` - The process context.
    pub fn composite_tbuf(&self, cluster: &Cluster) {
        let local: Vec<u64> = self.tbuf_out().iter().map(|w| w.load(Ordering::Acquire)).collect();
        let mut global = vec![0u64; local.len()];
        cluster
            .world()
            .all_reduce_into(&local[..], &mut global[..], SystemOperation::min());
        for (w, v) in self.tbuf_out().iter().zip(global) {
            w.store(v, Ordering::Release);
        }
    }

    /// All-reduce the occlusion bits across ranks with bitwise OR.
    ///
    /// * `cluster` - The process context.
    pub fn composite_obuf(&self, cluster: &Cluster) {
        let local: Vec<u64> = self.obuf.iter().map(|w| w.load(Ordering::Acquire)).collect();
        let mut global = vec![0u64; local.len()];
        cluster
            .world()
            .all_reduce_into(&local[..], &mut global[..], SystemOperation::bitwise_or());
        for (w, v) in self.obuf.iter().zip(global) {
            w.store(v, Ordering::Release);
        }
    }

    /// Flip the input/output roles of the two banks.
    pub fn swap_tbufs(&self) {
        self.input.fetch_xor(1, Ordering::AcqRel);
    }

    /// Reset the input bank to empty.
    pub fn reset_tbuf_in(&self) {
        for w in self.tbuf_in() {
            w.store(TBUF_EMPTY, Ordering::Release);
        }
    }

    /// Reset the output bank to empty.
    pub fn reset_tbuf_out(&self) {
        for w in self.tbuf_out() {
            w.store(TBUF_EMPTY, Ordering::Release);
        }
    }

    /// Clear all occlusion bits for the next generation of shadow rays.
    pub fn reset_obuf(&self) {
        for w in &self.obuf {
            w.store(0, Ordering::Release);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
