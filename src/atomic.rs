//! AtomicFloat

use crate::common::Float;
use std::sync::atomic::{AtomicU32, Ordering};

/// Atomic floating point value stored as its bit representation in an
/// `AtomicU32`.
pub struct AtomicFloat {
    bits: AtomicU32,
}

impl AtomicFloat {
    /// Create a new `AtomicFloat`.
    ///
    /// * `v` - The value.
    pub fn new(v: Float) -> Self {
        Self {
            bits: AtomicU32::new(v.to_bits()),
        }
    }

    /// Load the current value.
    pub fn get(&self) -> Float {
        Float::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Store a value.
    ///
    /// * `v` - The value.
    pub fn set(&self, v: Float) {
        self.bits.store(v.to_bits(), Ordering::Relaxed);
    }

    /// Add a floating point value.
    ///
    /// * `v` - The value to add.
    pub fn add(&self, v: Float) {
        let mut old_bits = self.bits.load(Ordering::Relaxed);
        loop {
            let new_bits = (Float::from_bits(old_bits) + v).to_bits();
            match self.bits.compare_exchange_weak(
                old_bits,
                new_bits,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => old_bits = x,
            }
        }
    }
}

impl Default for AtomicFloat {
    fn default() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
