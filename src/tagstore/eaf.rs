use bitvec::prelude::*;

use crate::base::hash::hash_seeded;

/// Evicted-address filter: a Bloom filter over recently evicted block tags. After `capacity`
/// insertions the whole filter is cleared, so membership approximates "evicted within the last
/// `capacity` evictions".
#[derive(Debug, Clone)]
pub struct EvictedAddressFilter {
    bits: BitVec<u64, Lsb0>,
    capacity: usize,
    inserted: usize,
}

impl EvictedAddressFilter {
    const BITS_PER_ADDRESS: usize = 8;
    const PROBES: u64 = 2;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bits: bitvec![u64, Lsb0; 0; capacity * Self::BITS_PER_ADDRESS],
            capacity,
            inserted: 0,
        }
    }

    fn probes(&self, addr: u64) -> impl Iterator<Item = usize> {
        let len = self.bits.len() as u64;
        (0..Self::PROBES).map(move |seed| (hash_seeded(addr, seed) % len) as usize)
    }

    pub fn insert(&mut self, addr: u64) {
        if self.inserted >= self.capacity {
            self.clear();
        }
        for bit in self.probes(addr).collect::<Vec<_>>() {
            self.bits.set(bit, true);
        }
        self.inserted += 1;
    }

    /// True if `addr` may have been inserted since the last reset. False positives are possible,
    /// false negatives are not.
    pub fn test(&self, addr: u64) -> bool {
        self.probes(addr).all(|bit| self.bits[bit])
    }

    pub fn clear(&mut self) {
        self.bits.fill(false);
        self.inserted = 0;
    }

    pub fn len(&self) -> usize {
        self.inserted
    }

    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
