//! Count-min frequency sketch used by the admission filter
//!
//! Four rows of 4-bit saturating counters. Once the number of recorded
//! accesses reaches the sample size every counter is halved, so old
//! popularity decays and recent frequency dominates.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

const ROWS: usize = 4;
const MAX_COUNT: u8 = 15;
const SEEDS: [u64; ROWS] = [
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
    0x27d4_eb2f_1656_67c5,
];

#[derive(Debug)]
pub struct FrequencySketch {
    table: Vec<[u8; ROWS]>,
    mask: u64,
    additions: usize,
    sample_size: usize,
    hasher: RandomState,
}

impl FrequencySketch {
    /// Size the sketch for a cache holding `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let width = (capacity.max(1) * 16).next_power_of_two().max(64);
        Self {
            table: vec![[0; ROWS]; width],
            mask: (width - 1) as u64,
            additions: 0,
            sample_size: width * 10,
            hasher: RandomState::new(),
        }
    }

    fn slots<K: Hash + ?Sized>(&self, key: &K) -> [usize; ROWS] {
        let hash = self.hasher.hash_one(key);
        let mut slots = [0; ROWS];
        for (row, seed) in SEEDS.iter().enumerate() {
            let mixed = hash.wrapping_mul(*seed).rotate_right(29 + row as u32 * 7);
            slots[row] = (mixed & self.mask) as usize;
        }
        slots
    }

    /// Record one access to `key`
    pub fn increment<K: Hash + ?Sized>(&mut self, key: &K) {
        let slots = self.slots(key);
        let mut changed = false;
        for (row, slot) in slots.iter().enumerate() {
            let counter = &mut self.table[*slot][row];
            if *counter < MAX_COUNT {
                *counter += 1;
                changed = true;
            }
        }

        if changed {
            self.additions += 1;
            if self.additions >= self.sample_size {
                self.age();
            }
        }
    }

    /// Estimated access count of `key`
    pub fn frequency<K: Hash + ?Sized>(&self, key: &K) -> u8 {
        self.slots(key)
            .iter()
            .enumerate()
            .map(|(row, slot)| self.table[*slot][row])
            .min()
            .unwrap_or(0)
    }

    fn age(&mut self) {
        for counters in self.table.iter_mut() {
            for counter in counters.iter_mut() {
                *counter >>= 1;
            }
        }
        self.additions /= 2;
    }
}
