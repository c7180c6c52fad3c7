//! Existence filter guarding against lookups for keys that were never created.
//!
//! Standard bloom filter sized from an expected item count and a target false-positive
//! rate, using double hashing (`h1 + i * h2`) over two seeded `DefaultHasher`s.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomConfig {
    pub expected_items: usize,
    pub false_positive_rate: f64,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            expected_items: 100_000,
            false_positive_rate: 0.01,
        }
    }
}

#[derive(Debug)]
pub struct BloomFilter {
    bits: RwLock<Vec<u64>>,
    num_bits: u64,
    num_hashes: u32,
    inserted: AtomicUsize,
}

impl BloomFilter {
    #[must_use]
    pub fn new(config: &BloomConfig) -> Self {
        let n = config.expected_items.max(1) as f64;
        let p = config.false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;

        let words = usize::try_from(num_bits.div_ceil(64)).unwrap_or(usize::MAX);
        Self {
            bits: RwLock::new(vec![0; words]),
            num_bits,
            num_hashes,
            inserted: AtomicUsize::new(0),
        }
    }

    fn positions(&self, item: &str) -> impl Iterator<Item = (usize, u64)> + use<'_> {
        let h1 = seeded_hash(item, 0x51_7c_c1_b7);
        let h2 = seeded_hash(item, 0x27_22_0a_95) | 1;
        let num_bits = self.num_bits;
        (0..u64::from(self.num_hashes)).map(move |i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % num_bits;
            (usize::try_from(bit / 64).unwrap_or(0), 1u64 << (bit % 64))
        })
    }

    pub fn insert(&self, item: &str) {
        let mut bits = self.bits.write();
        for (word, mask) in self.positions(item) {
            if let Some(slot) = bits.get_mut(word) {
                *slot |= mask;
            }
        }
        self.inserted.fetch_add(1, Ordering::Relaxed);
    }

    /// `false` means the item was definitely never inserted
    #[must_use]
    pub fn might_contain(&self, item: &str) -> bool {
        let bits = self.bits.read();
        self.positions(item)
            .all(|(word, mask)| bits.get(word).is_some_and(|slot| slot & mask != 0))
    }

    pub fn clear(&self) {
        self.bits.write().iter_mut().for_each(|w| *w = 0);
        self.inserted.store(0, Ordering::Relaxed);
    }

    /// Number of insert calls (duplicates included)
    #[must_use]
    pub fn inserted(&self) -> usize {
        self.inserted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }
}

fn seeded_hash(item: &str, seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    item.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let filter = BloomFilter::new(&BloomConfig {
            expected_items: 1000,
            false_positive_rate: 0.01,
        });
        for i in 0..1000 {
            filter.insert(&format!("shop:product:{i}"));
        }
        assert!((0..1000).all(|i| filter.might_contain(&format!("shop:product:{i}"))));
        assert_eq!(filter.inserted(), 1000);
    }

    #[test]
    fn false_positive_rate_is_near_target() {
        let filter = BloomFilter::new(&BloomConfig {
            expected_items: 1000,
            false_positive_rate: 0.01,
        });
        for i in 0..1000 {
            filter.insert(&format!("present:{i}"));
        }
        let false_positives = (0..10_000)
            .filter(|i| filter.might_contain(&format!("absent:{i}")))
            .count();
        assert!(false_positives < 500, "{false_positives} false positives");
    }

    #[test]
    fn clear_empties_the_filter() {
        let filter = BloomFilter::new(&BloomConfig::default());
        filter.insert("a");
        filter.clear();
        assert!(!filter.might_contain("a"));
        assert_eq!(filter.inserted(), 0);
    }
}
