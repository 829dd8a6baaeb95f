//! Fixed-size bit vectors for per-block segment bookkeeping.
//!
//! Every block carries two of these (`pending` and `repair`), exactly one bit
//! per segment slot. The repair algorithms are written entirely in terms of
//! the operations here, so their semantics are fixed:
//!
//! - [`BitMask::add`] is logical OR
//! - [`BitMask::xor`] is exclusive OR
//! - [`BitMask::xcopy`] is the destructive set difference
//!   `self = other & !self`, not a generic xor-assign
//!
//! # Invariants
//! - Storage is allocated once; no operation reallocates
//! - Length is fixed at construction

use bitvec::prelude::*;
use std::mem;

/// A fixed-length bitset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMask {
    bits: BitVec<u64, Lsb0>,
}

impl BitMask {
    /// Allocate a cleared mask of `num_bits` bits.
    ///
    /// Returns `None` if the backing storage cannot be allocated.
    pub fn new(num_bits: usize) -> Option<Self> {
        let word_count = num_bits.div_ceil(u64::BITS as usize);
        let mut words: Vec<u64> = Vec::new();
        words.try_reserve_exact(word_count).ok()?;
        words.resize(word_count, 0);

        let mut bits = BitVec::from_vec(words);
        bits.truncate(num_bits);
        Some(Self { bits })
    }

    /// Number of bits in the mask.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True if the mask has zero length.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Clear every bit.
    pub fn clear(&mut self) {
        self.bits.fill(false);
    }

    /// True if any bit is set.
    pub fn is_set(&self) -> bool {
        self.bits.any()
    }

    /// Number of bits set.
    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    /// Test a single bit. Out-of-range indices read as unset.
    pub fn test(&self, index: usize) -> bool {
        index < self.bits.len() && self.bits[index]
    }

    /// Set a single bit.
    pub fn set(&mut self, index: usize) {
        self.bits.set(index, true);
    }

    /// Clear a single bit.
    pub fn unset(&mut self, index: usize) {
        self.bits.set(index, false);
    }

    /// Set `count` bits starting at `start`.
    pub fn set_bits(&mut self, start: usize, count: usize) {
        if count > 0 {
            self.bits[start..start + count].fill(true);
        }
    }

    /// Clear `count` bits starting at `start`.
    pub fn unset_bits(&mut self, start: usize, count: usize) {
        if count > 0 {
            self.bits[start..start + count].fill(false);
        }
    }

    /// Index of the lowest set bit.
    pub fn first_set(&self) -> Option<usize> {
        self.bits.first_one()
    }

    /// Index of the lowest set bit at or after `from`.
    pub fn next_set(&self, from: usize) -> Option<usize> {
        if from >= self.bits.len() {
            return None;
        }
        self.bits[from..].first_one().map(|i| i + from)
    }

    /// Index of the highest set bit.
    pub fn last_set(&self) -> Option<usize> {
        self.bits.last_one()
    }

    /// Logical OR of `other` into `self`.
    pub fn add(&mut self, other: &BitMask) {
        debug_assert_eq!(self.len(), other.len());
        self.bits |= other.bits.as_bitslice();
    }

    /// Exclusive OR of `other` into `self`.
    pub fn xor(&mut self, other: &BitMask) {
        debug_assert_eq!(self.len(), other.len());
        self.bits ^= other.bits.as_bitslice();
    }

    /// Destructive set difference: `self = other & !self`.
    ///
    /// Bits set in `self` are removed from `other`, and the result replaces
    /// `self`.
    pub fn xcopy(&mut self, other: &BitMask) {
        debug_assert_eq!(self.len(), other.len());
        // Not reuses the buffer in place
        self.bits = !mem::take(&mut self.bits);
        self.bits &= other.bits.as_bitslice();
    }

    /// Iterate over set bit indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_with(num_bits: usize, bits: &[usize]) -> BitMask {
        let mut mask = BitMask::new(num_bits).unwrap();
        for &b in bits {
            mask.set(b);
        }
        mask
    }

    #[test]
    fn test_set_test_unset() {
        let mut mask = BitMask::new(20).unwrap();
        assert!(!mask.is_set());

        mask.set(3);
        mask.set(19);
        assert!(mask.test(3));
        assert!(mask.test(19));
        assert!(!mask.test(4));
        assert!(!mask.test(200)); // out of range reads as unset

        mask.unset(3);
        assert!(!mask.test(3));
        assert_eq!(mask.count_ones(), 1);
    }

    #[test]
    fn test_set_bits_across_words() {
        let mut mask = BitMask::new(200).unwrap();
        mask.set_bits(60, 80);

        assert_eq!(mask.count_ones(), 80);
        assert_eq!(mask.first_set(), Some(60));
        assert_eq!(mask.last_set(), Some(139));

        mask.unset_bits(64, 64);
        assert_eq!(mask.count_ones(), 16);
        assert!(mask.test(63));
        assert!(!mask.test(64));
        assert!(!mask.test(127));
        assert!(mask.test(128));
    }

    #[test]
    fn test_zero_count_is_noop() {
        let mut mask = BitMask::new(8).unwrap();
        mask.set_bits(8, 0);
        mask.unset_bits(8, 0);
        assert!(!mask.is_set());
    }

    #[test]
    fn test_next_set() {
        let mask = mask_with(130, &[1, 4, 5, 64, 129]);

        assert_eq!(mask.next_set(0), Some(1));
        assert_eq!(mask.next_set(2), Some(4));
        assert_eq!(mask.next_set(6), Some(64));
        assert_eq!(mask.next_set(65), Some(129));
        assert_eq!(mask.next_set(130), None);

        let collected: Vec<_> = mask.iter_set().collect();
        assert_eq!(collected, vec![1, 4, 5, 64, 129]);
    }

    #[test]
    fn test_add_and_xor() {
        let mut a = mask_with(10, &[1, 2]);
        let b = mask_with(10, &[2, 3]);

        let mut or = a.clone();
        or.add(&b);
        assert_eq!(or.iter_set().collect::<Vec<_>>(), vec![1, 2, 3]);

        a.xor(&b);
        assert_eq!(a.iter_set().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_xcopy_is_set_difference() {
        // self = other - self
        let mut scratch = mask_with(10, &[0, 1, 2, 9]);
        let pending = mask_with(10, &[1, 2, 5, 6]);

        scratch.xcopy(&pending);
        assert_eq!(scratch.iter_set().collect::<Vec<_>>(), vec![5, 6]);
    }

    #[test]
    fn test_xcopy_across_words_keeps_length() {
        let mut scratch = mask_with(130, &[0, 64, 129]);
        let pending = mask_with(130, &[0, 63, 64, 100, 129]);

        scratch.xcopy(&pending);
        assert_eq!(scratch.len(), 130);
        assert_eq!(scratch.iter_set().collect::<Vec<_>>(), vec![63, 100]);
        assert_eq!(scratch.last_set(), Some(100));
    }

    #[test]
    fn test_clear() {
        let mut mask = mask_with(70, &[0, 69]);
        mask.clear();
        assert!(!mask.is_set());
        assert_eq!(mask.len(), 70);
    }
}
