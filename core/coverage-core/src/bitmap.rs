//! Packed probe flags.

use serde::{Serialize, Serializer};

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-length sequence of probe flags packed into 64-bit words.
///
/// Bits past `len` in the last word are always zero, so word-wise equality
/// and popcount stay exact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeBitmap {
    len: usize,
    words: Vec<u64>,
}

impl ProbeBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            words: vec![0; len.div_ceil(WORD_BITS)],
        }
    }

    pub fn from_bools(flags: &[bool]) -> Self {
        let mut bitmap = Self::new(flags.len());
        for (index, _) in flags.iter().enumerate().filter(|(_, hit)| **hit) {
            bitmap.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        }
        bitmap
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// ORs `other` into `self`. Returns `false` and leaves `self` untouched
    /// when the lengths differ.
    pub fn union_with(&mut self, other: &ProbeBitmap) -> bool {
        if self.len != other.len {
            return false;
        }
        for (word, incoming) in self.words.iter_mut().zip(&other.words) {
            *word |= incoming;
        }
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|index| self.get(index))
    }

    pub fn to_bools(&self) -> Vec<bool> {
        self.iter().collect()
    }
}

impl Serialize for ProbeBitmap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}
