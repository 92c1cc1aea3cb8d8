use std::fmt;

use sha2::{Digest, Sha256};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BloomFilterError {
    InvalidPadding(i32),
    InvalidHashCount(i32),
    EmptyBitmapWithPadding(i32),
    EmptyBitmapWithHashCount(i32),
}

impl fmt::Display for BloomFilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BloomFilterError::InvalidPadding(padding) => write!(f, "Invalid padding: {padding}"),
            BloomFilterError::InvalidHashCount(count) => write!(f, "Invalid hash count: {count}"),
            BloomFilterError::EmptyBitmapWithPadding(padding) => {
                write!(f, "Invalid padding when bitmap length is 0: {padding}")
            }
            BloomFilterError::EmptyBitmapWithHashCount(count) => {
                write!(f, "Invalid hash count when bitmap length is 0: {count}")
            }
        }
    }
}

impl std::error::Error for BloomFilterError {}

/// Probabilistic set of document names sent with an existence filter.
///
/// Membership hashes the name with SHA-256; the first two little-endian
/// 64-bit words `h1`, `h2` of the digest select bits `(h1 + i * h2) mod n`
/// for `i` in `0..hash_count`.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> Result<Self, BloomFilterError> {
        if !(0..8).contains(&padding) {
            return Err(BloomFilterError::InvalidPadding(padding));
        }
        if hash_count < 0 {
            return Err(BloomFilterError::InvalidHashCount(hash_count));
        }
        if bitmap.is_empty() {
            if padding != 0 {
                return Err(BloomFilterError::EmptyBitmapWithPadding(padding));
            }
            if hash_count != 0 {
                return Err(BloomFilterError::EmptyBitmapWithHashCount(hash_count));
            }
        } else if hash_count == 0 {
            return Err(BloomFilterError::InvalidHashCount(hash_count));
        }
        let bit_count = (bitmap.len() as u64) * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_pair(value);
        (0..self.hash_count as u64).all(|i| {
            let index = h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count;
            self.is_bit_set(index)
        })
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }

    #[cfg(test)]
    fn insert(&mut self, value: &str) {
        let (h1, h2) = hash_pair(value);
        for i in 0..self.hash_count as u64 {
            let index = h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count;
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    /// Bitmap of a filter with `byte_len` bytes holding `names`.
    #[cfg(test)]
    pub(crate) fn test_bitmap(names: &[String], byte_len: usize, hash_count: i32) -> Vec<u8> {
        let mut filter = Self {
            bitmap: vec![0; byte_len],
            hash_count: hash_count as u32,
            bit_count: byte_len as u64 * 8,
        };
        for name in names {
            filter.insert(name);
        }
        filter.bitmap
    }
}

fn hash_pair(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[0..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_parameters() {
        assert_eq!(
            BloomFilter::new(vec![0], 8, 1).unwrap_err(),
            BloomFilterError::InvalidPadding(8)
        );
        assert_eq!(
            BloomFilter::new(vec![0], 0, -1).unwrap_err(),
            BloomFilterError::InvalidHashCount(-1)
        );
        assert_eq!(
            BloomFilter::new(vec![], 1, 0).unwrap_err(),
            BloomFilterError::EmptyBitmapWithPadding(1)
        );
        assert_eq!(
            BloomFilter::new(vec![], 0, 3).unwrap_err(),
            BloomFilterError::EmptyBitmapWithHashCount(3)
        );
        assert!(BloomFilter::new(vec![1], 0, 0).is_err());
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(Vec::new(), 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain("projects/p/databases/d/documents/a/1"));
    }

    #[test]
    fn inserted_names_are_members() {
        let mut filter = BloomFilter::new(vec![0; 64], 3, 7).unwrap();
        assert_eq!(filter.bit_count(), 509);
        let names: Vec<String> = (0..20)
            .map(|i| format!("projects/p/databases/(default)/documents/c/doc{i}"))
            .collect();
        for name in &names {
            filter.insert(name);
        }
        assert!(names.iter().all(|name| filter.might_contain(name)));
        let false_positives = (100..200)
            .filter(|i| filter.might_contain(&format!("projects/p/databases/(default)/documents/c/doc{i}")))
            .count();
        assert!(false_positives < 20);
    }

    #[test]
    fn full_bitmap_contains_everything() {
        let filter = BloomFilter::new(vec![0xff; 4], 0, 5).unwrap();
        assert!(filter.might_contain("anything"));
    }
}
