//! Bucketer implementation.
use crate::{
    hashing::{legacy_hash, murmur3_32},
    models::HashAlgorithm,
};

/// Smallest bucket a key can land in.
pub const MIN_BUCKET: u32 = 1;
/// Largest bucket a key can land in.
pub const MAX_BUCKET: u32 = 100;

/// Maps keys to buckets. Partitions are matched against the bucket a key lands in, so an
/// implementation must be deterministic for a given key, seed and algorithm.
pub trait Bucketer {
    /// Map `key` to a bucket in `[1, 100]`.
    fn bucket(&self, key: &str, seed: i32, algo: HashAlgorithm) -> u32;
}

/// The default (and only production) bucketer.
pub struct HashBucketer;

impl Bucketer for HashBucketer {
    fn bucket(&self, key: &str, seed: i32, algo: HashAlgorithm) -> u32 {
        (hash(key, seed, algo) % MAX_BUCKET) + MIN_BUCKET
    }
}

/// Hash `key` with the selected algorithm. Negative seeds are reinterpreted as their two's
/// complement bit pattern.
pub fn hash(key: &str, seed: i32, algo: HashAlgorithm) -> u32 {
    let seed = seed as u32;
    match algo {
        HashAlgorithm::Legacy => legacy_hash(key, seed),
        HashAlgorithm::Murmur3 => murmur3_32(key.as_bytes(), seed),
    }
}
