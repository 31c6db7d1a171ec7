//! Deterministic hash functions used for bucketing.
//!
//! All functions here are part of a cross-SDK contract: the same key and seed must produce the same
//! value in every implementation, bit for bit.

const C1: u64 = 0x87c37b91114253d5;
const C2: u64 = 0x4cf5ad432745937f;
const R1: u32 = 31;
const R2: u32 = 27;
const R3: u32 = 33;
const M: u64 = 5;
const N1: u64 = 0x52dce729;
const N2: u64 = 0x38495ab5;

/// Legacy polynomial string hash: `h = h * 31 + c` over the key's Unicode scalar values with
/// wrapping arithmetic, xor-ed with the seed.
pub fn legacy_hash(key: &str, seed: u32) -> u32 {
    let h = key
        .chars()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32));
    h ^ seed
}

/// MurmurHash3 x86 32-bit over the UTF-8 bytes of `key`.
pub fn murmur3_32(key: &[u8], seed: u32) -> u32 {
    // Reading from an in-memory slice cannot fail.
    murmur3::murmur3_32(&mut &key[..], seed).unwrap_or_default()
}

/// MurmurHash3 x64 128-bit over `data[offset..offset + length]`, returning both 64-bit lanes.
///
/// # Panics
///
/// Panics if `offset + length` is out of bounds for `data`.
pub fn murmur3_x64_128(data: &[u8], offset: usize, length: usize, seed: u64) -> (u64, u64) {
    let data = &data[offset..offset + length];
    let mut h1 = seed;
    let mut h2 = seed;

    let mut blocks = data.chunks_exact(16);
    for block in &mut blocks {
        let k1 = read_u64_le(&block[..8]);
        let k2 = read_u64_le(&block[8..]);

        h1 ^= mix_k1(k1);
        h1 = h1.rotate_left(R2).wrapping_add(h2);
        h1 = h1.wrapping_mul(M).wrapping_add(N1);

        h2 ^= mix_k2(k2);
        h2 = h2.rotate_left(R1).wrapping_add(h1);
        h2 = h2.wrapping_mul(M).wrapping_add(N2);
    }

    let tail = blocks.remainder();
    if tail.len() > 8 {
        h2 ^= mix_k2(read_u64_le(&tail[8..]));
    }
    if !tail.is_empty() {
        h1 ^= mix_k1(read_u64_le(&tail[..tail.len().min(8)]));
    }

    h1 ^= length as u64;
    h2 ^= length as u64;

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    h1 = fmix64(h1);
    h2 = fmix64(h2);

    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    (h1, h2)
}

/// Little-endian read of up to 8 bytes; missing high bytes are zero.
fn read_u64_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)))
}

fn mix_k1(k1: u64) -> u64 {
    k1.wrapping_mul(C1).rotate_left(R1).wrapping_mul(C2)
}

fn mix_k2(k2: u64) -> u64 {
    k2.wrapping_mul(C2).rotate_left(R3).wrapping_mul(C1)
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51afd7ed558ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
    k ^= k >> 33;
    k
}
