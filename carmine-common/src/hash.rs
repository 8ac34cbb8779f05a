//! FNV-1 32-bit hashing.
//!
//! Both the striped keyspace dict and the cluster ring hash keys with the
//! same function, so a key's bucket and its owning peer stay stable across
//! crates without sharing state.

const FNV_OFFSET_BASIS_32: u32 = 2_166_136_261;
const FNV_PRIME_32: u32 = 16_777_619;

/// Hashes `data` with 32-bit FNV-1.
#[must_use]
pub fn fnv32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS_32;
    for byte in data {
        hash = hash.wrapping_mul(FNV_PRIME_32);
        hash ^= u32::from(*byte);
    }
    hash
}
