/// 64-bit finalizer mix (murmur3 fmix64). Used wherever a set index or a filter probe needs
/// well-spread bits from a block address.
pub fn hash_u64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

/// Independent hash family member `seed` for `x`.
pub fn hash_seeded(x: u64, seed: u64) -> u64 {
    hash_u64(x ^ seed.wrapping_mul(0x9e3779b97f4a7c15).rotate_left(17))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_mixes() {
        assert_eq!(hash_u64(42), hash_u64(42));
        assert_ne!(hash_u64(1), hash_u64(2));
        assert_eq!(0, hash_u64(0));
    }

    #[test]
    fn seeds_give_different_probes() {
        assert_ne!(hash_seeded(0x1234, 0), hash_seeded(0x1234, 1));
    }
}
