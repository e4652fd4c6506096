use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// Folds `value` into a running hash.
pub fn combine<T: Hash + ?Sized>(seed: u64, value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    seed.hash(&mut hasher);
    value.hash(&mut hasher);
    hasher.finish()
}

/// Hashes a single value.
pub fn hash_one<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_order_sensitive() {
        let ab = combine(combine(0, &1_u32), &2_u32);
        let ba = combine(combine(0, &2_u32), &1_u32);
        assert_ne!(ab, ba);
        assert_eq!(ab, combine(combine(0, &1_u32), &2_u32));
    }
}
