use core::hash::Hash;
use std::hash::Hasher;

#[cfg(feature = "std-hash")]
pub mod default {
    pub use std::collections::hash_map::DefaultHasher;

    #[inline]
    pub fn new() -> DefaultHasher {
        DefaultHasher::new()
    }
}

// `AHasher::default()` uses fixed keys, so hashes are stable for the life of
// the process. Identities only need to survive across passes, not restarts.
#[cfg(not(feature = "std-hash"))]
pub mod default {
    pub use ahash::AHasher as DefaultHasher;

    #[inline]
    pub fn new() -> DefaultHasher {
        DefaultHasher::default()
    }
}

/// convenience: hash a single value with whichever default is active
#[inline]
pub fn hash_one<T: Hash + ?Sized>(v: &T) -> u64 {
    let mut h = default::new();
    v.hash(&mut h);
    h.finish()
}

/// Hashes several parts in order into a single key.
pub fn hash_parts(parts: &[&dyn HashPart]) -> u64 {
    let mut h = default::new();
    for part in parts {
        part.hash_into(&mut h);
    }
    h.finish()
}

/// Object-safe adapter so heterogeneous values can be folded by [`hash_parts`].
pub trait HashPart {
    fn hash_into(&self, hasher: &mut dyn Hasher);
}

impl<T: Hash + ?Sized> HashPart for T {
    fn hash_into(&self, mut hasher: &mut dyn Hasher) {
        self.hash(&mut hasher);
    }
}
