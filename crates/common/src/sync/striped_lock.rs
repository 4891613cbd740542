use std::{
    collections::hash_map::DefaultHasher,
    hash::{
        Hash,
        Hasher,
    },
};

use parking_lot::{
    Mutex,
    MutexGuard,
};

/// Fixed-width striped lock keyed by a stable hash of `K`. Two keys that
/// hash to the same stripe serialize against each other even though they're
/// logically independent documents; at 256 stripes this is rare enough in
/// practice not to matter; see the per-docId write path discussion in
/// `engine`.
pub struct StripedLock<const STRIPES: usize = 256> {
    stripes: Vec<Mutex<()>>,
}

impl<const STRIPES: usize> Default for StripedLock<STRIPES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const STRIPES: usize> StripedLock<STRIPES> {
    pub fn new() -> Self {
        assert!(STRIPES > 0, "StripedLock must have at least one stripe");
        let stripes = (0..STRIPES).map(|_| Mutex::new(())).collect();
        Self { stripes }
    }

    fn stripe_for<K: Hash>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    /// Lock the stripe that `key` hashes to. The returned guard has no
    /// relationship to `key` itself — it's purely a concurrency token.
    pub fn lock<K: Hash>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_for(key)].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_serializes() {
        let lock = StripedLock::<8>::new();
        let _g1 = lock.lock(&"doc-a");
        // A second, distinct StripedLock instance is independent; this just
        // exercises that locking twice on different keys doesn't deadlock
        // when they land in different stripes.
        drop(_g1);
        let _g2 = lock.lock(&"doc-b");
    }

    #[test]
    fn distinct_keys_can_map_to_distinct_stripes() {
        let lock = StripedLock::<256>::new();
        let g1 = lock.lock(&"doc-a");
        let g2 = lock.lock(&"doc-totally-different-key");
        drop(g1);
        drop(g2);
    }
}
