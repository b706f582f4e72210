// ============================================================================
// SECTION: CONCURRENT SIGNAL STORE
// ============================================================================
// A sharded map used as the per-algorithm signal store. Query tasks write
// whole values; readers clone them out under a short shard read lock, so a
// reader always sees either the previous or the next complete value.
// ============================================================================

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

/// A concurrent hash map sharded across `SHARDS` read-write locks.
pub struct ShardedMap<K, V, const SHARDS: usize = 16> {
    shards: Box<[RwLock<HashMap<K, V>>]>,
    hasher: RandomState,
    len: AtomicUsize,
}

impl<K, V, const SHARDS: usize> ShardedMap<K, V, SHARDS>
where
    K: Hash + Eq + Clone,
{
    /// Create a new sharded map.
    pub fn new() -> Self {
        let shards = (0..SHARDS.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            hasher: RandomState::new(),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn shard<Q>(&self, key: &Q) -> &RwLock<HashMap<K, V>>
    where
        Q: Hash + ?Sized,
    {
        let index = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Store a value, returning the one it replaced.
    pub fn store(&self, key: K, value: V) -> Option<V> {
        let old = self.shard(&key).write().insert(key, value);
        if old.is_none() {
            self.len.fetch_add(1, AtomicOrdering::Relaxed);
        }
        old
    }

    /// Load a clone of the value for `key`.
    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.shard(key).read().get(key).cloned()
    }

    /// Load the existing value or store the one produced by `make`.
    pub fn load_or_store_with<F>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
        V: Clone,
    {
        let mut shard = self.shard(&key).write();
        if let Some(existing) = shard.get(&key) {
            return existing.clone();
        }
        let value = make();
        shard.insert(key, value.clone());
        self.len.fetch_add(1, AtomicOrdering::Relaxed);
        value
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).read().contains_key(key)
    }

    /// Delete a key, returning its value.
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self.shard(key).write().remove(key);
        if removed.is_some() {
            self.len.fetch_sub(1, AtomicOrdering::Relaxed);
        }
        removed
    }

    /// Visit entries shard by shard until `f` returns false.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for shard in self.shards.iter() {
            let shard = shard.read();
            for (k, v) in shard.iter() {
                if !f(k, v) {
                    return;
                }
            }
        }
    }

    /// Get the approximate length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V, const SHARDS: usize> Default for ShardedMap<K, V, SHARDS>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const SHARDS: usize> fmt::Debug for ShardedMap<K, V, SHARDS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shards", &self.shards.len())
            .field("len", &self.len.load(AtomicOrdering::Relaxed))
            .finish()
    }
}
