//! Sharded concurrent map used for per-key serialized state.
//!
//! Each key hashes to one shard guarded by an `RwLock`. Mutations of a key
//! run inside that shard's write lock, so there is one writer per key at a
//! time; readers of the same shard proceed concurrently.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const DEFAULT_SHARDS: usize = 16;

#[derive(Debug)]
pub struct ShardedMap<K, V> {
    shards: Vec<RwLock<HashMap<K, V>>>,
}

impl<K, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl<K, V> ShardedMap<K, V> {
    /// Create a map with `count` shards (at least one).
    pub fn with_shards(count: usize) -> Self {
        Self {
            shards: (0..count.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    /// Total entries across shards. Not a consistent snapshot under concurrent writes.
    pub fn len(&self) -> usize {
        (0..self.shards.len()).map(|i| self.read_shard(i).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_shard(&self, index: usize) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.shards[index].read().unwrap_or_else(|poisoned| {
            tracing::error!(shard = index, "shard lock poisoned on read, recovering");
            poisoned.into_inner()
        })
    }

    fn write_shard(&self, index: usize) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.shards[index].write().unwrap_or_else(|poisoned| {
            tracing::error!(shard = index, "shard lock poisoned on write, recovering");
            poisoned.into_inner()
        })
    }
}

impl<K: Hash + Eq, V> ShardedMap<K, V> {
    fn index_of(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Run `f` against the value for `key` under the shard read lock.
    pub fn read<R>(&self, key: &K, f: impl FnOnce(Option<&V>) -> R) -> R {
        let shard = self.read_shard(self.index_of(key));
        f(shard.get(key))
    }

    /// Clone the value for `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.read(key, |v| v.cloned())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.read(key, |v| v.is_some())
    }

    /// Run `f` against the entry for `key` under the shard write lock.
    ///
    /// `f` sees `None` for absent keys and may insert by assigning `Some`.
    /// Leaving it `None` removes the key.
    pub fn update<R>(&self, key: K, f: impl FnOnce(&mut Option<V>) -> R) -> R {
        let mut shard = self.write_shard(self.index_of(&key));
        let mut slot = shard.remove(&key);
        let result = f(&mut slot);
        if let Some(value) = slot {
            shard.insert(key, value);
        }
        result
    }

    /// Mutate an existing value in place. Returns `None` if the key is absent.
    pub fn modify<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut shard = self.write_shard(self.index_of(key));
        shard.get_mut(key).map(f)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let index = self.index_of(&key);
        self.write_shard(index).insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.write_shard(self.index_of(key)).remove(key)
    }

    /// Clone every value. Each shard is read consistently; the whole is not.
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        (0..self.shards.len())
            .flat_map(|i| self.read_shard(i).values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Visit every entry mutably; entries for which `keep` returns false are
    /// removed and returned.
    pub fn retain(&self, mut keep: impl FnMut(&K, &mut V) -> bool) -> Vec<V>
    where
        K: Clone,
    {
        let mut removed = Vec::new();
        for i in 0..self.shards.len() {
            let mut shard = self.write_shard(i);
            let doomed: Vec<K> = shard
                .iter_mut()
                .filter_map(|(k, v)| (!keep(k, v)).then(|| k.clone()))
                .collect();
            for key in doomed {
                if let Some(value) = shard.remove(&key) {
                    removed.push(value);
                }
            }
        }
        removed
    }
}
