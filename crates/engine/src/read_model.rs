use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::RwLock;

/// Key/value store abstraction for disposable read models (party registry,
/// balance snapshots).
///
/// Everything held behind this trait is a cache or lookup table that can be
/// rebuilt from the entry store; it is never the source of truth.
pub trait KvStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;
    fn upsert(&self, key: K, value: V);
    fn list(&self) -> Vec<V>;
    /// Clear all records (rebuild support).
    fn clear(&self);
}

impl<K, V, S> KvStore<K, V> for Arc<S>
where
    S: KvStore<K, V> + ?Sized,
{
    fn get(&self, key: &K) -> Option<V> {
        (**self).get(key)
    }

    fn upsert(&self, key: K, value: V) {
        (**self).upsert(key, value)
    }

    fn list(&self) -> Vec<V> {
        (**self).list()
    }

    fn clear(&self) {
        (**self).clear()
    }
}

/// In-memory key/value store for tests/dev.
#[derive(Debug)]
pub struct InMemoryKvStore<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> InMemoryKvStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryKvStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KvStore<K, V> for InMemoryKvStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        let map = self.inner.read().ok()?;
        map.get(key).cloned()
    }

    fn upsert(&self, key: K, value: V) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(key, value);
        }
    }

    fn list(&self) -> Vec<V> {
        let map = match self.inner.read() {
            Ok(m) => m,
            Err(_) => return vec![],
        };

        map.values().cloned().collect()
    }

    fn clear(&self) {
        if let Ok(mut map) = self.inner.write() {
            map.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_get_returns_latest_value() {
        let store = InMemoryKvStore::new();
        store.upsert("a", 1u32);
        store.upsert("a", 2u32);
        assert_eq!(store.get(&"a"), Some(2));
        assert_eq!(store.get(&"b"), None);
    }

    #[test]
    fn clear_removes_everything() {
        let store = InMemoryKvStore::new();
        store.upsert(1u8, "one");
        store.upsert(2u8, "two");
        assert_eq!(store.list().len(), 2);
        store.clear();
        assert!(store.list().is_empty());
    }
}
