use std::{collections::HashMap, hash::Hash, time::Duration};

use tokio::time::Instant;

/// Value with timestamp.
#[derive(Debug)]
struct Timestamped<V> {
    value: V,
    timestamp: Instant,
}

/// HashMap whose entries expire after a maximum age.
///
/// Expired entries are not removed implicitly, callers decide what happens to
/// them through [`ExpiringHashMap::expired_keys`].
#[derive(Debug)]
pub struct ExpiringHashMap<K, V>
where
    K: Hash + Eq,
{
    hash_map: HashMap<K, Timestamped<V>>,
    max_age: Duration,
}

impl<K, V> ExpiringHashMap<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a new ExpiringHashMap with the specified maximum age for entries.
    pub fn new(max_age: Duration) -> Self {
        Self {
            hash_map: HashMap::new(),
            max_age,
        }
    }

    /// Insert a key-value pair, stamped with the current time.
    pub fn insert(&mut self, key: K, value: V) {
        self.hash_map.insert(
            key,
            Timestamped {
                value,
                timestamp: Instant::now(),
            },
        );
    }

    /// Get a reference to the value associated with the key, if it exists.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.hash_map.get(key).map(|value| &value.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.hash_map.contains_key(key)
    }

    /// Remove and return the value associated with the key, if it exists.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.hash_map.remove(key).map(|value| value.value)
    }

    /// Reset the age of an entry. Returns false if the key is unknown.
    pub fn touch(&mut self, key: &K) -> bool {
        match self.hash_map.get_mut(key) {
            Some(entry) => {
                entry.timestamp = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Keys of entries older than the maximum age.
    pub fn expired_keys(&self) -> Vec<K> {
        let now = Instant::now();
        self.hash_map
            .iter()
            .filter(|(_, v)| now.duration_since(v.timestamp) > self.max_age)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hash_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hash_map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_max_age() {
        let mut map = ExpiringHashMap::new(Duration::from_secs(60));
        map.insert("old", 1);
        tokio::time::advance(Duration::from_secs(61)).await;
        map.insert("new", 2);

        assert_eq!(map.expired_keys(), vec!["old"]);
        assert_eq!(map.get(&"old"), Some(&1));

        assert!(map.touch(&"old"));
        assert!(map.expired_keys().is_empty());

        assert_eq!(map.remove(&"old"), Some(1));
        assert_eq!(map.len(), 1);
    }
}
