//! Key-value store with optional per-entry TTL.
//!
//! Expired entries are invisible to readers immediately; physical removal
//! happens lazily on read or in [`TimedStore::purge_expired`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Thread-safe TTL map.
pub struct TimedStore<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TimedStore<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or overwrite `key`. With a `ttl` the entry disappears after `now + ttl`.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        tracing::debug!("Store set: {} (ttl: {:?})", key, ttl);
        self.lock().insert(key, Entry { value, expires_at });
    }

    /// Current value of `key`, or `None` when missing or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.lock();
        let expired = entries.get(key)?.is_expired(Instant::now());
        if expired {
            entries.remove(key);
            tracing::debug!("Store entry expired: {}", key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Physically remove every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Remove everything. Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    /// Keys of live entries.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of physically stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry<V>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<V: Clone> Default for TimedStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = TimedStore::new();
        store.set("k", "v".to_string(), None);
        assert_eq!(store.get("k").as_deref(), Some("v"));

        store.set("k", "v2".to_string(), None);
        assert_eq!(store.get("k").as_deref(), Some("v2"));

        assert!(store.delete("k"));
        assert!(!store.delete("k"));
        assert!(store.get("k").is_none());
    }

    #[test]
    fn test_ttl_hides_entry_without_purge() {
        let store = TimedStore::new();
        store.set("k", 1, Some(Duration::from_millis(30)));
        assert_eq!(store.get("k"), Some(1));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(store.len(), 1);
        assert!(store.keys().is_empty());
        assert_eq!(store.get("k"), None);
        // Lazily dropped on read.
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let store = TimedStore::new();
        store.set("short", 1, Some(Duration::from_millis(10)));
        store.set("long", 2, Some(Duration::from_secs(60)));
        store.set("forever", 3, None);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.keys(), vec!["forever".to_string(), "long".to_string()]);
        assert_eq!(store.purge_expired(), 0);
    }

    #[test]
    fn test_overwrite_resets_ttl() {
        let store = TimedStore::new();
        store.set("k", 1, Some(Duration::from_millis(10)));
        store.set("k", 2, None);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(store.get("k"), Some(2));
    }

    #[test]
    fn test_clear() {
        let store = TimedStore::new();
        store.set("a", 1, None);
        store.set("b", 2, None);
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
    }
}
