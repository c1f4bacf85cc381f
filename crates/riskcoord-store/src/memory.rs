//! In-memory shared medium.
//!
//! Every context holding a clone of the same `Arc<MemoryKv>` sees the same
//! data, and the change feed reports writes made through any of them, so
//! this stands in for per-device storage when all contexts live in one
//! process.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;

use riskcoord_core::defaults::CACHE_CHANGE_CAPACITY;
use riskcoord_core::{Error, KeyValueStore, Result, StorageEvent};

/// Thread-safe string map with a change feed and atomic compare-and-swap.
pub struct MemoryKv {
    data: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
    /// Total bytes (keys + values) the store may hold.
    quota_bytes: Option<usize>,
}

impl MemoryKv {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CACHE_CHANGE_CAPACITY);
        Self {
            data: RwLock::new(HashMap::new()),
            events,
            quota_bytes: None,
        }
    }

    /// Reject writes that would push the store past `bytes`, like a browser
    /// storage quota.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_quota(&self, data: &HashMap<String, String>, key: &str, value: &str) -> Result<()> {
        let Some(quota) = self.quota_bytes else {
            return Ok(());
        };
        let used: usize = data
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        if used + key.len() + value.len() > quota {
            return Err(Error::Storage(format!(
                "quota exceeded writing {key} ({quota} bytes)"
            )));
        }
        Ok(())
    }

    fn emit(&self, key: &str, new_value: Option<String>) {
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            new_value,
        });
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            self.check_quota(&data, key, value)?;
            data.insert(key.to_string(), value.to_string());
        }
        self.emit(key, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            data.remove(key).is_some()
        };
        if removed {
            self.emit(key, None);
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str) -> Result<Option<bool>> {
        {
            let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
            if data.get(key).map(String::as_str) != expected {
                return Ok(Some(false));
            }
            self.check_quota(&data, key, new)?;
            data.insert(key.to_string(), new.to_string());
        }
        self.emit(key, Some(new.to_string()));
        Ok(Some(true))
    }

    fn changes(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        Some(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let kv = MemoryKv::new();
        kv.set("a", "1").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("1"));
        kv.remove("a").unwrap();
        assert_eq!(kv.get("a").unwrap(), None);
        // Removing a missing key is fine.
        kv.remove("a").unwrap();
    }

    #[test]
    fn test_keys_with_prefix_sorted() {
        let kv = MemoryKv::new();
        kv.set("lock_p_b", "1").unwrap();
        kv.set("lock_p_a", "1").unwrap();
        kv.set("cache_p", "{}").unwrap();
        assert_eq!(kv.keys_with_prefix("lock_p_").unwrap(), vec!["lock_p_a", "lock_p_b"]);
    }

    #[test]
    fn test_compare_and_swap() {
        let kv = MemoryKv::new();
        assert_eq!(kv.compare_and_swap("k", None, "1").unwrap(), Some(true));
        assert_eq!(kv.compare_and_swap("k", None, "2").unwrap(), Some(false));
        assert_eq!(kv.compare_and_swap("k", Some("1"), "2").unwrap(), Some(true));
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_quota_rejects_oversized_write() {
        let kv = MemoryKv::new().with_quota(10);
        kv.set("k", "12345").unwrap();
        let err = kv.set("other", "123456789").unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        // Replacing an existing value only counts the new size.
        kv.set("k", "123456789").unwrap();
    }

    #[test]
    fn test_change_feed_reports_writes_and_removals() {
        let kv = MemoryKv::new();
        let mut rx = kv.changes().unwrap();
        kv.set("k", "v").unwrap();
        kv.remove("k").unwrap();
        kv.remove("k").unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.new_value.as_deref(), Some("v"));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.new_value, None);
        assert!(rx.try_recv().is_err());
    }
}
