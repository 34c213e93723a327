//! Session-state store (spec.md §6.3): a small async key/value trait with a
//! `DashMap`-backed in-memory default, so the engine runs standalone without
//! an external store and the rest of the system only ever depends on the
//! trait, not a concrete backend (spec.md §1, "pluggable key/value
//! collaborator").

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>);
    async fn delete(&self, key: &str);
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct InMemoryStore {
    data: DashMap<String, Entry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore { data: DashMap::new() }
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        match self.data.get(key) {
            Some(entry) => {
                if let Some(exp) = entry.expires_at {
                    if Instant::now() >= exp {
                        drop(entry);
                        self.data.remove(key);
                        return None;
                    }
                }
                Some(entry.value.clone())
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.data.insert(key.to_string(), Entry { value, expires_at });
    }

    async fn delete(&self, key: &str) {
        self.data.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = InMemoryStore::new();
        store.set("k", "v".into(), None).await;
        assert_eq!(store.get("k").await, Some("v".to_string()));
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = InMemoryStore::new();
        store.set("k", "v".into(), None).await;
        store.delete("k").await;
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn expired_ttl_returns_none() {
        let store = InMemoryStore::new();
        store.set("k", "v".into(), Some(Duration::from_millis(1))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await, None);
    }
}
