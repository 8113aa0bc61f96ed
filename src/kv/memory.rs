use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::{Kv, KvError};

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() > at).unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct MemoryKv {
    store: Arc<RwLock<HashMap<String, Entry>>>,
    prefix: Option<String>,
}

impl MemoryKv {
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            prefix,
        }
    }

    fn build_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: for<'de> Deserialize<'de> + Send,
    {
        let full_key = self.build_key(key);
        let store = self.store.read().await;
        match store.get(&full_key) {
            Some(entry) if !entry.is_expired() => {
                let value = serde_json::from_str(&entry.value).map_err(|e| KvError::Deserialization {
                    message: e.to_string(),
                })?;
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    async fn put<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send + Sync,
    {
        let serialized = serde_json::to_string(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
        })?;
        let full_key = self.build_key(key);
        let mut store = self.store.write().await;
        store.retain(|_, entry| !entry.is_expired());
        store.insert(full_key, Entry::new(serialized, ttl));
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<()> {
        let full_key = self.build_key(key);
        self.store.write().await.remove(&full_key);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.store.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let kv = MemoryKv::new(Some("test".to_string()));
        kv.put("answer", &42u32, None).await.unwrap();
        assert_eq!(kv.get::<u32>("answer").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn expired_entries_are_absent() {
        let kv = MemoryKv::new(None);
        kv.put("short", &"v", Some(Duration::from_millis(5))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get::<String>("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn forget_removes_entry() {
        let kv = MemoryKv::new(None);
        kv.put("k", &"v", None).await.unwrap();
        kv.forget("k").await.unwrap();
        assert_eq!(kv.get::<String>("k").await.unwrap(), None);
    }
}
