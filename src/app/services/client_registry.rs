use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::app::models::Client;
use crate::kv::{Kv, MemoryKv};

const LOCAL_CACHE_TTL: Duration = Duration::from_secs(10);
const KV_CACHE_TTL: Duration = Duration::from_secs(60);

/// Read-through client metadata cache: process-local cache, then KV cache, then the
/// source registry. Metadata writes invalidate every layer, so a request
/// observes one consistent client for its lifetime.
#[derive(Clone)]
pub struct ClientRegistry {
    source: Arc<RwLock<HashMap<String, Client>>>,
    kv: MemoryKv,
    local: MemoryKv,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            source: Arc::new(RwLock::new(HashMap::new())),
            kv: MemoryKv::new(Some("clients".to_string())),
            local: MemoryKv::new(Some("clients-local".to_string())),
        }
    }

    pub async fn find(&self, client_id: &str) -> Result<Option<Client>> {
        if let Some(client) = self.local.get::<Client>(client_id).await? {
            return Ok(Some(client));
        }

        if let Some(client) = self.kv.get::<Client>(client_id).await? {
            self.local.put(client_id, &client, Some(LOCAL_CACHE_TTL)).await?;
            return Ok(Some(client));
        }

        let source = self.source.read().await;
        match source.get(client_id) {
            Some(client) => {
                self.kv.put(client_id, client, Some(KV_CACHE_TTL)).await?;
                self.local.put(client_id, client, Some(LOCAL_CACHE_TTL)).await?;
                Ok(Some(client.clone()))
            }
            None => Ok(None),
        }
    }

    pub async fn upsert(&self, client: Client) -> Result<()> {
        let client_id = client.client_id.clone();
        {
            let mut source = self.source.write().await;
            source.insert(client_id.clone(), client);
        }
        self.invalidate(&client_id).await
    }

    pub async fn remove(&self, client_id: &str) -> Result<()> {
        {
            let mut source = self.source.write().await;
            source.remove(client_id);
        }
        self.invalidate(client_id).await
    }

    async fn invalidate(&self, client_id: &str) -> Result<()> {
        self.kv.forget(client_id).await?;
        self.local.forget(client_id).await?;
        tracing::debug!(client_id, "client cache invalidated");
        Ok(())
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
