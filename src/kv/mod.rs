use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod memory;

pub use memory::MemoryKv;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv serialization failed: {message}")]
    Serialization { message: String },
    #[error("kv deserialization failed: {message}")]
    Deserialization { message: String },
}

/// Settings/metadata cache layer. Backs the config resolver and the client
/// registry read-through cache; protocol artifacts never live here (they are
/// owned by the actor store).
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: for<'de> Deserialize<'de> + Send;

    async fn put<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Send + Sync;

    async fn forget(&self, key: &str) -> Result<()>;

    async fn flush(&self) -> Result<()>;
}
