use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::kv::{Kv, MemoryKv};

use super::Config;

const CACHE_TTL: Duration = Duration::from_secs(10);

/// Layered runtime settings: per-request memory cache (10 s TTL), then the central KV
/// settings store, then process env (captured in the boot `Config`), then
/// defaults. Admin writes go through `set`, which writes the KV layer and
/// drops the cache entry so readers observe the new value within the cache
/// TTL.
#[derive(Clone)]
pub struct ConfigResolver {
    boot: Arc<Config>,
    settings: MemoryKv,
    cache: MemoryKv,
}

impl ConfigResolver {
    pub fn new(boot: Config) -> Self {
        Self {
            boot: Arc::new(boot),
            settings: MemoryKv::new(Some("settings".to_string())),
            cache: MemoryKv::new(Some("settings-cache".to_string())),
        }
    }

    pub fn boot(&self) -> &Config {
        &self.boot
    }

    async fn resolve<T: DeserializeOwned + Serialize + Send + Sync>(
        &self,
        key: &str,
        fallback: T,
    ) -> T {
        if let Ok(Some(cached)) = self.cache.get::<T>(key).await {
            return cached;
        }
        let value = match self.settings.get::<T>(key).await {
            Ok(Some(stored)) => stored,
            _ => fallback,
        };
        let _ = self.cache.put(key, &value, Some(CACHE_TTL)).await;
        value
    }

    /// Admin write-through: persists to the settings KV and invalidates the
    /// read cache.
    pub async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.settings.put(key, &value, None).await?;
        self.cache.forget(key).await?;
        tracing::info!(setting = key, "runtime setting updated");
        Ok(())
    }

    pub async fn auth_code_ttl(&self) -> i64 {
        self.resolve("oauth.auth_code_ttl", self.boot.oauth.auth_code_ttl).await
    }

    pub async fn max_codes_per_user(&self) -> usize {
        self.resolve("oauth.max_codes_per_user", self.boot.oauth.max_codes_per_user)
            .await
    }

    pub async fn access_token_ttl(&self) -> i64 {
        self.resolve("oauth.access_token_ttl", self.boot.oauth.access_token_ttl)
            .await
    }

    pub async fn refresh_token_ttl(&self) -> i64 {
        self.resolve("oauth.refresh_token_ttl", self.boot.oauth.refresh_token_ttl)
            .await
    }

    pub async fn par_expiry(&self) -> i64 {
        let configured = self.resolve("oauth.par_expiry", self.boot.oauth.par_expiry).await;
        if self.fapi_enabled().await {
            configured.min(60)
        } else {
            configured.min(600)
        }
    }

    pub async fn fapi_enabled(&self) -> bool {
        self.resolve("oauth.fapi_enabled", self.boot.oauth.fapi_enabled).await
    }

    pub async fn allow_none_algorithm(&self) -> bool {
        if self.boot.app.is_production() {
            return false;
        }
        self.resolve("oauth.allow_none_algorithm", self.boot.oauth.allow_none_algorithm)
            .await
    }

    pub async fn acr_values(&self) -> Vec<String> {
        self.resolve("oauth.acr_values", self.boot.oauth.acr_values.clone()).await
    }

    pub async fn introspection_cache_enabled(&self) -> bool {
        self.resolve(
            "oauth.introspection_cache_enabled",
            self.boot.oauth.introspection_cache_enabled,
        )
        .await
    }

    pub async fn introspection_cache_ttl(&self) -> i64 {
        self.resolve("oauth.introspection_cache_ttl", self.boot.oauth.introspection_cache_ttl)
            .await
            .clamp(1, 3600)
    }

    pub async fn device_poll_interval(&self) -> i64 {
        self.resolve("oauth.device_poll_interval", self.boot.oauth.device_poll_interval)
            .await
    }

    pub async fn rate_limit_profile(&self) -> super::rate_limit::RateLimitProfile {
        let raw = self
            .resolve(
                "rate_limit.profile",
                self.boot.rate_limit.profile.as_str().to_string(),
            )
            .await;
        super::rate_limit::RateLimitProfile::parse(&raw).unwrap_or(self.boot.rate_limit.profile)
    }
}
