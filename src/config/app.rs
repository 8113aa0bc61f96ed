use anyhow::Result;
use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: String,
    pub port: u16,
    pub issuer: String,
    pub tenant: String,
    pub region: String,
    pub shard_generation: u32,
    pub shards: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(AppConfig {
            env: env::var("APP_ENV").unwrap_or_else(|_| "local".to_string()),
            port: env::var("APP_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            issuer: env::var("OAUTH_ISSUER").unwrap_or_else(|_| "https://auth.oxauth.dev".to_string()),
            tenant: env::var("APP_TENANT").unwrap_or_else(|_| "default".to_string()),
            region: env::var("APP_REGION").unwrap_or_else(|_| "auto".to_string()),
            shard_generation: env::var("STORE_SHARD_GENERATION")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),
            shards: env::var("STORE_SHARDS")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .unwrap_or(8),
        })
    }

    pub fn is_production(&self) -> bool {
        self.env == "production"
    }

    pub fn is_testing(&self) -> bool {
        self.env == "testing"
    }
}
