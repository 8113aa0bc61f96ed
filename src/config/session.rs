use anyhow::Result;
use std::env;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ttl_seconds: i64,
    pub cookie_name: String,
}

impl SessionConfig {
    pub fn from_env() -> Result<Self> {
        Ok(SessionConfig {
            ttl_seconds: env::var("SESSION_TTL")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .unwrap_or(86400),
            cookie_name: env::var("SESSION_COOKIE").unwrap_or_else(|_| "oxauth_sid".to_string()),
        })
    }
}
