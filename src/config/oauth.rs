use anyhow::Result;
use std::env;

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub access_token_ttl: i64,
    pub refresh_token_ttl: i64,
    pub auth_code_ttl: i64,
    pub max_codes_per_user: usize,
    pub par_expiry: i64,
    pub device_code_ttl: i64,
    pub device_poll_interval: i64,
    pub ciba_request_ttl: i64,
    pub ciba_poll_interval: i64,
    pub ciba_notification_retry_delay: i64,
    pub ciba_max_notification_attempts: u32,
    pub introspection_cache_enabled: bool,
    pub introspection_cache_ttl: i64,
    pub fapi_enabled: bool,
    pub allow_none_algorithm: bool,
    pub acr_values: Vec<String>,
    pub dpop_iat_skew: i64,
    /// Signing key material (PKCS#8 PEM). Absent in dev: a key is generated
    /// at boot.
    pub signing_key_pem: Option<String>,
}

impl OAuthConfig {
    pub fn from_env() -> Result<Self> {
        Ok(OAuthConfig {
            access_token_ttl: parse_env("OAUTH_ACCESS_TOKEN_TTL", 3600),
            refresh_token_ttl: parse_env("OAUTH_REFRESH_TOKEN_TTL", 604800),
            auth_code_ttl: parse_env("OAUTH_AUTH_CODE_TTL", 60),
            max_codes_per_user: parse_env("OAUTH_MAX_CODES_PER_USER", 100usize),
            par_expiry: parse_env("OAUTH_PAR_EXPIRY", 600),
            device_code_ttl: parse_env("OAUTH_DEVICE_CODE_TTL", 1800),
            device_poll_interval: parse_env("OAUTH_DEVICE_POLL_INTERVAL", 5),
            ciba_request_ttl: parse_env("OAUTH_CIBA_REQUEST_TTL", 600),
            ciba_poll_interval: parse_env("OAUTH_CIBA_POLL_INTERVAL", 5),
            ciba_notification_retry_delay: parse_env("OAUTH_CIBA_RETRY_DELAY", 5),
            ciba_max_notification_attempts: parse_env("OAUTH_CIBA_MAX_NOTIFICATION_ATTEMPTS", 3u32),
            introspection_cache_enabled: parse_bool("OAUTH_INTROSPECTION_CACHE_ENABLED", true),
            introspection_cache_ttl: parse_env("OAUTH_INTROSPECTION_CACHE_TTL", 60).clamp(1, 3600),
            fapi_enabled: parse_bool("OAUTH_FAPI_ENABLED", false),
            allow_none_algorithm: parse_bool("OAUTH_ALLOW_NONE_ALGORITHM", false),
            acr_values: env::var("OAUTH_ACR_VALUES")
                .unwrap_or_else(|_| "urn:oxauth:acr:basic urn:oxauth:acr:mfa".to_string())
                .split_whitespace()
                .map(|s| s.to_string())
                .collect(),
            dpop_iat_skew: parse_env("OAUTH_DPOP_IAT_SKEW", 60),
            signing_key_pem: env::var("OAUTH_SIGNING_KEY_PEM").ok(),
        })
    }

    /// PAR request lifetime with the FAPI ceiling applied.
    pub fn effective_par_expiry(&self) -> i64 {
        if self.fapi_enabled {
            self.par_expiry.min(60)
        } else {
            self.par_expiry.min(600)
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}
