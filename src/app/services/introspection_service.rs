use serde_json::json;
use std::time::Duration;

use crate::app::error::OAuthError;
use crate::app::models::token::IntrospectionResponse;
use crate::config::ConfigResolver;
use crate::kv::{Kv, MemoryKv};

use super::token_service::TokenService;

/// RFC 7662 introspection over the active set. Only `active=true` responses
/// are cached (keyed by sha256(jti)); the revocation flag is always read
/// uncached, so a revocation is visible on the very next call even when a
/// cache entry exists.
#[derive(Clone)]
pub struct IntrospectionService {
    tokens: TokenService,
    cache: MemoryKv,
    resolver: ConfigResolver,
}

impl IntrospectionService {
    pub fn new(tokens: TokenService, resolver: ConfigResolver) -> Self {
        Self {
            tokens,
            cache: MemoryKv::new(Some("introspect".to_string())),
            resolver,
        }
    }

    pub async fn introspect(&self, token: &str) -> Result<IntrospectionResponse, OAuthError> {
        // Malformed and unverifiable tokens are reported inactive, not as
        // errors.
        let claims = match self
            .tokens
            .key_ring()
            .verify(token, None, &[jsonwebtoken::Algorithm::RS256])
            .await
        {
            Ok(claims) => claims,
            Err(_) => return Ok(IntrospectionResponse::inactive()),
        };
        let jti = match claims.get("jti").and_then(|v| v.as_str()) {
            Some(jti) => jti.to_string(),
            None => return Ok(IntrospectionResponse::inactive()),
        };
        let cache_key = super::crypto::sha256_hex(jti.as_bytes());

        // Uncached revocation lookup, every time.
        let record = match self.tokens.store().get_access(&jti).await? {
            Some(record) => record,
            None => {
                let _ = self.cache.forget(&cache_key).await;
                return Ok(IntrospectionResponse::inactive());
            }
        };
        if record.revoked {
            let _ = self.cache.forget(&cache_key).await;
            return Ok(IntrospectionResponse::inactive());
        }

        if self.resolver.introspection_cache_enabled().await {
            if let Ok(Some(cached)) = self.cache.get::<serde_json::Value>(&cache_key).await {
                return Ok(Self::from_cached(cached));
            }
        }

        let response = IntrospectionResponse {
            active: true,
            scope: Some(record.scope.clone()),
            client_id: Some(record.client_id.clone()),
            sub: record.user_id.clone().or(Some(record.client_id.clone())),
            exp: Some(record.expires_at.timestamp()),
            jti: Some(jti.clone()),
            token_type: Some(if record.cnf_jkt.is_some() { "DPoP" } else { "Bearer" }.to_string()),
            cnf: record.cnf_jkt.as_ref().map(|jkt| json!({ "jkt": jkt })),
        };

        if self.resolver.introspection_cache_enabled().await {
            let ttl = self.resolver.introspection_cache_ttl().await;
            let cached = json!({
                "scope": response.scope,
                "client_id": response.client_id,
                "sub": response.sub,
                "exp": response.exp,
                "jti": response.jti,
                "token_type": response.token_type,
                "cnf": response.cnf,
            });
            let _ = self
                .cache
                .put(&cache_key, &cached, Some(Duration::from_secs(ttl as u64)))
                .await;
        }

        Ok(response)
    }

    fn from_cached(cached: serde_json::Value) -> IntrospectionResponse {
        IntrospectionResponse {
            active: true,
            scope: cached["scope"].as_str().map(|s| s.to_string()),
            client_id: cached["client_id"].as_str().map(|s| s.to_string()),
            sub: cached["sub"].as_str().map(|s| s.to_string()),
            exp: cached["exp"].as_i64(),
            jti: cached["jti"].as_str().map(|s| s.to_string()),
            token_type: cached["token_type"].as_str().map(|s| s.to_string()),
            cnf: match &cached["cnf"] {
                serde_json::Value::Null => None,
                other => Some(other.clone()),
            },
        }
    }
}
