use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::actor::{ActorState, ShardRouter, ShardedStore};
use crate::app::error::OAuthError;
use crate::app::models::par_request::{ParRequest, ParResponse};
use crate::app::models::AuthorizationParams;
use crate::config::ConfigResolver;

#[derive(Debug, Default)]
pub struct ParState {
    requests: HashMap<String, ParRequest>,
}

#[derive(Clone, Debug)]
pub enum ParOp {
    Store { request: Box<ParRequest> },
    Consume { request_uri: String, client_id: String },
}

#[derive(Debug)]
pub enum ParReply {
    Stored,
    TooManyPending,
    Consumed(Box<ParRequest>),
    NotFound,
    ClientMismatch,
}

/// Live pushed requests one client may hold per shard.
const PER_CLIENT_SHARD_CAP: usize = 64;

impl ActorState for ParState {
    type Op = ParOp;
    type Reply = ParReply;

    fn apply(&mut self, op: ParOp, now: DateTime<Utc>) -> ParReply {
        match op {
            ParOp::Store { request } => {
                let live = self
                    .requests
                    .values()
                    .filter(|r| r.client_id == request.client_id && !r.used && !r.is_expired(now))
                    .count();
                if live >= PER_CLIENT_SHARD_CAP {
                    return ParReply::TooManyPending;
                }
                self.requests.insert(request.request_uri.clone(), *request);
                ParReply::Stored
            }
            ParOp::Consume {
                request_uri,
                client_id,
            } => {
                let request = match self.requests.get_mut(&request_uri) {
                    Some(r) => r,
                    None => return ParReply::NotFound,
                };
                // Used and expired requests read identically to absent ones.
                if request.used || request.is_expired(now) {
                    return ParReply::NotFound;
                }
                if request.client_id != client_id {
                    return ParReply::ClientMismatch;
                }
                request.used = true;
                let consumed = request.clone();
                self.requests.remove(&request_uri);
                ParReply::Consumed(Box::new(consumed))
            }
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.requests.len();
        self.requests.retain(|_, r| !r.used && !r.is_expired(now));
        before - self.requests.len()
    }
}

/// Pushed authorization requests: mint a single-use `request_uri` whose
/// embedded actor identity routes consumption back to the owning shard.
#[derive(Clone)]
pub struct ParService {
    shards: ShardedStore<ParState>,
    resolver: ConfigResolver,
    tenant: String,
}

impl ParService {
    pub fn new(router: ShardRouter, resolver: ConfigResolver, tenant: &str) -> Self {
        Self {
            shards: ShardedStore::spawn_with(router, std::time::Duration::from_secs(30), |_| {
                ParState::default()
            }),
            resolver,
            tenant: tenant.to_string(),
        }
    }

    pub async fn push(
        &self,
        client_id: &str,
        params: AuthorizationParams,
        dpop_jkt: Option<String>,
    ) -> Result<ParResponse, OAuthError> {
        let expires_in = self.resolver.par_expiry().await;
        let identity = self.shards.router().mint_identity(&self.tenant);
        let request_uri = ParRequest::request_uri_for(&identity.render());

        let request = ParRequest {
            request_uri: request_uri.clone(),
            client_id: client_id.to_string(),
            params,
            dpop_jkt,
            used: false,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        };

        let handle = self
            .shards
            .handle_at(identity.shard)
            .ok_or_else(|| OAuthError::ServerError(anyhow::anyhow!("shard out of range")))?;
        let reply = handle
            .call_once(ParOp::Store {
                request: Box::new(request),
            })
            .await?;
        if matches!(reply, ParReply::TooManyPending) {
            return Err(OAuthError::InvalidRequest(
                "too many pending pushed requests for this client".to_string(),
            ));
        }

        tracing::info!(client_id, request_uri = %request_uri, "pushed authorization request stored");
        Ok(ParResponse {
            request_uri,
            expires_in,
        })
    }

    /// Atomic single-use consumption; a second read observes
    /// `invalid_request_uri`.
    pub async fn consume(
        &self,
        request_uri: &str,
        client_id: &str,
    ) -> Result<ParRequest, OAuthError> {
        let identity_str = ParRequest::identity_of(request_uri).ok_or_else(|| {
            OAuthError::InvalidRequestUri("unrecognized request_uri format".to_string())
        })?;
        let identity = self
            .shards
            .router()
            .parse_identity(identity_str)
            .ok_or_else(|| OAuthError::InvalidRequestUri("malformed request_uri".to_string()))?;

        let handle = self
            .shards
            .handle_at(identity.shard)
            .ok_or_else(|| OAuthError::InvalidRequestUri("unknown shard".to_string()))?;

        let reply = handle
            .call(ParOp::Consume {
                request_uri: request_uri.to_string(),
                client_id: client_id.to_string(),
            })
            .await?;

        match reply {
            ParReply::Consumed(request) => Ok(*request),
            ParReply::NotFound => Err(OAuthError::InvalidRequestUri(
                "request_uri is unknown, used, or expired".to_string(),
            )),
            ParReply::ClientMismatch => Err(OAuthError::InvalidRequestUri(
                "request_uri was pushed by another client".to_string(),
            )),
            ParReply::Stored | ParReply::TooManyPending => Err(OAuthError::ServerError(
                anyhow::anyhow!("unexpected consume reply"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn service() -> ParService {
        let resolver = ConfigResolver::new(Config::from_env().unwrap());
        ParService::new(ShardRouter::new(1, "auto", 4), resolver, "default")
    }

    fn params() -> AuthorizationParams {
        AuthorizationParams {
            response_type: Some("code".to_string()),
            client_id: Some("c1".to_string()),
            redirect_uri: Some("https://rp/cb".to_string()),
            scope: Some("openid".to_string()),
            state: Some("S".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn push_then_single_consume() {
        let svc = service();
        let response = svc.push("c1", params(), None).await.unwrap();
        assert!(response.request_uri.starts_with("urn:ietf:params:oauth:request_uri:"));
        assert!(response.expires_in <= 600);

        let consumed = svc.consume(&response.request_uri, "c1").await.unwrap();
        assert_eq!(consumed.params.state.as_deref(), Some("S"));

        let err = svc.consume(&response.request_uri, "c1").await.unwrap_err();
        assert_eq!(err.code(), "invalid_request_uri");
    }

    #[tokio::test]
    async fn other_client_cannot_consume() {
        let svc = service();
        let response = svc.push("c1", params(), None).await.unwrap();
        let err = svc.consume(&response.request_uri, "c2").await.unwrap_err();
        assert_eq!(err.code(), "invalid_request_uri");
    }

    #[tokio::test]
    async fn malformed_request_uri_is_rejected() {
        let svc = service();
        assert!(svc.consume("urn:ietf:params:oauth:request_uri:", "c1").await.is_err());
        assert!(svc.consume("https://not-a-par-uri", "c1").await.is_err());
        assert!(svc
            .consume("urn:ietf:params:oauth:request_uri:g1:auto:99:zz", "c1")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn dpop_jkt_survives_the_round_trip() {
        let svc = service();
        let response = svc.push("c1", params(), Some("thumb".to_string())).await.unwrap();
        let consumed = svc.consume(&response.request_uri, "c1").await.unwrap();
        assert_eq!(consumed.dpop_jkt.as_deref(), Some("thumb"));
    }
}
