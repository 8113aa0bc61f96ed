use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::authorization::AuthorizationParams;

pub const REQUEST_URI_PREFIX: &str = "urn:ietf:params:oauth:request_uri:";

/// Stored pushed authorization request. The `request_uri` embeds the owning
/// shard identity, so consumption at the authorization endpoint routes back
/// to the same actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParRequest {
    pub request_uri: String,
    pub client_id: String,
    pub params: AuthorizationParams,
    /// Thumbprint of the DPoP proof key supplied at push time, if any.
    pub dpop_jkt: Option<String>,
    pub used: bool,
    pub expires_at: DateTime<Utc>,
}

impl ParRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// `urn:ietf:params:oauth:request_uri:{actor-identity}`.
    pub fn request_uri_for(identity: &str) -> String {
        format!("{REQUEST_URI_PREFIX}{identity}")
    }

    pub fn identity_of(request_uri: &str) -> Option<&str> {
        request_uri.strip_prefix(REQUEST_URI_PREFIX).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ParResponse {
    #[schema(example = "urn:ietf:params:oauth:request_uri:g1:auto:3:9f2c")]
    pub request_uri: String,
    #[schema(example = 60)]
    pub expires_in: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uri_embeds_identity() {
        let uri = ParRequest::request_uri_for("g1:weur:3:abc123");
        assert_eq!(ParRequest::identity_of(&uri), Some("g1:weur:3:abc123"));
        assert_eq!(ParRequest::identity_of("urn:other:abc"), None);
    }
}
