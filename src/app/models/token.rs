use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issued access token, tracked by `jti` for introspection and revocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenRecord {
    pub jti: String,
    pub client_id: String,
    pub user_id: Option<String>,
    pub scope: String,
    /// DPoP key thumbprint when the token is sender-constrained.
    pub cnf_jkt: Option<String>,
    pub sid: Option<String>,
    pub revoked: bool,
    pub expires_at: DateTime<Utc>,
}

impl AccessTokenRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// Rotating refresh token. Consuming one issues a successor in the same
/// family; reuse after rotation is treated as compromise and revokes the
/// whole family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub token: String,
    pub jti: String,
    pub family_id: String,
    pub client_id: String,
    pub user_id: String,
    pub scope: String,
    pub dpop_jkt: Option<String>,
    pub sid: Option<String>,
    /// jti of the access token minted in the same round; revoked together.
    pub access_token_jti: String,
    pub used: bool,
    pub revoked: bool,
    pub expires_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.used && now < self.expires_at
    }

    pub fn generate_token() -> String {
        use rand::{distributions::Alphanumeric, Rng};
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(48)
            .map(char::from)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    /// `Bearer`, or `DPoP` when sender-constrained.
    #[schema(example = "Bearer")]
    pub token_type: String,
    #[schema(example = 3600)]
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// RFC 8693 token exchange responses only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_token_type: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cnf: Option<serde_json::Value>,
}

impl IntrospectionResponse {
    pub fn inactive() -> Self {
        Self {
            active: false,
            scope: None,
            client_id: None,
            sub: None,
            exp: None,
            jti: None,
            token_type: None,
            cnf: None,
        }
    }
}
