use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One-time authorization code record. `used` flips from false to true exactly once
/// inside the owning actor; a second consumption attempt is a replay and
/// revokes the tokens registered at first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub user_id: String,
    pub scope: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
    pub state: Option<String>,
    pub claims: Option<String>,
    pub auth_time: Option<i64>,
    pub acr: Option<String>,
    pub c_hash: Option<String>,
    pub dpop_jkt: Option<String>,
    pub sid: Option<String>,
    pub used: bool,
    pub expires_at: DateTime<Utc>,
    pub issued_access_token_jti: Option<String>,
    pub issued_refresh_token_jti: Option<String>,
}

impl AuthCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(|s| s.to_string()).collect()
    }

    /// Opaque code value, ≥128 bits of entropy.
    pub fn generate_code() -> String {
        use rand::{distributions::Alphanumeric, Rng};
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(43)
            .map(char::from)
            .collect()
    }
}

/// Authorization context returned by a successful consume; everything the
/// token service needs to mint the id_token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthCodeContext {
    pub client_id: String,
    pub redirect_uri: String,
    pub user_id: String,
    pub scope: String,
    pub nonce: Option<String>,
    pub claims: Option<String>,
    pub auth_time: Option<i64>,
    pub acr: Option<String>,
    pub dpop_jkt: Option<String>,
    pub sid: Option<String>,
}

impl From<&AuthCode> for AuthCodeContext {
    fn from(code: &AuthCode) -> Self {
        Self {
            client_id: code.client_id.clone(),
            redirect_uri: code.redirect_uri.clone(),
            user_id: code.user_id.clone(),
            scope: code.scope.clone(),
            nonce: code.nonce.clone(),
            claims: code.claims.clone(),
            auth_time: code.auth_time,
            acr: code.acr.clone(),
            dpop_jkt: code.dpop_jkt.clone(),
            sid: code.sid.clone(),
        }
    }
}
