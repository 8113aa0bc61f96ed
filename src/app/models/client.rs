use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    None,
    ClientSecretBasic,
    ClientSecretPost,
    ClientSecretJwt,
    PrivateKeyJwt,
    TlsClientAuth,
}

impl TokenEndpointAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClientSecretBasic => "client_secret_basic",
            Self::ClientSecretPost => "client_secret_post",
            Self::ClientSecretJwt => "client_secret_jwt",
            Self::PrivateKeyJwt => "private_key_jwt",
            Self::TlsClientAuth => "tls_client_auth",
        }
    }
}

/// Registered relying party. Immutable for the duration of a request; served
/// through the registry's read-through cache with a short TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    /// Argon2 hash (or legacy `sha256:`/plain value) of the client secret.
    pub secret: Option<String>,
    pub redirect_uris: Vec<String>,
    pub token_endpoint_auth_method: TokenEndpointAuthMethod,
    /// Inline JWK set; takes precedence over `jwks_uri`.
    pub jwks: Option<serde_json::Value>,
    pub jwks_uri: Option<String>,
    pub id_token_encrypted_response_alg: Option<String>,
    pub id_token_encrypted_response_enc: Option<String>,
    pub allow_claims_without_scope: bool,
    pub allowed_scopes: Vec<String>,
    pub require_pushed_authorization_requests: bool,
    /// S256 thumbprint of the registered client certificate, for
    /// `tls_client_auth`.
    pub certificate_thumbprint: Option<String>,
    pub tenant_id: String,
}

impl Client {
    pub fn is_public(&self) -> bool {
        self.token_endpoint_auth_method == TokenEndpointAuthMethod::None
    }

    pub fn is_confidential(&self) -> bool {
        !self.is_public()
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    pub fn has_registered_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }

    pub fn wants_encrypted_id_token(&self) -> bool {
        self.id_token_encrypted_response_alg.is_some()
    }

    pub fn scope_allowed(&self, scope: &str) -> bool {
        self.allowed_scopes.is_empty() || self.allowed_scopes.iter().any(|s| s == scope)
    }
}
