use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::actor::replay_window::{ReplayWindowOp, ReplayWindowState};
use crate::actor::{ShardRouter, ShardedStore};
use crate::app::error::OAuthError;
use crate::app::models::{Client, TokenEndpointAuthMethod};

use super::client_registry::ClientRegistry;
use super::{crypto, jwk};

pub const JWT_BEARER_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(3);
const ASSERTION_MAX_LIFETIME: i64 = 300;

/// Client credentials as they arrive on PAR/token/introspection requests.
/// Controllers flatten these out of the form body; Basic credentials come
/// from headers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientAuthParams {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
}

impl ClientAuthParams {
    pub fn from_map(map: &std::collections::HashMap<String, String>) -> Self {
        let take = |key: &str| map.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            client_id: take("client_id"),
            client_secret: take("client_secret"),
            client_assertion_type: take("client_assertion_type"),
            client_assertion: take("client_assertion"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub client: Client,
    pub method: TokenEndpointAuthMethod,
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    #[allow(dead_code)]
    aud: Value,
    exp: i64,
    jti: String,
}

/// Client authentication for the PAR and token endpoints. Methods are tried
/// strongest first: JWT assertion, then client secret (Basic or form), then
/// public client where the profile permits one.
#[derive(Clone)]
pub struct ClientAuthService {
    registry: ClientRegistry,
    assertion_jti: ShardedStore<ReplayWindowState>,
    http: reqwest::Client,
}

impl ClientAuthService {
    pub fn new(registry: ClientRegistry, router: ShardRouter) -> Self {
        Self {
            registry,
            assertion_jti: ShardedStore::spawn_with(router, Duration::from_secs(120), |_| {
                ReplayWindowState::default()
            }),
            http: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        params: &ClientAuthParams,
        endpoint_url: &str,
        fapi: bool,
    ) -> Result<AuthenticatedClient, OAuthError> {
        // 1. JWT client assertion (client_secret_jwt / private_key_jwt).
        if params.client_assertion_type.as_deref() == Some(JWT_BEARER_ASSERTION_TYPE) {
            let assertion = params.client_assertion.as_deref().ok_or_else(|| {
                OAuthError::InvalidClient("client_assertion is required".to_string())
            })?;
            let authenticated = self.authenticate_assertion(assertion, endpoint_url).await?;
            return self.enforce_fapi(authenticated, fapi);
        }

        // 2. Client secret, Basic header taking precedence over form fields.
        let basic = Self::basic_credentials(headers)?;
        let (client_id, secret) = match &basic {
            Some((id, secret)) => (Some(id.as_str()), Some(secret.as_str())),
            None => (params.client_id.as_deref(), params.client_secret.as_deref()),
        };

        let client_id = client_id
            .ok_or_else(|| OAuthError::InvalidClient("client_id is required".to_string()))?;
        let client = self
            .registry
            .find(client_id)
            .await
            .map_err(OAuthError::ServerError)?
            .ok_or_else(|| OAuthError::InvalidClient("unknown client".to_string()))?;

        if let Some(secret) = secret {
            if !Self::verify_secret(&client, secret)? {
                return Err(OAuthError::InvalidClient("client authentication failed".to_string()));
            }
            let method = if basic.is_some() {
                TokenEndpointAuthMethod::ClientSecretBasic
            } else {
                TokenEndpointAuthMethod::ClientSecretPost
            };
            return self.enforce_fapi(AuthenticatedClient { client, method }, fapi);
        }

        // 3. mTLS-bound clients present a certificate instead of a secret.
        if client.token_endpoint_auth_method == TokenEndpointAuthMethod::TlsClientAuth {
            let thumbprint = Self::certificate_thumbprint(headers).ok_or_else(|| {
                OAuthError::InvalidClient("client certificate required".to_string())
            })?;
            match &client.certificate_thumbprint {
                Some(registered) if crypto::constant_time_compare(registered.as_bytes(), thumbprint.as_bytes()) => {
                    return self.enforce_fapi(
                        AuthenticatedClient {
                            client,
                            method: TokenEndpointAuthMethod::TlsClientAuth,
                        },
                        fapi,
                    );
                }
                _ => {
                    return Err(OAuthError::InvalidClient(
                        "certificate does not match registration".to_string(),
                    ));
                }
            }
        }

        // 4. Public client, only when registered as such.
        if client.is_public() {
            return self.enforce_fapi(
                AuthenticatedClient {
                    client,
                    method: TokenEndpointAuthMethod::None,
                },
                fapi,
            );
        }

        Err(OAuthError::InvalidClient("client authentication required".to_string()))
    }

    fn enforce_fapi(
        &self,
        authenticated: AuthenticatedClient,
        fapi: bool,
    ) -> Result<AuthenticatedClient, OAuthError> {
        if fapi
            && !matches!(
                authenticated.method,
                TokenEndpointAuthMethod::PrivateKeyJwt | TokenEndpointAuthMethod::TlsClientAuth
            )
        {
            return Err(OAuthError::InvalidClient(
                "profile requires private_key_jwt or tls_client_auth".to_string(),
            ));
        }
        Ok(authenticated)
    }

    async fn authenticate_assertion(
        &self,
        assertion: &str,
        endpoint_url: &str,
    ) -> Result<AuthenticatedClient, OAuthError> {
        let header = jsonwebtoken::decode_header(assertion)
            .map_err(|e| OAuthError::InvalidClient(format!("invalid client_assertion: {}", e)))?;

        // Pre-read the unverified subject to locate the client record.
        let unverified = Self::unverified_claims(assertion)?;
        if unverified.iss != unverified.sub {
            return Err(OAuthError::InvalidClient("assertion iss must equal sub".to_string()));
        }
        let client_id = unverified.sub.clone();

        let client = self
            .registry
            .find(&client_id)
            .await
            .map_err(OAuthError::ServerError)?
            .ok_or_else(|| OAuthError::InvalidClient("unknown client".to_string()))?;

        let (decoding_key, method) = self.assertion_key(&client, &header).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[endpoint_url]);
        validation.set_issuer(&[&client_id]);
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);
        validation.leeway = 30;

        let claims = jsonwebtoken::decode::<AssertionClaims>(assertion, &decoding_key, &validation)
            .map_err(|e| OAuthError::InvalidClient(format!("assertion verification failed: {}", e)))?
            .claims;

        let now = Utc::now().timestamp();
        if claims.exp - now > ASSERTION_MAX_LIFETIME {
            return Err(OAuthError::InvalidClient("assertion lifetime too long".to_string()));
        }

        // Assertion jti must be unique within its lifetime.
        let ttl = (claims.exp - now).clamp(1, ASSERTION_MAX_LIFETIME);
        let fresh = self
            .assertion_jti
            .handle_for(&client.tenant_id, &client_id)
            .call(ReplayWindowOp::Observe {
                key: format!("{}:{}", client_id, claims.jti),
                ttl_seconds: ttl,
            })
            .await?;
        if !fresh {
            tracing::warn!(client_id = %client_id, "replayed client assertion jti");
            return Err(OAuthError::InvalidClient("assertion jti already used".to_string()));
        }

        Ok(AuthenticatedClient { client, method })
    }

    async fn assertion_key(
        &self,
        client: &Client,
        header: &jsonwebtoken::Header,
    ) -> Result<(DecodingKey, TokenEndpointAuthMethod), OAuthError> {
        match header.alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = client.secret.as_ref().ok_or_else(|| {
                    OAuthError::InvalidClient("client has no secret for HMAC assertion".to_string())
                })?;
                Ok((
                    DecodingKey::from_secret(secret.as_bytes()),
                    TokenEndpointAuthMethod::ClientSecretJwt,
                ))
            }
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::ES256
            | Algorithm::ES384 => {
                let jwks = self.client_jwks(client).await?;
                let key = jwk::select_key(&jwks, header.kid.as_deref()).ok_or_else(|| {
                    OAuthError::InvalidClient("no matching key in client JWKS".to_string())
                })?;
                let decoding = jwk::decoding_key_from_jwk(key)
                    .map_err(|e| OAuthError::InvalidClient(e.to_string()))?;
                Ok((decoding, TokenEndpointAuthMethod::PrivateKeyJwt))
            }
            _ => Err(OAuthError::InvalidClient("unsupported assertion algorithm".to_string())),
        }
    }

    /// Client verification keys: inline `jwks` wins, else fetch `jwks_uri`
    /// behind the SSRF guard with a 3 s budget.
    pub async fn client_jwks(&self, client: &Client) -> Result<Value, OAuthError> {
        if let Some(jwks) = &client.jwks {
            return Ok(jwks.clone());
        }
        let uri = client.jwks_uri.as_ref().ok_or_else(|| {
            OAuthError::InvalidClient("client has no registered JWKS".to_string())
        })?;
        validate_jwks_uri(uri)?;

        let response = self
            .http
            .get(uri)
            .timeout(JWKS_FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| OAuthError::ServerError(anyhow::anyhow!("JWKS fetch failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(OAuthError::ServerError(anyhow::anyhow!(
                "JWKS fetch returned {}",
                response.status()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| OAuthError::ServerError(anyhow::anyhow!("JWKS parse failed: {}", e)))
    }

    fn unverified_claims(assertion: &str) -> Result<AssertionClaims, OAuthError> {
        let payload = assertion
            .split('.')
            .nth(1)
            .ok_or_else(|| OAuthError::InvalidClient("malformed assertion".to_string()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| OAuthError::InvalidClient("invalid assertion encoding".to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| OAuthError::InvalidClient("invalid assertion claims".to_string()))
    }

    fn basic_credentials(headers: &HeaderMap) -> Result<Option<(String, String)>, OAuthError> {
        let header = match headers.get("authorization").and_then(|h| h.to_str().ok()) {
            Some(h) => h,
            None => return Ok(None),
        };
        let encoded = match header.strip_prefix("Basic ") {
            Some(e) => e,
            None => return Ok(None),
        };

        let decoded = STANDARD
            .decode(encoded)
            .map_err(|_| OAuthError::InvalidClient("invalid Basic credentials".to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| OAuthError::InvalidClient("invalid Basic credentials".to_string()))?;

        let (id, secret) = decoded
            .split_once(':')
            .ok_or_else(|| OAuthError::InvalidClient("invalid Basic credential format".to_string()))?;
        Ok(Some((id.to_string(), secret.to_string())))
    }

    /// Constant-time secret check against argon2 (preferred), legacy
    /// `sha256:` digests, or plain stored values.
    pub fn verify_secret(client: &Client, provided: &str) -> Result<bool, OAuthError> {
        let stored = client
            .secret
            .as_ref()
            .ok_or_else(|| OAuthError::InvalidClient("client has no secret".to_string()))?;

        if stored.starts_with("$argon2") {
            use argon2::password_hash::{PasswordHash, PasswordVerifier};
            let parsed = PasswordHash::new(stored)
                .map_err(|e| OAuthError::ServerError(anyhow::anyhow!("bad secret hash: {}", e)))?;
            Ok(argon2::Argon2::default()
                .verify_password(provided.as_bytes(), &parsed)
                .is_ok())
        } else if let Some(digest) = stored.strip_prefix("sha256:") {
            let computed = crypto::sha256_hex(provided.as_bytes());
            Ok(crypto::constant_time_compare(digest.as_bytes(), computed.as_bytes()))
        } else {
            Ok(crypto::constant_time_compare(stored.as_bytes(), provided.as_bytes()))
        }
    }

    pub fn hash_secret(secret: &str) -> anyhow::Result<String> {
        use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
        let salt = SaltString::generate(&mut OsRng);
        argon2::Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| anyhow::anyhow!("secret hashing failed: {}", e))
    }

    pub fn generate_secret() -> String {
        use rand::{distributions::Alphanumeric, Rng};
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(64)
            .map(char::from)
            .collect()
    }

    /// S256 thumbprint of the forwarded client certificate, when the fronting
    /// proxy passes one. The header carries URL-encoded PEM.
    pub fn certificate_thumbprint(headers: &HeaderMap) -> Option<String> {
        let raw = headers.get("x-client-cert")?.to_str().ok()?;
        let pem = urlencoding::decode(raw).ok()?;
        let der = x509_parser::pem::Pem::iter_from_buffer(pem.as_bytes())
            .next()?
            .ok()?
            .contents;
        // Validate it actually parses as a certificate before trusting it.
        x509_parser::parse_x509_certificate(&der).ok()?;
        Some(crypto::sha256_b64url(&der))
    }
}

/// SSRF guard for client-supplied JWKS locations: HTTPS to a public DNS name
/// on port 443, never an IP literal, loopback, or internal TLD.
pub fn validate_jwks_uri(raw: &str) -> Result<(), OAuthError> {
    let parsed = url::Url::parse(raw)
        .map_err(|_| OAuthError::InvalidClient("invalid jwks_uri".to_string()))?;

    if parsed.scheme() != "https" {
        return Err(OAuthError::InvalidClient("jwks_uri must use https".to_string()));
    }
    if let Some(port) = parsed.port() {
        if port != 443 {
            return Err(OAuthError::InvalidClient("jwks_uri port must be 443".to_string()));
        }
    }

    let host = match parsed.host() {
        Some(url::Host::Domain(domain)) => domain.to_ascii_lowercase(),
        // IP literals can never be "public DNS".
        _ => return Err(OAuthError::InvalidClient("jwks_uri host must be a DNS name".to_string())),
    };

    const INTERNAL_SUFFIXES: &[&str] = &[".local", ".localhost", ".internal", ".lan", ".home", ".corp"];
    if host == "localhost"
        || !host.contains('.')
        || INTERNAL_SUFFIXES.iter().any(|suffix| host.ends_with(suffix))
    {
        return Err(OAuthError::InvalidClient("jwks_uri host is not public".to_string()));
    }

    Ok(())
}
