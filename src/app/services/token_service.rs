use chrono::{Duration, Utc};
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use serde_json::{json, Value};
use ulid::Ulid;

use crate::app::error::OAuthError;
use crate::app::models::token::{AccessTokenRecord, RefreshTokenRecord, TokenResponse};
use crate::app::models::Client;
use crate::config::ConfigResolver;

use super::auth_code_store::{AuthCodeStore, ConsumeOutcome};
use super::ciba_service::CibaService;
use super::client_auth_service::ClientAuthParams;
use super::device_service::DeviceService;
use super::key_ring::KeyRing;
use super::token_store::{RefreshTokenReply, TokenStore};
use super::crypto;

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
pub const GRANT_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
pub const GRANT_CIBA: &str = "urn:openid:params:grant-type:ciba";
pub const GRANT_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

pub const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub device_code: Option<String>,
    pub auth_req_id: Option<String>,
    pub subject_token: Option<String>,
    pub subject_token_type: Option<String>,
    pub actor_token: Option<String>,
    pub actor_token_type: Option<String>,
    pub audience: Option<String>,
    pub requested_token_type: Option<String>,
    #[serde(flatten)]
    pub client: ClientAuthParams,
}

impl TokenRequest {
    pub fn from_map(map: &std::collections::HashMap<String, String>) -> Self {
        let take = |key: &str| map.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            grant_type: take("grant_type"),
            code: take("code"),
            redirect_uri: take("redirect_uri"),
            code_verifier: take("code_verifier"),
            refresh_token: take("refresh_token"),
            scope: take("scope"),
            device_code: take("device_code"),
            auth_req_id: take("auth_req_id"),
            subject_token: take("subject_token"),
            subject_token_type: take("subject_token_type"),
            actor_token: take("actor_token"),
            actor_token_type: take("actor_token_type"),
            audience: take("audience"),
            requested_token_type: take("requested_token_type"),
            client: ClientAuthParams::from_map(map),
        }
    }
}

/// Inputs for one issuance round; everything the id_token needs travels here.
#[derive(Debug, Default)]
struct Issuance {
    user_id: Option<String>,
    scope: String,
    dpop_jkt: Option<String>,
    sid: Option<String>,
    nonce: Option<String>,
    auth_time: Option<i64>,
    acr: Option<String>,
    amr: Vec<String>,
    with_refresh: bool,
    refresh_family: Option<String>,
    preset_access_jti: Option<String>,
    preset_refresh: Option<(String, String)>,
}

#[derive(Debug)]
pub struct HybridTokens {
    pub access_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: i64,
}

#[derive(Clone)]
pub struct TokenService {
    key_ring: KeyRing,
    store: TokenStore,
    auth_codes: AuthCodeStore,
    device: DeviceService,
    ciba: CibaService,
    resolver: ConfigResolver,
}

impl TokenService {
    pub fn new(
        key_ring: KeyRing,
        store: TokenStore,
        auth_codes: AuthCodeStore,
        device: DeviceService,
        ciba: CibaService,
        resolver: ConfigResolver,
    ) -> Self {
        Self {
            key_ring,
            store,
            auth_codes,
            device,
            ciba,
            resolver,
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn key_ring(&self) -> &KeyRing {
        &self.key_ring
    }

    /// Dispatch a token request for an already-authenticated client.
    /// `dpop_jkt` is the thumbprint of a proof validated by the endpoint.
    pub async fn handle(
        &self,
        request: TokenRequest,
        client: &Client,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        match request.grant_type.as_deref() {
            Some(GRANT_AUTHORIZATION_CODE) => {
                self.grant_authorization_code(request, client, dpop_jkt).await
            }
            Some(GRANT_REFRESH_TOKEN) => self.grant_refresh_token(request, client, dpop_jkt).await,
            Some(GRANT_CLIENT_CREDENTIALS) => {
                self.grant_client_credentials(request, client, dpop_jkt).await
            }
            Some(GRANT_DEVICE_CODE) => self.grant_device_code(request, client, dpop_jkt).await,
            Some(GRANT_CIBA) => self.grant_ciba(request, client, dpop_jkt).await,
            Some(GRANT_TOKEN_EXCHANGE) => self.grant_token_exchange(request, client).await,
            Some(_) => Err(OAuthError::UnsupportedGrantType),
            None => Err(OAuthError::InvalidRequest("grant_type is required".to_string())),
        }
    }

    async fn grant_authorization_code(
        &self,
        request: TokenRequest,
        client: &Client,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        let code = request
            .code
            .as_deref()
            .ok_or_else(|| OAuthError::InvalidRequest("code is required".to_string()))?;
        let redirect_uri = request
            .redirect_uri
            .as_deref()
            .ok_or_else(|| OAuthError::InvalidRequest("redirect_uri is required".to_string()))?;

        // jtis are minted first so the code records them atomically at
        // consume time; a later replay hands them back for revocation.
        let access_jti = Ulid::new().to_string();
        let refresh_token = RefreshTokenRecord::generate_token();
        let refresh_jti = Ulid::new().to_string();

        let outcome = self
            .auth_codes
            .consume(
                code,
                &client.client_id,
                request.code_verifier.as_deref(),
                &access_jti,
                Some(&refresh_jti),
            )
            .await?;

        let context = match outcome {
            ConsumeOutcome::Consumed(context) => context,
            ConsumeOutcome::Replayed {
                access_token_jti,
                refresh_token_jti,
            } => {
                tracing::warn!(client_id = %client.client_id, "authorization code replay, revoking issued tokens");
                if let Some(jti) = access_token_jti {
                    self.store.revoke_access(&jti).await?;
                    self.store.revoke_refresh_of_access(&jti).await?;
                }
                if let Some(jti) = refresh_token_jti {
                    self.store.revoke_refresh_by_jti(&jti).await?;
                }
                return Err(OAuthError::InvalidGrant(
                    "authorization code already used".to_string(),
                ));
            }
        };

        if context.redirect_uri != redirect_uri {
            return Err(OAuthError::InvalidGrant("redirect_uri mismatch".to_string()));
        }

        // A code bound to a DPoP key is only redeemable with a proof from
        // that key.
        if let Some(bound) = &context.dpop_jkt {
            match &dpop_jkt {
                Some(presented) if presented == bound => {}
                Some(_) => {
                    return Err(OAuthError::InvalidDpopProof(
                        "proof key does not match the bound key".to_string(),
                    ))
                }
                None => {
                    return Err(OAuthError::InvalidDpopProof(
                        "DPoP proof required for this code".to_string(),
                    ))
                }
            }
        }

        self.issue(
            client,
            Issuance {
                user_id: Some(context.user_id.clone()),
                scope: context.scope.clone(),
                dpop_jkt: context.dpop_jkt.clone().or(dpop_jkt),
                sid: context.sid.clone(),
                nonce: context.nonce.clone(),
                auth_time: context.auth_time,
                acr: context.acr.clone(),
                amr: Vec::new(),
                with_refresh: true,
                refresh_family: None,
                preset_access_jti: Some(access_jti),
                preset_refresh: Some((refresh_token, refresh_jti)),
            },
        )
        .await
    }

    async fn grant_refresh_token(
        &self,
        request: TokenRequest,
        client: &Client,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        let presented = request
            .refresh_token
            .as_deref()
            .ok_or_else(|| OAuthError::InvalidRequest("refresh_token is required".to_string()))?;

        let refresh_ttl = self.resolver.refresh_token_ttl().await;
        let access_jti = Ulid::new().to_string();

        // The successor is fully built before rotation so the actor installs
        // it in the same step that burns the old token.
        let current = self
            .store
            .get_refresh(presented)
            .await?
            .ok_or_else(|| OAuthError::InvalidGrant("unknown refresh token".to_string()))?;

        let requested_scope = match request.scope.as_deref() {
            Some(scope) => {
                let granted: Vec<&str> = current.scope.split_whitespace().collect();
                for requested in scope.split_whitespace() {
                    if !granted.contains(&requested) {
                        return Err(OAuthError::InvalidScope(
                            "scope exceeds the original grant".to_string(),
                        ));
                    }
                }
                scope.to_string()
            }
            None => current.scope.clone(),
        };

        let successor = RefreshTokenRecord {
            token: RefreshTokenRecord::generate_token(),
            jti: Ulid::new().to_string(),
            family_id: current.family_id.clone(),
            client_id: client.client_id.clone(),
            user_id: current.user_id.clone(),
            scope: requested_scope.clone(),
            dpop_jkt: current.dpop_jkt.clone(),
            sid: current.sid.clone(),
            access_token_jti: access_jti.clone(),
            used: false,
            revoked: false,
            expires_at: Utc::now() + Duration::seconds(refresh_ttl),
        };
        let successor_token = successor.token.clone();

        let reply = self
            .store
            .rotate_refresh(presented, &client.client_id, successor)
            .await?;

        let consumed = match reply {
            RefreshTokenReply::Rotated(old) => old,
            RefreshTokenReply::ReuseDetected { access_token_jtis } => {
                for jti in access_token_jtis {
                    self.store.revoke_access(&jti).await?;
                }
                return Err(OAuthError::InvalidGrant(
                    "refresh token reuse detected".to_string(),
                ));
            }
            RefreshTokenReply::NotFound => {
                return Err(OAuthError::InvalidGrant("unknown refresh token".to_string()))
            }
            RefreshTokenReply::Expired => {
                return Err(OAuthError::InvalidGrant("refresh token expired".to_string()))
            }
            RefreshTokenReply::ClientMismatch => {
                return Err(OAuthError::InvalidGrant(
                    "refresh token belongs to another client".to_string(),
                ))
            }
            _ => {
                return Err(OAuthError::ServerError(anyhow::anyhow!(
                    "unexpected rotation reply"
                )))
            }
        };

        if let Some(bound) = &consumed.dpop_jkt {
            if dpop_jkt.as_deref() != Some(bound.as_str()) {
                return Err(OAuthError::InvalidDpopProof(
                    "proof key does not match the bound key".to_string(),
                ));
            }
        }

        self.issue(
            client,
            Issuance {
                user_id: Some(consumed.user_id.clone()),
                scope: requested_scope,
                dpop_jkt: consumed.dpop_jkt.clone(),
                sid: consumed.sid.clone(),
                with_refresh: false,
                preset_access_jti: Some(access_jti),
                preset_refresh: Some((successor_token, String::new())),
                ..Default::default()
            },
        )
        .await
    }

    async fn grant_client_credentials(
        &self,
        request: TokenRequest,
        client: &Client,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        if client.is_public() {
            return Err(OAuthError::UnauthorizedClient(
                "public clients cannot use client_credentials".to_string(),
            ));
        }

        let scope = request.scope.clone().unwrap_or_default();
        for requested in scope.split_whitespace() {
            if !client.scope_allowed(requested) {
                return Err(OAuthError::InvalidScope(format!(
                    "scope {} is not allowed for this client",
                    requested
                )));
            }
        }

        self.issue(
            client,
            Issuance {
                user_id: None,
                scope,
                dpop_jkt,
                with_refresh: false,
                ..Default::default()
            },
        )
        .await
    }

    async fn grant_device_code(
        &self,
        request: TokenRequest,
        client: &Client,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        let device_code = request
            .device_code
            .as_deref()
            .ok_or_else(|| OAuthError::InvalidRequest("device_code is required".to_string()))?;

        let artifact = self.device.poll(device_code, &client.client_id).await?;
        let user_id = artifact
            .user_id
            .clone()
            .ok_or_else(|| OAuthError::ServerError(anyhow::anyhow!("approved grant without user")))?;

        self.issue(
            client,
            Issuance {
                user_id: Some(user_id),
                scope: artifact.scope.clone(),
                dpop_jkt,
                with_refresh: true,
                ..Default::default()
            },
        )
        .await
    }

    async fn grant_ciba(
        &self,
        request: TokenRequest,
        client: &Client,
        dpop_jkt: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        let auth_req_id = request
            .auth_req_id
            .as_deref()
            .ok_or_else(|| OAuthError::InvalidRequest("auth_req_id is required".to_string()))?;

        let ciba_request = self.ciba.poll(auth_req_id, &client.client_id).await?;
        let user_id = ciba_request
            .user_id
            .clone()
            .ok_or_else(|| OAuthError::ServerError(anyhow::anyhow!("approved request without user")))?;

        self.issue(
            client,
            Issuance {
                user_id: Some(user_id),
                scope: ciba_request.scope.clone(),
                dpop_jkt,
                with_refresh: true,
                ..Default::default()
            },
        )
        .await
    }

    /// RFC 8693. Subject (and optional actor) tokens must be access tokens
    /// from this issuer; the issued token's scope is bounded by the
    /// subject's.
    async fn grant_token_exchange(
        &self,
        request: TokenRequest,
        client: &Client,
    ) -> Result<TokenResponse, OAuthError> {
        let subject_token = request
            .subject_token
            .as_deref()
            .ok_or_else(|| OAuthError::InvalidRequest("subject_token is required".to_string()))?;
        if request.subject_token_type.as_deref() != Some(ACCESS_TOKEN_TYPE) {
            return Err(OAuthError::InvalidRequest(
                "unsupported subject_token_type".to_string(),
            ));
        }

        let (subject_record, subject_claims) = self.verify_access_token(subject_token).await?;

        let mut amr = Vec::new();
        if let Some(actor_token) = request.actor_token.as_deref() {
            if request.actor_token_type.as_deref() != Some(ACCESS_TOKEN_TYPE) {
                return Err(OAuthError::InvalidRequest(
                    "unsupported actor_token_type".to_string(),
                ));
            }
            let (actor_record, _) = self.verify_access_token(actor_token).await?;
            amr.push(format!("act:{}", actor_record.client_id));
        }

        let scope = match request.scope.as_deref() {
            Some(scope) => {
                let granted: Vec<&str> = subject_record.scope.split_whitespace().collect();
                for requested in scope.split_whitespace() {
                    if !granted.contains(&requested) {
                        return Err(OAuthError::InvalidScope(
                            "scope exceeds the subject token".to_string(),
                        ));
                    }
                }
                scope.to_string()
            }
            None => subject_record.scope.clone(),
        };

        let mut response = self
            .issue(
                client,
                Issuance {
                    user_id: subject_record.user_id.clone(),
                    scope,
                    amr,
                    with_refresh: false,
                    ..Default::default()
                },
            )
            .await?;
        response.issued_token_type = Some(ACCESS_TOKEN_TYPE.to_string());

        tracing::info!(
            client_id = %client.client_id,
            subject = %subject_claims["sub"],
            audience = request.audience.as_deref().unwrap_or("-"),
            "token exchange completed"
        );
        Ok(response)
    }

    async fn issue(&self, client: &Client, issuance: Issuance) -> Result<TokenResponse, OAuthError> {
        let now = Utc::now();
        let access_ttl = self.resolver.access_token_ttl().await;
        let refresh_ttl = self.resolver.refresh_token_ttl().await;
        let issuer = self.key_ring.issuer().to_string();

        let access_jti = issuance
            .preset_access_jti
            .clone()
            .unwrap_or_else(|| Ulid::new().to_string());
        let subject = issuance
            .user_id
            .clone()
            .unwrap_or_else(|| client.client_id.clone());

        let mut access_claims = json!({
            "iss": issuer,
            "sub": subject,
            "client_id": client.client_id,
            "jti": access_jti,
            "iat": now.timestamp(),
            "exp": (now + Duration::seconds(access_ttl)).timestamp(),
            "scope": issuance.scope,
        });
        if let Some(jkt) = &issuance.dpop_jkt {
            access_claims["cnf"] = json!({ "jkt": jkt });
        }
        if let Some(sid) = &issuance.sid {
            access_claims["sid"] = json!(sid);
        }

        let access_token = self
            .key_ring
            .sign_with_typ(&access_claims, Some("at+jwt"))
            .await
            .map_err(OAuthError::ServerError)?;

        self.store
            .store_access(AccessTokenRecord {
                jti: access_jti.clone(),
                client_id: client.client_id.clone(),
                user_id: issuance.user_id.clone(),
                scope: issuance.scope.clone(),
                cnf_jkt: issuance.dpop_jkt.clone(),
                sid: issuance.sid.clone(),
                revoked: false,
                expires_at: now + Duration::seconds(access_ttl),
            })
            .await?;

        // Refresh token: new family unless this round continues one.
        let refresh_token = if issuance.with_refresh {
            let (token, jti) = issuance
                .preset_refresh
                .clone()
                .unwrap_or_else(|| (RefreshTokenRecord::generate_token(), Ulid::new().to_string()));
            let user_id = issuance.user_id.clone().unwrap_or_default();
            self.store
                .store_refresh(RefreshTokenRecord {
                    token: token.clone(),
                    jti,
                    family_id: issuance
                        .refresh_family
                        .clone()
                        .unwrap_or_else(|| Ulid::new().to_string()),
                    client_id: client.client_id.clone(),
                    user_id,
                    scope: issuance.scope.clone(),
                    dpop_jkt: issuance.dpop_jkt.clone(),
                    sid: issuance.sid.clone(),
                    access_token_jti: access_jti.clone(),
                    used: false,
                    revoked: false,
                    expires_at: now + Duration::seconds(refresh_ttl),
                })
                .await?;
            Some(token)
        } else {
            // Rotation rounds hand the successor over without re-storing it.
            issuance.preset_refresh.as_ref().map(|(token, _)| token.clone())
        };

        let scopes: Vec<&str> = issuance.scope.split_whitespace().collect();
        let id_token = if scopes.contains(&"openid") && issuance.user_id.is_some() {
            Some(self.build_id_token(client, &issuance, &access_token, now).await?)
        } else {
            None
        };

        Ok(TokenResponse {
            access_token,
            token_type: if issuance.dpop_jkt.is_some() {
                "DPoP".to_string()
            } else {
                "Bearer".to_string()
            },
            expires_in: access_ttl,
            refresh_token,
            id_token,
            scope: if issuance.scope.is_empty() {
                None
            } else {
                Some(issuance.scope.clone())
            },
            issued_token_type: None,
        })
    }

    async fn build_id_token(
        &self,
        client: &Client,
        issuance: &Issuance,
        access_token: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<String, OAuthError> {
        let mut claims = json!({
            "iss": self.key_ring.issuer(),
            "sub": issuance.user_id.clone().unwrap_or_default(),
            "aud": client.client_id,
            "iat": now.timestamp(),
            "exp": (now + Duration::seconds(self.resolver.access_token_ttl().await)).timestamp(),
            "at_hash": crypto::at_hash(access_token),
        });
        if let Some(nonce) = &issuance.nonce {
            claims["nonce"] = json!(nonce);
        }
        if let Some(auth_time) = issuance.auth_time {
            claims["auth_time"] = json!(auth_time);
        }
        if let Some(acr) = &issuance.acr {
            claims["acr"] = json!(acr);
        }
        if !issuance.amr.is_empty() {
            claims["amr"] = json!(issuance.amr);
        }
        if let Some(sid) = &issuance.sid {
            claims["sid"] = json!(sid);
        }

        let signed = self.key_ring.sign(&claims).await.map_err(OAuthError::ServerError)?;

        if client.wants_encrypted_id_token() {
            let jwks = client.jwks.as_ref().ok_or_else(|| {
                OAuthError::ServerError(anyhow::anyhow!(
                    "client requires id_token encryption but registered no JWKS"
                ))
            })?;
            let enc_key = jwks
                .get("keys")
                .and_then(|keys| keys.as_array())
                .and_then(|keys| {
                    keys.iter()
                        .find(|k| k.get("use").and_then(|u| u.as_str()) == Some("enc"))
                        .or_else(|| keys.first())
                })
                .ok_or_else(|| {
                    OAuthError::ServerError(anyhow::anyhow!("no encryption key in client JWKS"))
                })?;
            return KeyRing::encrypt_to_jwk(enc_key, &signed).map_err(OAuthError::ServerError);
        }

        Ok(signed)
    }

    /// Tokens issued alongside the code in hybrid responses
    /// (`code id_token`, `code token`, `code id_token token`). The id_token
    /// carries `c_hash`, and `at_hash` when an access token rides along.
    #[allow(clippy::too_many_arguments)]
    pub async fn issue_hybrid(
        &self,
        client: &Client,
        user_id: &str,
        scope: &str,
        code: &str,
        nonce: Option<&str>,
        auth_time: Option<i64>,
        acr: Option<&str>,
        sid: Option<&str>,
        include_access_token: bool,
        include_id_token: bool,
    ) -> Result<HybridTokens, OAuthError> {
        let now = Utc::now();
        let access_ttl = self.resolver.access_token_ttl().await;

        let access_token = if include_access_token {
            let jti = Ulid::new().to_string();
            let claims = json!({
                "iss": self.key_ring.issuer(),
                "sub": user_id,
                "client_id": client.client_id,
                "jti": jti,
                "iat": now.timestamp(),
                "exp": (now + Duration::seconds(access_ttl)).timestamp(),
                "scope": scope,
            });
            let token = self
                .key_ring
                .sign_with_typ(&claims, Some("at+jwt"))
                .await
                .map_err(OAuthError::ServerError)?;
            self.store
                .store_access(AccessTokenRecord {
                    jti,
                    client_id: client.client_id.clone(),
                    user_id: Some(user_id.to_string()),
                    scope: scope.to_string(),
                    cnf_jkt: None,
                    sid: sid.map(|s| s.to_string()),
                    revoked: false,
                    expires_at: now + Duration::seconds(access_ttl),
                })
                .await?;
            Some(token)
        } else {
            None
        };

        let id_token = if include_id_token {
            let mut claims = json!({
                "iss": self.key_ring.issuer(),
                "sub": user_id,
                "aud": client.client_id,
                "iat": now.timestamp(),
                "exp": (now + Duration::seconds(access_ttl)).timestamp(),
                "c_hash": crypto::c_hash(code),
            });
            if let Some(nonce) = nonce {
                claims["nonce"] = json!(nonce);
            }
            if let Some(auth_time) = auth_time {
                claims["auth_time"] = json!(auth_time);
            }
            if let Some(acr) = acr {
                claims["acr"] = json!(acr);
            }
            if let Some(sid) = sid {
                claims["sid"] = json!(sid);
            }
            if let Some(token) = &access_token {
                claims["at_hash"] = json!(crypto::at_hash(token));
            }
            Some(self.key_ring.sign(&claims).await.map_err(OAuthError::ServerError)?)
        } else {
            None
        };

        Ok(HybridTokens {
            access_token,
            id_token,
            expires_in: access_ttl,
        })
    }

    /// Verify a presented access token: signature, expiry, and active-set
    /// membership. Returns the stored record and the verified claims.
    pub async fn verify_access_token(
        &self,
        token: &str,
    ) -> Result<(AccessTokenRecord, Value), OAuthError> {
        let claims = self
            .key_ring
            .verify(token, None, &[Algorithm::RS256])
            .await
            .map_err(|e| OAuthError::InvalidToken(e.to_string()))?;
        let jti = claims
            .get("jti")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OAuthError::InvalidToken("token has no jti".to_string()))?;

        let record = self
            .store
            .get_access(jti)
            .await?
            .ok_or_else(|| OAuthError::InvalidToken("token is not active".to_string()))?;
        if !record.is_active(Utc::now()) {
            return Err(OAuthError::InvalidToken("token is revoked or expired".to_string()));
        }
        Ok((record, claims))
    }

    /// RFC 7009 revocation. Opaque values are treated as refresh tokens,
    /// JWTs as access tokens; unknown tokens still return success.
    pub async fn revoke(&self, token: &str, client: &Client) -> Result<(), OAuthError> {
        if let Some(record) = self.store.get_refresh(token).await? {
            if record.client_id == client.client_id {
                self.store.revoke_refresh(token).await?;
            }
            return Ok(());
        }

        if let Ok(claims) = self.key_ring.verify(token, None, &[Algorithm::RS256]).await {
            if let Some(jti) = claims.get("jti").and_then(|v| v.as_str()) {
                if claims.get("client_id").and_then(|v| v.as_str()) == Some(client.client_id.as_str())
                {
                    self.store.revoke_access(jti).await?;
                    self.store.revoke_refresh_of_access(jti).await?;
                }
            }
        }
        Ok(())
    }

    /// Claims projection for userinfo, filtered by granted scopes. Subjects
    /// absent from the directory produce a generic `invalid_token`, never a
    /// user-enumeration signal.
    pub fn userinfo_claims(record: &AccessTokenRecord, client: &Client) -> Value {
        let mut claims = json!({ "sub": record.user_id.clone().unwrap_or_default() });
        let scopes: Vec<&str> = record.scope.split_whitespace().collect();

        if scopes.contains(&"profile") || client.allow_claims_without_scope {
            claims["name"] = json!(format!("user {}", record.user_id.clone().unwrap_or_default()));
            claims["updated_at"] = json!(Utc::now().timestamp());
        }
        if scopes.contains(&"email") || client.allow_claims_without_scope {
            if let Some(user_id) = &record.user_id {
                claims["email"] = json!(format!("{}@users.internal.invalid", user_id));
                claims["email_verified"] = json!(false);
            }
        }
        claims
    }
}
