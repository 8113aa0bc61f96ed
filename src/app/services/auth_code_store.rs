use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::actor::{ActorState, ShardRouter, ShardedStore};
use crate::app::error::OAuthError;
use crate::app::models::auth_code::{AuthCode, AuthCodeContext};
use crate::config::ConfigResolver;

use super::pkce;

#[derive(Debug, Default)]
pub struct AuthCodeState {
    codes: HashMap<String, AuthCode>,
    live_per_user: HashMap<String, usize>,
}

#[derive(Clone, Debug)]
pub enum AuthCodeOp {
    Store {
        code: Box<AuthCode>,
        max_per_user: usize,
    },
    Consume {
        code: String,
        client_id: String,
        code_verifier: Option<String>,
        access_token_jti: String,
        refresh_token_jti: Option<String>,
    },
}

#[derive(Debug)]
pub enum AuthCodeReply {
    Stored,
    TooManyCodes,
    Consumed(Box<AuthCodeContext>),
    /// Second consumption of a used code. Carries the jtis registered at
    /// first use so the caller can revoke them.
    Replayed {
        access_token_jti: Option<String>,
        refresh_token_jti: Option<String>,
    },
    NotFound,
    Expired,
    ClientMismatch,
    PkceFailed(String),
}

impl AuthCodeState {
    fn decrement_user(&mut self, user_id: &str) {
        if let Some(count) = self.live_per_user.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.live_per_user.remove(user_id);
            }
        }
    }
}

impl ActorState for AuthCodeState {
    type Op = AuthCodeOp;
    type Reply = AuthCodeReply;

    fn apply(&mut self, op: AuthCodeOp, now: DateTime<Utc>) -> AuthCodeReply {
        match op {
            AuthCodeOp::Store { code, max_per_user } => {
                let live = self.live_per_user.get(&code.user_id).copied().unwrap_or(0);
                if live >= max_per_user {
                    return AuthCodeReply::TooManyCodes;
                }
                *self.live_per_user.entry(code.user_id.clone()).or_insert(0) += 1;
                self.codes.insert(code.code.clone(), *code);
                AuthCodeReply::Stored
            }
            AuthCodeOp::Consume {
                code,
                client_id,
                code_verifier,
                access_token_jti,
                refresh_token_jti,
            } => {
                let record = match self.codes.get_mut(&code) {
                    Some(record) => record,
                    None => return AuthCodeReply::NotFound,
                };

                if record.is_expired(now) {
                    return AuthCodeReply::Expired;
                }

                if record.used {
                    // Replay: surface the registered jtis for revocation.
                    return AuthCodeReply::Replayed {
                        access_token_jti: record.issued_access_token_jti.clone(),
                        refresh_token_jti: record.issued_refresh_token_jti.clone(),
                    };
                }

                if record.client_id != client_id {
                    return AuthCodeReply::ClientMismatch;
                }

                if let Some(challenge) = record.code_challenge.clone() {
                    let method = record.code_challenge_method.as_deref().unwrap_or("plain");
                    let verifier = match code_verifier.as_deref() {
                        Some(v) => v,
                        None => {
                            return AuthCodeReply::PkceFailed("code_verifier is required".to_string())
                        }
                    };
                    if let Err(err) = pkce::verify(&challenge, method, verifier) {
                        return AuthCodeReply::PkceFailed(
                            err.public_description().unwrap_or_default(),
                        );
                    }
                }

                // All checks passed: flip used and register the issued jtis
                // in the same apply, with no await point in between.
                record.used = true;
                record.issued_access_token_jti = Some(access_token_jti);
                record.issued_refresh_token_jti = refresh_token_jti;

                let context = AuthCodeContext::from(&*record);
                let user_id = record.user_id.clone();
                self.decrement_user(&user_id);
                AuthCodeReply::Consumed(Box::new(context))
            }
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .codes
            .iter()
            .filter(|(_, code)| code.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(code) = self.codes.remove(key) {
                if !code.used {
                    self.decrement_user(&code.user_id);
                }
            }
        }
        expired.len()
    }
}

/// Outcome of consuming a code, after the actor reply is mapped: either the
/// bound authorization context, or a replay carrying jtis to revoke.
pub enum ConsumeOutcome {
    Consumed(AuthCodeContext),
    Replayed {
        access_token_jti: Option<String>,
        refresh_token_jti: Option<String>,
    },
}

#[derive(Clone)]
pub struct AuthCodeStore {
    shards: ShardedStore<AuthCodeState>,
    resolver: ConfigResolver,
    tenant: String,
}

impl AuthCodeStore {
    pub fn new(router: ShardRouter, resolver: ConfigResolver, tenant: &str) -> Self {
        Self {
            shards: ShardedStore::spawn_with(router, std::time::Duration::from_secs(30), |_| {
                AuthCodeState::default()
            }),
            resolver,
            tenant: tenant.to_string(),
        }
    }

    /// Mint a code bound to the authorization outcome. Enforces the per-user
    /// live-code cap inside the owning actor.
    pub async fn mint(&self, mut code: AuthCode) -> Result<String, OAuthError> {
        let ttl = self.resolver.auth_code_ttl().await;
        let max_per_user = self.resolver.max_codes_per_user().await;
        code.expires_at = Utc::now() + Duration::seconds(ttl);

        let value = code.code.clone();
        let reply = self
            .shards
            .handle_for(&self.tenant, &value)
            .call_once(AuthCodeOp::Store {
                code: Box::new(code),
                max_per_user,
            })
            .await?;

        match reply {
            AuthCodeReply::Stored => Ok(value),
            AuthCodeReply::TooManyCodes => Err(OAuthError::InvalidRequest(
                "too many pending authorization codes".to_string(),
            )),
            _ => Err(OAuthError::ServerError(anyhow::anyhow!(
                "unexpected store reply"
            ))),
        }
    }

    pub async fn consume(
        &self,
        code: &str,
        client_id: &str,
        code_verifier: Option<&str>,
        access_token_jti: &str,
        refresh_token_jti: Option<&str>,
    ) -> Result<ConsumeOutcome, OAuthError> {
        let reply = self
            .shards
            .handle_for(&self.tenant, code)
            .call(AuthCodeOp::Consume {
                code: code.to_string(),
                client_id: client_id.to_string(),
                code_verifier: code_verifier.map(|s| s.to_string()),
                access_token_jti: access_token_jti.to_string(),
                refresh_token_jti: refresh_token_jti.map(|s| s.to_string()),
            })
            .await?;

        match reply {
            AuthCodeReply::Consumed(context) => Ok(ConsumeOutcome::Consumed(*context)),
            AuthCodeReply::Replayed {
                access_token_jti,
                refresh_token_jti,
            } => Ok(ConsumeOutcome::Replayed {
                access_token_jti,
                refresh_token_jti,
            }),
            AuthCodeReply::NotFound => {
                Err(OAuthError::InvalidGrant("unknown authorization code".to_string()))
            }
            AuthCodeReply::Expired => {
                Err(OAuthError::InvalidGrant("authorization code expired".to_string()))
            }
            AuthCodeReply::ClientMismatch => Err(OAuthError::InvalidGrant(
                "authorization code was issued to another client".to_string(),
            )),
            AuthCodeReply::PkceFailed(detail) => Err(OAuthError::InvalidGrant(detail)),
            AuthCodeReply::Stored | AuthCodeReply::TooManyCodes => Err(OAuthError::ServerError(
                anyhow::anyhow!("unexpected consume reply"),
            )),
        }
    }
}
