use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::actor::{ActorState, ShardRouter, ShardedStore};
use crate::app::error::OAuthError;
use crate::app::models::Session;

#[derive(Debug, Default)]
pub struct SessionState {
    sessions: HashMap<String, Session>,
}

#[derive(Clone, Debug)]
pub enum SessionOp {
    Create { session: Box<Session> },
    Get { sid: String },
    Revoke { sid: String },
}

#[derive(Debug)]
pub enum SessionReply {
    Created,
    Found(Box<Session>),
    NotFound,
    Revoked,
}

impl ActorState for SessionState {
    type Op = SessionOp;
    type Reply = SessionReply;

    fn apply(&mut self, op: SessionOp, now: DateTime<Utc>) -> SessionReply {
        match op {
            SessionOp::Create { session } => {
                self.sessions.insert(session.sid.clone(), *session);
                SessionReply::Created
            }
            SessionOp::Get { sid } => match self.sessions.get(&sid) {
                Some(session) if !session.is_expired(now) => {
                    SessionReply::Found(Box::new(session.clone()))
                }
                _ => SessionReply::NotFound,
            },
            SessionOp::Revoke { sid } => {
                self.sessions.remove(&sid);
                SessionReply::Revoked
            }
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now));
        before - self.sessions.len()
    }
}

/// End-user session lifecycle, sharded by sid. One session may serve many
/// clients; `sid` flows into id_tokens.
#[derive(Clone)]
pub struct SessionService {
    shards: ShardedStore<SessionState>,
    tenant: String,
    default_ttl: i64,
}

impl SessionService {
    pub fn new(router: ShardRouter, tenant: &str, default_ttl: i64) -> Self {
        Self {
            shards: ShardedStore::spawn_with(router, std::time::Duration::from_secs(300), |_| {
                SessionState::default()
            }),
            tenant: tenant.to_string(),
            default_ttl,
        }
    }

    pub async fn create_session(
        &self,
        user_id: &str,
        amr: Vec<String>,
        acr: Option<String>,
        ttl_seconds: Option<i64>,
        metadata: serde_json::Value,
    ) -> Result<Session, OAuthError> {
        let now = Utc::now();
        let session = Session {
            sid: Session::generate_sid(),
            user_id: user_id.to_string(),
            amr,
            acr,
            auth_time: now,
            expires_at: now + Duration::seconds(ttl_seconds.unwrap_or(self.default_ttl)),
            metadata,
        };

        self.shards
            .handle_for(&self.tenant, &session.sid)
            .call_once(SessionOp::Create {
                session: Box::new(session.clone()),
            })
            .await?;
        tracing::debug!(sid = %session.sid, user_id, "session created");
        Ok(session)
    }

    pub async fn get_session(&self, sid: &str) -> Result<Option<Session>, OAuthError> {
        let reply = self
            .shards
            .handle_for(&self.tenant, sid)
            .call(SessionOp::Get { sid: sid.to_string() })
            .await?;
        match reply {
            SessionReply::Found(session) => Ok(Some(*session)),
            _ => Ok(None),
        }
    }

    pub async fn revoke_session(&self, sid: &str) -> Result<(), OAuthError> {
        self.shards
            .handle_for(&self.tenant, sid)
            .call(SessionOp::Revoke { sid: sid.to_string() })
            .await?;
        Ok(())
    }

    /// `prompt=none` resolution: an authenticated session that satisfies
    /// `max_age` and the requested ACR values, or the precise interaction
    /// error.
    pub async fn silent_check(
        &self,
        sid: Option<&str>,
        max_age: Option<u64>,
        acr_values: Option<&str>,
    ) -> Result<Session, OAuthError> {
        let sid = sid.ok_or(OAuthError::LoginRequired)?;
        let session = self
            .get_session(sid)
            .await?
            .ok_or(OAuthError::LoginRequired)?;

        let now = Utc::now();
        if !session.satisfies_max_age(max_age, now) {
            return Err(OAuthError::LoginRequired);
        }
        if !session.satisfies_acr(acr_values) {
            return Err(OAuthError::InteractionRequired);
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SessionService {
        SessionService::new(ShardRouter::new(1, "auto", 2), "default", 86_400)
    }

    #[tokio::test]
    async fn lifecycle_create_get_revoke() {
        let svc = service();
        let session = svc
            .create_session("u1", vec!["pwd".to_string()], None, None, serde_json::Value::Null)
            .await
            .unwrap();

        let found = svc.get_session(&session.sid).await.unwrap().unwrap();
        assert_eq!(found.user_id, "u1");

        svc.revoke_session(&session.sid).await.unwrap();
        assert!(svc.get_session(&session.sid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn silent_check_enforces_acr() {
        let svc = service();
        let session = svc
            .create_session(
                "u1",
                vec!["pwd".to_string()],
                Some("urn:oxauth:acr:basic".to_string()),
                None,
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        assert!(svc
            .silent_check(Some(&session.sid), None, Some("urn:oxauth:acr:basic"))
            .await
            .is_ok());

        let err = svc
            .silent_check(Some(&session.sid), None, Some("urn:oxauth:acr:mfa"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "interaction_required");
    }

    #[tokio::test]
    async fn silent_check_without_session_requires_login() {
        let svc = service();
        let err = svc.silent_check(None, None, None).await.unwrap_err();
        assert_eq!(err.code(), "login_required");

        let err = svc.silent_check(Some("missing"), None, None).await.unwrap_err();
        assert_eq!(err.code(), "login_required");
    }
}
