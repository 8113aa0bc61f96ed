use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::actor::{spawn, ActorHandle, ActorState};
use crate::app::error::OAuthError;
use crate::app::models::device_code::{DeviceAuthorizationResponse, DeviceCode, DeviceGrantStatus};
use crate::config::ConfigResolver;

/// Per-tenant device grant store with secondary index by user code. All
/// transitions for a tenant run on one actor, so concurrent approvals of the
/// same user code are linearized: the first wins, the rest observe the new
/// status.
#[derive(Debug, Default)]
pub struct DeviceState {
    by_device_code: HashMap<String, DeviceCode>,
    by_user_code: HashMap<String, String>,
}

#[derive(Clone, Debug)]
pub enum DeviceOp {
    Store {
        artifact: Box<DeviceCode>,
    },
    FindByUserCode {
        user_code: String,
    },
    Approve {
        user_code: String,
        user_id: String,
        sub: String,
    },
    Deny {
        user_code: String,
        user_id: String,
    },
    Poll {
        device_code: String,
        client_id: String,
    },
}

#[derive(Debug)]
pub enum DeviceReply {
    Stored,
    Found(Box<DeviceCode>),
    NotFound,
    Expired,
    Approved,
    Denied,
    AlreadyApproved,
    AlreadyDenied,
    /// Poll outcomes.
    Pending,
    SlowDown,
    Ready(Box<DeviceCode>),
    AccessDenied,
    TokenAlreadyIssued,
    ClientMismatch,
}

impl DeviceState {
    fn lookup_user_code(&mut self, user_code: &str, now: DateTime<Utc>) -> Option<&mut DeviceCode> {
        let device_code = self.by_user_code.get(user_code)?.clone();
        let artifact = self.by_device_code.get_mut(&device_code)?;
        if artifact.is_expired(now) && artifact.status == DeviceGrantStatus::Pending {
            artifact.status = DeviceGrantStatus::Expired;
        }
        Some(artifact)
    }
}

impl ActorState for DeviceState {
    type Op = DeviceOp;
    type Reply = DeviceReply;

    fn apply(&mut self, op: DeviceOp, now: DateTime<Utc>) -> DeviceReply {
        match op {
            DeviceOp::Store { artifact } => {
                self.by_user_code
                    .insert(artifact.user_code.clone(), artifact.device_code.clone());
                self.by_device_code
                    .insert(artifact.device_code.clone(), *artifact);
                DeviceReply::Stored
            }
            DeviceOp::FindByUserCode { user_code } => match self.lookup_user_code(&user_code, now) {
                Some(artifact) if artifact.status != DeviceGrantStatus::Expired => {
                    DeviceReply::Found(Box::new(artifact.clone()))
                }
                Some(_) => DeviceReply::Expired,
                None => DeviceReply::NotFound,
            },
            DeviceOp::Approve {
                user_code,
                user_id,
                sub,
            } => match self.lookup_user_code(&user_code, now) {
                Some(artifact) => match artifact.status {
                    DeviceGrantStatus::Pending => {
                        artifact.status = DeviceGrantStatus::Approved;
                        artifact.user_id = Some(user_id);
                        artifact.sub = Some(sub);
                        DeviceReply::Approved
                    }
                    DeviceGrantStatus::Approved => DeviceReply::AlreadyApproved,
                    DeviceGrantStatus::Denied => DeviceReply::AlreadyDenied,
                    DeviceGrantStatus::Expired => DeviceReply::Expired,
                },
                None => DeviceReply::NotFound,
            },
            DeviceOp::Deny { user_code, user_id } => match self.lookup_user_code(&user_code, now) {
                Some(artifact) => match artifact.status {
                    DeviceGrantStatus::Pending => {
                        artifact.status = DeviceGrantStatus::Denied;
                        artifact.user_id = Some(user_id);
                        DeviceReply::Denied
                    }
                    DeviceGrantStatus::Approved => DeviceReply::AlreadyApproved,
                    DeviceGrantStatus::Denied => DeviceReply::AlreadyDenied,
                    DeviceGrantStatus::Expired => DeviceReply::Expired,
                },
                None => DeviceReply::NotFound,
            },
            DeviceOp::Poll {
                device_code,
                client_id,
            } => {
                let artifact = match self.by_device_code.get_mut(&device_code) {
                    Some(a) => a,
                    None => return DeviceReply::NotFound,
                };
                if artifact.client_id != client_id {
                    return DeviceReply::ClientMismatch;
                }
                if artifact.is_expired(now) {
                    artifact.status = DeviceGrantStatus::Expired;
                    return DeviceReply::Expired;
                }

                // Pacing before state: a too-fast poll doubles the effective
                // interval and reports slow_down regardless of status.
                if let Some(last) = artifact.last_poll_at {
                    if now - last < Duration::seconds(artifact.interval) {
                        artifact.interval = (artifact.interval * 2).min(3600);
                        artifact.last_poll_at = Some(now);
                        return DeviceReply::SlowDown;
                    }
                }
                artifact.last_poll_at = Some(now);
                artifact.poll_count += 1;

                match artifact.status {
                    DeviceGrantStatus::Pending => DeviceReply::Pending,
                    DeviceGrantStatus::Denied => DeviceReply::AccessDenied,
                    DeviceGrantStatus::Expired => DeviceReply::Expired,
                    DeviceGrantStatus::Approved => {
                        if artifact.token_issued {
                            return DeviceReply::TokenAlreadyIssued;
                        }
                        artifact.token_issued = true;
                        artifact.token_issued_at = Some(now);
                        DeviceReply::Ready(Box::new(artifact.clone()))
                    }
                }
            }
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let gone: Vec<String> = self
            .by_device_code
            .iter()
            .filter(|(_, a)| now - a.expires_at > Duration::seconds(300))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &gone {
            if let Some(artifact) = self.by_device_code.remove(key) {
                self.by_user_code.remove(&artifact.user_code);
            }
        }
        gone.len()
    }
}

#[derive(Clone)]
pub struct DeviceService {
    actor: ActorHandle<DeviceState>,
    resolver: ConfigResolver,
    issuer: String,
}

impl DeviceService {
    pub fn new(resolver: ConfigResolver, tenant: &str, issuer: &str) -> Self {
        Self {
            actor: spawn(
                format!("g1:auto:0:device-{tenant}"),
                DeviceState::default(),
                std::time::Duration::from_secs(60),
            ),
            resolver,
            issuer: issuer.to_string(),
        }
    }

    pub async fn initiate(
        &self,
        client_id: &str,
        scope: &str,
    ) -> Result<DeviceAuthorizationResponse, OAuthError> {
        let ttl = self.resolver.boot().oauth.device_code_ttl;
        let interval = self.resolver.device_poll_interval().await;
        let artifact = DeviceCode {
            device_code: DeviceCode::generate_device_code(),
            user_code: DeviceCode::generate_user_code(),
            client_id: client_id.to_string(),
            scope: scope.to_string(),
            status: DeviceGrantStatus::Pending,
            user_id: None,
            sub: None,
            token_issued: false,
            token_issued_at: None,
            poll_count: 0,
            last_poll_at: None,
            interval,
            expires_at: Utc::now() + Duration::seconds(ttl),
        };

        let response = DeviceAuthorizationResponse {
            device_code: artifact.device_code.clone(),
            user_code: artifact.user_code.clone(),
            verification_uri: format!("{}/device", self.issuer),
            verification_uri_complete: format!(
                "{}/device?user_code={}",
                self.issuer,
                urlencoding::encode(&artifact.user_code)
            ),
            expires_in: ttl,
            interval,
        };

        self.actor
            .call_once(DeviceOp::Store {
                artifact: Box::new(artifact),
            })
            .await?;
        Ok(response)
    }

    pub async fn find_by_user_code(&self, raw_user_code: &str) -> Result<DeviceCode, OAuthError> {
        let user_code = DeviceCode::normalize_user_code(raw_user_code)
            .ok_or_else(|| OAuthError::InvalidRequest("malformed user_code".to_string()))?;
        match self.actor.call(DeviceOp::FindByUserCode { user_code }).await? {
            DeviceReply::Found(artifact) => Ok(*artifact),
            DeviceReply::Expired => Err(OAuthError::ExpiredToken),
            _ => Err(OAuthError::InvalidRequest("unknown user_code".to_string())),
        }
    }

    /// First approval wins; later attempts report the settled outcome.
    /// Unknown and expired codes are errors so callers can count them toward
    /// the brute-force budget.
    pub async fn approve(
        &self,
        raw_user_code: &str,
        user_id: &str,
        sub: &str,
    ) -> Result<DeviceReply, OAuthError> {
        let user_code = DeviceCode::normalize_user_code(raw_user_code)
            .ok_or_else(|| OAuthError::InvalidRequest("malformed user_code".to_string()))?;
        let reply = self
            .actor
            .call(DeviceOp::Approve {
                user_code,
                user_id: user_id.to_string(),
                sub: sub.to_string(),
            })
            .await?;
        Self::settled(reply)
    }

    pub async fn deny(&self, raw_user_code: &str, user_id: &str) -> Result<DeviceReply, OAuthError> {
        let user_code = DeviceCode::normalize_user_code(raw_user_code)
            .ok_or_else(|| OAuthError::InvalidRequest("malformed user_code".to_string()))?;
        let reply = self
            .actor
            .call(DeviceOp::Deny {
                user_code,
                user_id: user_id.to_string(),
            })
            .await?;
        Self::settled(reply)
    }

    fn settled(reply: DeviceReply) -> Result<DeviceReply, OAuthError> {
        match reply {
            DeviceReply::NotFound => {
                Err(OAuthError::InvalidRequest("unknown user_code".to_string()))
            }
            DeviceReply::Expired => Err(OAuthError::ExpiredToken),
            other => Ok(other),
        }
    }

    /// Token-endpoint poll. `Ready` is returned exactly once per artifact;
    /// the `token_issued` flip happens inside the actor.
    pub async fn poll(&self, device_code: &str, client_id: &str) -> Result<DeviceCode, OAuthError> {
        let reply = self
            .actor
            .call(DeviceOp::Poll {
                device_code: device_code.to_string(),
                client_id: client_id.to_string(),
            })
            .await?;

        match reply {
            DeviceReply::Ready(artifact) => Ok(*artifact),
            DeviceReply::Pending => Err(OAuthError::AuthorizationPending),
            DeviceReply::SlowDown => Err(OAuthError::SlowDown),
            DeviceReply::AccessDenied => Err(OAuthError::AccessDenied),
            DeviceReply::Expired => Err(OAuthError::ExpiredToken),
            DeviceReply::TokenAlreadyIssued => Err(OAuthError::InvalidGrant(
                "device_code has already been redeemed".to_string(),
            )),
            DeviceReply::ClientMismatch => Err(OAuthError::InvalidGrant(
                "device_code was issued to another client".to_string(),
            )),
            DeviceReply::NotFound => {
                Err(OAuthError::InvalidGrant("unknown device_code".to_string()))
            }
            _ => Err(OAuthError::ServerError(anyhow::anyhow!("unexpected poll reply"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn service() -> DeviceService {
        let resolver = ConfigResolver::new(Config::from_env().unwrap());
        DeviceService::new(resolver, "default", "https://auth.test")
    }

    #[tokio::test]
    async fn concurrent_approvals_are_arbitrated() {
        let svc = service();
        let response = svc.initiate("tv-app", "openid").await.unwrap();
        let user_code = response.user_code.clone();

        let mut tasks = Vec::new();
        for i in 0..5 {
            let svc = svc.clone();
            let code = user_code.clone();
            tasks.push(tokio::spawn(async move {
                svc.approve(&code, &format!("user-{i}"), &format!("sub-{i}")).await
            }));
        }

        let mut wins = 0;
        let mut already = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                DeviceReply::Approved => wins += 1,
                DeviceReply::AlreadyApproved => already += 1,
                other => panic!("unexpected reply {:?}", other),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(already, 4);
    }

    /// Service with pacing disabled so tests can poll back to back.
    async fn unpaced_service() -> DeviceService {
        let resolver = ConfigResolver::new(Config::from_env().unwrap());
        resolver
            .set("oauth.device_poll_interval", serde_json::json!(0))
            .await
            .unwrap();
        DeviceService::new(resolver, "default", "https://auth.test")
    }

    #[tokio::test]
    async fn fast_repolling_trips_slow_down() {
        let svc = service();
        let response = svc.initiate("tv-app", "openid").await.unwrap();

        let err = svc.poll(&response.device_code, "tv-app").await.unwrap_err();
        assert_eq!(err.code(), "authorization_pending");

        // Immediate re-poll is inside the interval.
        let err = svc.poll(&response.device_code, "tv-app").await.unwrap_err();
        assert_eq!(err.code(), "slow_down");
    }

    #[tokio::test]
    async fn poll_lifecycle_until_single_issuance() {
        let svc = unpaced_service().await;
        let response = svc.initiate("tv-app", "openid").await.unwrap();

        let err = svc.poll(&response.device_code, "tv-app").await.unwrap_err();
        assert_eq!(err.code(), "authorization_pending");

        svc.approve(&response.user_code, "u1", "sub-1").await.unwrap();

        let artifact = svc.poll(&response.device_code, "tv-app").await.unwrap();
        assert_eq!(artifact.user_id.as_deref(), Some("u1"));
        assert!(artifact.token_issued);

        let err = svc.poll(&response.device_code, "tv-app").await.unwrap_err();
        assert_eq!(err.code(), "invalid_grant");
    }

    #[tokio::test]
    async fn denial_is_terminal() {
        let svc = unpaced_service().await;
        let response = svc.initiate("tv-app", "openid").await.unwrap();
        svc.deny(&response.user_code, "u1").await.unwrap();

        let err = svc.poll(&response.device_code, "tv-app").await.unwrap_err();
        assert_eq!(err.code(), "access_denied");

        // Approval after denial reports the settled outcome.
        let reply = svc.approve(&response.user_code, "u2", "sub-2").await.unwrap();
        assert!(matches!(reply, DeviceReply::AlreadyDenied));
    }

    #[tokio::test]
    async fn user_code_lookup_accepts_unnormalized_input() {
        let svc = service();
        let response = svc.initiate("tv-app", "openid").await.unwrap();
        let lowercased = response.user_code.to_lowercase().replace('-', "");
        let artifact = svc.find_by_user_code(&lowercased).await.unwrap();
        assert_eq!(artifact.device_code, response.device_code);
    }

    #[tokio::test]
    async fn wrong_client_cannot_poll() {
        let svc = service();
        let response = svc.initiate("tv-app", "openid").await.unwrap();
        let err = svc.poll(&response.device_code, "other").await.unwrap_err();
        assert_eq!(err.code(), "invalid_grant");
    }
}
