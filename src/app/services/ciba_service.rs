use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration as StdDuration;

use crate::actor::{spawn, ActorHandle, ActorState};
use crate::app::error::OAuthError;
use crate::app::models::ciba_request::{
    BackchannelAuthResponse, CibaDeliveryMode, CibaRequest, CibaStatus,
};

/// Pending backchannel requests one client may hold at a time.
const PER_CLIENT_PENDING_CAP: usize = 100;

#[derive(Debug, Default)]
pub struct CibaState {
    requests: HashMap<String, CibaRequest>,
}

#[derive(Clone, Debug)]
pub enum CibaOp {
    Store {
        request: Box<CibaRequest>,
    },
    Get {
        auth_req_id: String,
    },
    Complete {
        auth_req_id: String,
        user_id: String,
        approved: bool,
    },
    Poll {
        auth_req_id: String,
        client_id: String,
    },
    RecordNotificationAttempt {
        auth_req_id: String,
    },
}

#[derive(Debug)]
pub enum CibaReply {
    Stored,
    TooManyPending,
    Found(Box<CibaRequest>),
    NotFound,
    Expired,
    /// Settled by this call; carries the updated request for delivery.
    Settled(Box<CibaRequest>),
    AlreadySettled,
    Pending,
    SlowDown,
    Ready(Box<CibaRequest>),
    AccessDenied,
    TokenAlreadyIssued,
    ClientMismatch,
    /// Notification bookkeeping: `false` when the request is terminal and
    /// must not be re-notified.
    NotifyAllowed(u32),
    NotifyRefused,
}

impl CibaState {
    fn expire_if_due(request: &mut CibaRequest, now: DateTime<Utc>) {
        if request.status == CibaStatus::Pending && request.is_expired(now) {
            request.status = CibaStatus::Expired;
        }
    }
}

impl ActorState for CibaState {
    type Op = CibaOp;
    type Reply = CibaReply;

    fn apply(&mut self, op: CibaOp, now: DateTime<Utc>) -> CibaReply {
        match op {
            CibaOp::Store { request } => {
                let pending = self
                    .requests
                    .values()
                    .filter(|r| {
                        r.client_id == request.client_id
                            && r.status == CibaStatus::Pending
                            && !r.is_expired(now)
                    })
                    .count();
                if pending >= PER_CLIENT_PENDING_CAP {
                    return CibaReply::TooManyPending;
                }
                self.requests.insert(request.auth_req_id.clone(), *request);
                CibaReply::Stored
            }
            CibaOp::Get { auth_req_id } => match self.requests.get_mut(&auth_req_id) {
                Some(request) => {
                    Self::expire_if_due(request, now);
                    CibaReply::Found(Box::new(request.clone()))
                }
                None => CibaReply::NotFound,
            },
            CibaOp::Complete {
                auth_req_id,
                user_id,
                approved,
            } => {
                let request = match self.requests.get_mut(&auth_req_id) {
                    Some(r) => r,
                    None => return CibaReply::NotFound,
                };
                Self::expire_if_due(request, now);
                match request.status {
                    CibaStatus::Pending => {
                        request.status = if approved {
                            CibaStatus::Approved
                        } else {
                            CibaStatus::Denied
                        };
                        request.user_id = Some(user_id);
                        CibaReply::Settled(Box::new(request.clone()))
                    }
                    CibaStatus::Expired => CibaReply::Expired,
                    _ => CibaReply::AlreadySettled,
                }
            }
            CibaOp::Poll {
                auth_req_id,
                client_id,
            } => {
                let request = match self.requests.get_mut(&auth_req_id) {
                    Some(r) => r,
                    None => return CibaReply::NotFound,
                };
                if request.client_id != client_id {
                    return CibaReply::ClientMismatch;
                }
                Self::expire_if_due(request, now);

                if let Some(last) = request.last_poll_at {
                    if now - last < Duration::seconds(request.interval) {
                        request.interval = (request.interval * 2).min(3600);
                        request.last_poll_at = Some(now);
                        return CibaReply::SlowDown;
                    }
                }
                request.last_poll_at = Some(now);
                request.poll_count += 1;

                match request.status {
                    CibaStatus::Pending => CibaReply::Pending,
                    CibaStatus::Denied => CibaReply::AccessDenied,
                    CibaStatus::Expired => CibaReply::Expired,
                    CibaStatus::Approved => {
                        if request.token_issued {
                            return CibaReply::TokenAlreadyIssued;
                        }
                        request.token_issued = true;
                        CibaReply::Ready(Box::new(request.clone()))
                    }
                }
            }
            CibaOp::RecordNotificationAttempt { auth_req_id } => {
                let request = match self.requests.get_mut(&auth_req_id) {
                    Some(r) => r,
                    None => return CibaReply::NotifyRefused,
                };
                Self::expire_if_due(request, now);
                if request.is_terminal() {
                    return CibaReply::NotifyRefused;
                }
                request.notification_attempts += 1;
                CibaReply::NotifyAllowed(request.notification_attempts)
            }
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.requests.len();
        self.requests
            .retain(|_, r| now - r.expires_at < Duration::seconds(300));
        before - self.requests.len()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackchannelAuthParams {
    pub scope: Option<String>,
    pub login_hint: Option<String>,
    pub login_hint_token: Option<String>,
    pub id_token_hint: Option<String>,
    pub binding_message: Option<String>,
    pub client_notification_token: Option<String>,
    pub requested_expiry: Option<i64>,
}

#[derive(Clone)]
pub struct CibaService {
    actor: ActorHandle<CibaState>,
    http: reqwest::Client,
    request_ttl: i64,
    poll_interval: i64,
    retry_delay: StdDuration,
    max_notification_attempts: u32,
    allow_insecure_endpoints: bool,
}

impl CibaService {
    pub fn new(
        tenant: &str,
        request_ttl: i64,
        poll_interval: i64,
        retry_delay: StdDuration,
        max_notification_attempts: u32,
        allow_insecure_endpoints: bool,
    ) -> Self {
        Self {
            actor: spawn(
                format!("g1:auto:0:ciba-{tenant}"),
                CibaState::default(),
                StdDuration::from_secs(60),
            ),
            http: reqwest::Client::new(),
            request_ttl,
            poll_interval,
            retry_delay,
            max_notification_attempts,
            allow_insecure_endpoints,
        }
    }

    /// Initiate a backchannel authentication request.
    pub async fn initiate(
        &self,
        client_id: &str,
        delivery_mode: CibaDeliveryMode,
        client_notification_endpoint: Option<String>,
        params: BackchannelAuthParams,
    ) -> Result<BackchannelAuthResponse, OAuthError> {
        let login_hint = params
            .login_hint
            .clone()
            .or(params.login_hint_token.clone())
            .ok_or_else(|| OAuthError::InvalidRequest("login_hint is required".to_string()))?;
        Self::resolve_login_hint(&login_hint)?;

        if let Some(message) = &params.binding_message {
            if message.len() > 140 {
                return Err(OAuthError::InvalidRequest("binding_message too long".to_string()));
            }
        }

        if matches!(delivery_mode, CibaDeliveryMode::Ping | CibaDeliveryMode::Push) {
            let endpoint = client_notification_endpoint.as_deref().ok_or_else(|| {
                OAuthError::InvalidRequest(
                    "client_notification_endpoint is required for ping/push".to_string(),
                )
            })?;
            self.validate_notification_endpoint(endpoint)?;
            if params.client_notification_token.is_none() {
                return Err(OAuthError::InvalidRequest(
                    "client_notification_token is required for ping/push".to_string(),
                ));
            }
        }

        let expires_in = params
            .requested_expiry
            .unwrap_or(self.request_ttl)
            .clamp(30, self.request_ttl.max(30));

        let request = CibaRequest {
            auth_req_id: CibaRequest::generate_auth_req_id(),
            client_id: client_id.to_string(),
            scope: params.scope.clone().unwrap_or_else(|| "openid".to_string()),
            login_hint,
            binding_message: params.binding_message.clone(),
            delivery_mode,
            client_notification_endpoint,
            client_notification_token: params.client_notification_token.clone(),
            status: CibaStatus::Pending,
            user_id: None,
            token_issued: false,
            notification_attempts: 0,
            poll_count: 0,
            last_poll_at: None,
            interval: self.poll_interval,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        };

        let response = BackchannelAuthResponse {
            auth_req_id: request.auth_req_id.clone(),
            expires_in,
            interval: self.poll_interval,
        };

        let reply = self
            .actor
            .call_once(CibaOp::Store {
                request: Box::new(request),
            })
            .await?;
        if matches!(reply, CibaReply::TooManyPending) {
            return Err(OAuthError::InvalidRequest(
                "too many pending backchannel requests for this client".to_string(),
            ));
        }
        tracing::info!(client_id, auth_req_id = %response.auth_req_id, "backchannel auth request created");
        Ok(response)
    }

    /// Settle the request from the authentication device. Ping clients are
    /// notified asynchronously; re-settling an already settled request is a
    /// no-op and does not re-notify.
    pub async fn complete(
        &self,
        auth_req_id: &str,
        user_id: &str,
        approved: bool,
    ) -> Result<bool, OAuthError> {
        let reply = self
            .actor
            .call(CibaOp::Complete {
                auth_req_id: auth_req_id.to_string(),
                user_id: user_id.to_string(),
                approved,
            })
            .await?;

        match reply {
            CibaReply::Settled(request) => {
                if request.delivery_mode == CibaDeliveryMode::Ping {
                    self.spawn_notifier(*request);
                }
                Ok(true)
            }
            CibaReply::AlreadySettled => Ok(false),
            CibaReply::Expired => Err(OAuthError::ExpiredToken),
            CibaReply::NotFound => {
                Err(OAuthError::InvalidRequest("unknown auth_req_id".to_string()))
            }
            _ => Err(OAuthError::ServerError(anyhow::anyhow!("unexpected complete reply"))),
        }
    }

    pub async fn status(&self, auth_req_id: &str) -> Result<CibaRequest, OAuthError> {
        match self
            .actor
            .call(CibaOp::Get {
                auth_req_id: auth_req_id.to_string(),
            })
            .await?
        {
            CibaReply::Found(request) => Ok(*request),
            _ => Err(OAuthError::InvalidRequest("unknown auth_req_id".to_string())),
        }
    }

    /// Token-endpoint poll; `Ok` is produced exactly once per request.
    pub async fn poll(&self, auth_req_id: &str, client_id: &str) -> Result<CibaRequest, OAuthError> {
        let reply = self
            .actor
            .call(CibaOp::Poll {
                auth_req_id: auth_req_id.to_string(),
                client_id: client_id.to_string(),
            })
            .await?;

        match reply {
            CibaReply::Ready(request) => Ok(*request),
            CibaReply::Pending => Err(OAuthError::AuthorizationPending),
            CibaReply::SlowDown => Err(OAuthError::SlowDown),
            CibaReply::AccessDenied => Err(OAuthError::AccessDenied),
            CibaReply::Expired => Err(OAuthError::ExpiredToken),
            CibaReply::TokenAlreadyIssued => Err(OAuthError::InvalidGrant(
                "auth_req_id has already been redeemed".to_string(),
            )),
            CibaReply::ClientMismatch => Err(OAuthError::InvalidGrant(
                "auth_req_id belongs to another client".to_string(),
            )),
            CibaReply::NotFound => Err(OAuthError::InvalidGrant("unknown auth_req_id".to_string())),
            _ => Err(OAuthError::ServerError(anyhow::anyhow!("unexpected poll reply"))),
        }
    }

    fn spawn_notifier(&self, request: CibaRequest) {
        let actor = self.actor.clone();
        let http = self.http.clone();
        let base_delay = self.retry_delay;
        let max_attempts = self.max_notification_attempts;

        tokio::spawn(async move {
            let endpoint = match &request.client_notification_endpoint {
                Some(endpoint) => endpoint.clone(),
                None => return,
            };
            let bearer = request.client_notification_token.clone().unwrap_or_default();
            let body = serde_json::json!({ "auth_req_id": request.auth_req_id });

            let mut delay = base_delay;
            for _attempt in 1..=max_attempts {
                // Terminal requests are never (re-)notified.
                match actor
                    .call(CibaOp::RecordNotificationAttempt {
                        auth_req_id: request.auth_req_id.clone(),
                    })
                    .await
                {
                    Ok(CibaReply::NotifyAllowed(n)) => {
                        tracing::debug!(auth_req_id = %request.auth_req_id, attempt = n, "delivering ping notification");
                    }
                    _ => return,
                }

                let outcome = http
                    .post(&endpoint)
                    .bearer_auth(&bearer)
                    .json(&body)
                    .timeout(StdDuration::from_secs(5))
                    .send()
                    .await;

                match outcome {
                    Ok(response) if response.status().is_success() => {
                        tracing::info!(auth_req_id = %request.auth_req_id, "ping notification delivered");
                        return;
                    }
                    Ok(response) if response.status().is_server_error() => {
                        tracing::warn!(auth_req_id = %request.auth_req_id, status = %response.status(), "transient notification failure");
                    }
                    Ok(response) => {
                        // 4xx from the client endpoint is not retryable.
                        tracing::warn!(auth_req_id = %request.auth_req_id, status = %response.status(), "notification rejected");
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(auth_req_id = %request.auth_req_id, error = %err, "notification attempt failed");
                    }
                }

                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            tracing::error!(auth_req_id = %request.auth_req_id, "notification retries exhausted");
        });
    }

    fn validate_notification_endpoint(&self, endpoint: &str) -> Result<(), OAuthError> {
        if endpoint.starts_with("https://") {
            return Ok(());
        }
        if self.allow_insecure_endpoints
            && (endpoint.starts_with("http://localhost") || endpoint.starts_with("http://127.0.0.1"))
        {
            return Ok(());
        }
        Err(OAuthError::InvalidRequest(
            "client_notification_endpoint must use https".to_string(),
        ))
    }

    /// `login_hint` forms accepted: `sub:<id>`, `email:<addr>`, or a bare
    /// email address. Resolution to a user id is a stub for the external
    /// directory.
    pub fn resolve_login_hint(hint: &str) -> Result<String, OAuthError> {
        if let Some(sub) = hint.strip_prefix("sub:") {
            if !sub.is_empty() {
                return Ok(sub.to_string());
            }
        } else if let Some(email) = hint.strip_prefix("email:") {
            if email.contains('@') {
                return Ok(email.to_string());
            }
        } else if hint.contains('@') {
            return Ok(hint.to_string());
        }
        Err(OAuthError::InvalidRequest("login_hint is not parseable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn service() -> CibaService {
        CibaService::new("default", 600, 0, StdDuration::from_millis(20), 3, true)
    }

    fn ping_params() -> BackchannelAuthParams {
        BackchannelAuthParams {
            scope: Some("openid".to_string()),
            login_hint: Some("sub:u1".to_string()),
            client_notification_token: Some("notify-token".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn poll_mode_lifecycle() {
        let svc = service();
        let response = svc
            .initiate(
                "c1",
                CibaDeliveryMode::Poll,
                None,
                BackchannelAuthParams {
                    scope: Some("openid".to_string()),
                    login_hint: Some("user@example.com".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = svc.poll(&response.auth_req_id, "c1").await.unwrap_err();
        assert_eq!(err.code(), "authorization_pending");

        assert!(svc.complete(&response.auth_req_id, "u1", true).await.unwrap());

        let request = svc.poll(&response.auth_req_id, "c1").await.unwrap();
        assert_eq!(request.user_id.as_deref(), Some("u1"));

        let err = svc.poll(&response.auth_req_id, "c1").await.unwrap_err();
        assert_eq!(err.code(), "invalid_grant");
    }

    #[tokio::test]
    async fn denial_reports_access_denied() {
        let svc = service();
        let response = svc
            .initiate(
                "c1",
                CibaDeliveryMode::Poll,
                None,
                BackchannelAuthParams {
                    login_hint: Some("sub:u1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        svc.complete(&response.auth_req_id, "u1", false).await.unwrap();
        let err = svc.poll(&response.auth_req_id, "c1").await.unwrap_err();
        assert_eq!(err.code(), "access_denied");
    }

    #[tokio::test]
    async fn ping_notification_retries_until_success() {
        let hits = Arc::new(AtomicU32::new(0));
        let handler_hits = hits.clone();

        let app = Router::new().route(
            "/notify",
            post(move || {
                let hits = handler_hits.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        axum::http::StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        axum::http::StatusCode::NO_CONTENT
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let svc = service();
        let response = svc
            .initiate(
                "c1",
                CibaDeliveryMode::Ping,
                Some(format!("http://127.0.0.1:{}/notify", addr.port())),
                ping_params(),
            )
            .await
            .unwrap();

        assert!(svc.complete(&response.auth_req_id, "u1", true).await.unwrap());

        // Two 503s then a 204: the notifier should stop after the third call.
        tokio::time::timeout(StdDuration::from_secs(5), async {
            while hits.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(StdDuration::from_millis(10)).await;
            }
        })
        .await
        .expect("notification never succeeded");

        // Re-settling is a no-op: no new notifier, no extra hits.
        assert!(!svc.complete(&response.auth_req_id, "u2", true).await.unwrap());
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn notification_attempts_are_capped() {
        let hits = Arc::new(AtomicU32::new(0));
        let handler_hits = hits.clone();

        let app = Router::new().route(
            "/notify",
            post(move || {
                let hits = handler_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    axum::http::StatusCode::SERVICE_UNAVAILABLE
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let svc = service();
        let response = svc
            .initiate(
                "c1",
                CibaDeliveryMode::Ping,
                Some(format!("http://127.0.0.1:{}/notify", addr.port())),
                ping_params(),
            )
            .await
            .unwrap();
        svc.complete(&response.auth_req_id, "u1", true).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn ping_mode_requires_endpoint_and_token() {
        let svc = service();
        let err = svc
            .initiate("c1", CibaDeliveryMode::Ping, None, ping_params())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");

        let mut params = ping_params();
        params.client_notification_token = None;
        let err = svc
            .initiate(
                "c1",
                CibaDeliveryMode::Ping,
                Some("https://rp.example.com/notify".to_string()),
                params,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn login_hints_parse() {
        assert_eq!(CibaService::resolve_login_hint("sub:u1").unwrap(), "u1");
        assert_eq!(
            CibaService::resolve_login_hint("email:a@b.test").unwrap(),
            "a@b.test"
        );
        assert_eq!(CibaService::resolve_login_hint("a@b.test").unwrap(), "a@b.test");
        assert!(CibaService::resolve_login_hint("garbage").is_err());
    }
}
