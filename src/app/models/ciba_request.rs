use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CibaStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CibaDeliveryMode {
    Poll,
    Ping,
    Push,
}

/// Backchannel authentication request (CIBA). Poll clients exchange
/// `auth_req_id` at the token endpoint; ping clients are notified once the
/// request leaves `pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CibaRequest {
    pub auth_req_id: String,
    pub client_id: String,
    pub scope: String,
    pub login_hint: String,
    pub binding_message: Option<String>,
    pub delivery_mode: CibaDeliveryMode,
    pub client_notification_endpoint: Option<String>,
    pub client_notification_token: Option<String>,
    pub status: CibaStatus,
    pub user_id: Option<String>,
    pub token_issued: bool,
    pub notification_attempts: u32,
    pub poll_count: u32,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub interval: i64,
    pub expires_at: DateTime<Utc>,
}

impl CibaRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, CibaStatus::Expired) || self.token_issued
    }

    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(|s| s.to_string()).collect()
    }

    pub fn generate_auth_req_id() -> String {
        use rand::{distributions::Alphanumeric, Rng};
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(40)
            .map(char::from)
            .collect()
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct BackchannelAuthResponse {
    pub auth_req_id: String,
    #[schema(example = 600)]
    pub expires_in: i64,
    #[schema(example = 5)]
    pub interval: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(status: CibaStatus, token_issued: bool) -> CibaRequest {
        CibaRequest {
            auth_req_id: "req".to_string(),
            client_id: "c1".to_string(),
            scope: "openid".to_string(),
            login_hint: "user@example.com".to_string(),
            binding_message: None,
            delivery_mode: CibaDeliveryMode::Poll,
            client_notification_endpoint: None,
            client_notification_token: None,
            status,
            user_id: None,
            token_issued,
            notification_attempts: 0,
            poll_count: 0,
            last_poll_at: None,
            interval: 5,
            expires_at: Utc::now() + Duration::seconds(600),
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!request(CibaStatus::Pending, false).is_terminal());
        assert!(!request(CibaStatus::Approved, false).is_terminal());
        assert!(request(CibaStatus::Approved, true).is_terminal());
        assert!(request(CibaStatus::Expired, false).is_terminal());
    }
}
