use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceGrantStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

/// RFC 8628 device authorization artifact, indexed by both `device_code`
/// (token polling) and normalized `user_code` (verification page).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    /// Normalized form: `XXXX-XXXX`.
    pub user_code: String,
    pub client_id: String,
    pub scope: String,
    pub status: DeviceGrantStatus,
    pub user_id: Option<String>,
    pub sub: Option<String>,
    pub token_issued: bool,
    pub token_issued_at: Option<DateTime<Utc>>,
    pub poll_count: u32,
    pub last_poll_at: Option<DateTime<Utc>>,
    /// Effective minimum polling interval; doubled on `slow_down`.
    pub interval: i64,
    pub expires_at: DateTime<Utc>,
}

impl DeviceCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(|s| s.to_string()).collect()
    }

    /// 8 characters from an alphabet without 0/O/1/I, displayed `XXXX-XXXX`.
    pub fn generate_user_code() -> String {
        use rand::Rng;
        const CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
        let mut rng = rand::thread_rng();

        let raw: String = (0..8)
            .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
            .collect();
        format!("{}-{}", &raw[..4], &raw[4..])
    }

    pub fn generate_device_code() -> String {
        use rand::{distributions::Alphanumeric, Rng};
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(64)
            .map(char::from)
            .collect()
    }

    /// Case-insensitive lookup form: uppercase, non-alphanumerics stripped,
    /// re-hyphenated as `XXXX-XXXX`.
    pub fn normalize_user_code(raw: &str) -> Option<String> {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if cleaned.len() != 8 {
            return None;
        }
        Some(format!("{}-{}", &cleaned[..4], &cleaned[4..]))
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct DeviceAuthorizationResponse {
    pub device_code: String,
    #[schema(example = "WDJB-MJHT")]
    pub user_code: String,
    #[schema(example = "https://auth.example.com/device")]
    pub verification_uri: String,
    #[schema(example = "https://auth.example.com/device?user_code=WDJB-MJHT")]
    pub verification_uri_complete: String,
    #[schema(example = 1800)]
    pub expires_in: i64,
    #[schema(example = 5)]
    pub interval: i64,
}
