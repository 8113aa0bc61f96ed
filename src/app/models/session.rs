use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authenticated end-user session. Multiple clients may share one session;
/// `sid` lands in id_tokens for session management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub sid: String,
    pub user_id: String,
    pub amr: Vec<String>,
    pub acr: Option<String>,
    pub auth_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// `prompt=none` freshness check: `auth_time` must fall within `max_age`.
    pub fn satisfies_max_age(&self, max_age: Option<u64>, now: DateTime<Utc>) -> bool {
        match max_age {
            Some(max) => (now - self.auth_time).num_seconds() <= max as i64,
            None => true,
        }
    }

    /// Any of the requested ACR values matches this session's.
    pub fn satisfies_acr(&self, acr_values: Option<&str>) -> bool {
        match acr_values {
            None => true,
            Some(requested) => match &self.acr {
                Some(acr) => requested.split_whitespace().any(|v| v == acr),
                None => false,
            },
        }
    }

    pub fn generate_sid() -> String {
        use rand::{distributions::Alphanumeric, Rng};
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(acr: Option<&str>, age_seconds: i64) -> Session {
        let now = Utc::now();
        Session {
            sid: "s1".to_string(),
            user_id: "u1".to_string(),
            amr: vec!["pwd".to_string()],
            acr: acr.map(|s| s.to_string()),
            auth_time: now - Duration::seconds(age_seconds),
            expires_at: now + Duration::hours(24),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn max_age_freshness() {
        let s = session(None, 120);
        assert!(s.satisfies_max_age(None, Utc::now()));
        assert!(s.satisfies_max_age(Some(300), Utc::now()));
        assert!(!s.satisfies_max_age(Some(60), Utc::now()));
    }

    #[test]
    fn acr_matching() {
        let s = session(Some("urn:oxauth:acr:mfa"), 0);
        assert!(s.satisfies_acr(None));
        assert!(s.satisfies_acr(Some("urn:oxauth:acr:basic urn:oxauth:acr:mfa")));
        assert!(!s.satisfies_acr(Some("urn:oxauth:acr:hwk")));

        let bare = session(None, 0);
        assert!(!bare.satisfies_acr(Some("urn:oxauth:acr:basic")));
    }
}
