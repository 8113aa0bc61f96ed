use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use super::ActorState;

/// Append-only seen-set with per-entry TTL. Backs one-shot identifiers that
/// must be accepted at most once inside a time window: DPoP `(jkt, jti)`
/// pairs and client-assertion `jti` values.
#[derive(Debug, Default)]
pub struct ReplayWindowState {
    seen: HashMap<String, DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub enum ReplayWindowOp {
    /// Record `key`; replies `true` when the key was not live in the window.
    Observe { key: String, ttl_seconds: i64 },
}

impl ActorState for ReplayWindowState {
    type Op = ReplayWindowOp;
    type Reply = bool;

    fn apply(&mut self, op: ReplayWindowOp, now: DateTime<Utc>) -> bool {
        match op {
            ReplayWindowOp::Observe { key, ttl_seconds } => match self.seen.get(&key) {
                Some(expiry) if *expiry > now => false,
                _ => {
                    self.seen.insert(key, now + Duration::seconds(ttl_seconds));
                    true
                }
            },
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, expiry| *expiry > now);
        before - self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_observation_within_window_is_stale() {
        let mut state = ReplayWindowState::default();
        let now = Utc::now();
        let op = ReplayWindowOp::Observe {
            key: "jkt:jti".to_string(),
            ttl_seconds: 120,
        };
        assert!(state.apply(op.clone(), now));
        assert!(!state.apply(op, now + Duration::seconds(60)));
    }

    #[test]
    fn observation_after_expiry_is_fresh_again() {
        let mut state = ReplayWindowState::default();
        let now = Utc::now();
        let op = ReplayWindowOp::Observe {
            key: "k".to_string(),
            ttl_seconds: 10,
        };
        assert!(state.apply(op.clone(), now));
        assert!(state.apply(op, now + Duration::seconds(11)));
    }
}
