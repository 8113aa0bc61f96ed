use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;

use super::ActorState;

/// The baseline actor kind: a TTL'd JSON record store with compare-and-set.
/// Kind-specific actors (auth codes, device codes, …) implement their own
/// atomic transitions; everything that only needs put/get/delete/CAS runs on
/// this state.
#[derive(Debug, Default)]
pub struct KvState {
    records: HashMap<String, KvRecord>,
}

#[derive(Debug, Clone)]
struct KvRecord {
    value: Value,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum KvOp {
    Put {
        key: String,
        value: Value,
        ttl_seconds: i64,
    },
    Get {
        key: String,
    },
    /// Get and delete in one step; the caller observes the record at most once.
    Take {
        key: String,
    },
    Delete {
        key: String,
    },
    CompareAndSet {
        key: String,
        expected: Option<Value>,
        new: Value,
        ttl_seconds: i64,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum KvReply {
    Stored,
    Found(Value),
    NotFound,
    Deleted,
    CasApplied,
    CasConflict,
}

impl KvState {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str, now: DateTime<Utc>) -> Option<&KvRecord> {
        self.records.get(key).filter(|r| r.expires_at > now)
    }
}

impl ActorState for KvState {
    type Op = KvOp;
    type Reply = KvReply;

    fn apply(&mut self, op: KvOp, now: DateTime<Utc>) -> KvReply {
        match op {
            KvOp::Put {
                key,
                value,
                ttl_seconds,
            } => {
                self.records.insert(
                    key,
                    KvRecord {
                        value,
                        expires_at: now + Duration::seconds(ttl_seconds),
                    },
                );
                KvReply::Stored
            }
            KvOp::Get { key } => match self.live(&key, now) {
                Some(record) => KvReply::Found(record.value.clone()),
                None => KvReply::NotFound,
            },
            KvOp::Take { key } => {
                let live = self.live(&key, now).cloned();
                match live {
                    Some(record) => {
                        self.records.remove(&key);
                        KvReply::Found(record.value)
                    }
                    None => KvReply::NotFound,
                }
            }
            KvOp::Delete { key } => {
                self.records.remove(&key);
                KvReply::Deleted
            }
            KvOp::CompareAndSet {
                key,
                expected,
                new,
                ttl_seconds,
            } => {
                let current = self.live(&key, now).map(|r| r.value.clone());
                if current == expected {
                    self.records.insert(
                        key,
                        KvRecord {
                            value: new,
                            expires_at: now + Duration::seconds(ttl_seconds),
                        },
                    );
                    KvReply::CasApplied
                } else {
                    KvReply::CasConflict
                }
            }
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.expires_at > now);
        before - self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expired_records_read_as_not_found_before_sweep() {
        let mut state = KvState::new();
        let t0 = Utc::now();
        state.apply(
            KvOp::Put {
                key: "k".into(),
                value: json!({"a": 1}),
                ttl_seconds: 10,
            },
            t0,
        );

        let at_expiry = t0 + Duration::seconds(10);
        assert_eq!(state.apply(KvOp::Get { key: "k".into() }, at_expiry), KvReply::NotFound);

        // Physical deletion may lag; the sweep reclaims it.
        assert_eq!(state.sweep(at_expiry), 1);
    }

    #[test]
    fn take_is_single_use() {
        let mut state = KvState::new();
        let now = Utc::now();
        state.apply(
            KvOp::Put {
                key: "once".into(),
                value: json!("v"),
                ttl_seconds: 60,
            },
            now,
        );

        assert_eq!(
            state.apply(KvOp::Take { key: "once".into() }, now),
            KvReply::Found(json!("v"))
        );
        assert_eq!(state.apply(KvOp::Take { key: "once".into() }, now), KvReply::NotFound);
    }

    #[test]
    fn cas_detects_conflicts() {
        let mut state = KvState::new();
        let now = Utc::now();

        assert_eq!(
            state.apply(
                KvOp::CompareAndSet {
                    key: "c".into(),
                    expected: None,
                    new: json!(1),
                    ttl_seconds: 60,
                },
                now,
            ),
            KvReply::CasApplied
        );

        assert_eq!(
            state.apply(
                KvOp::CompareAndSet {
                    key: "c".into(),
                    expected: Some(json!(2)),
                    new: json!(3),
                    ttl_seconds: 60,
                },
                now,
            ),
            KvReply::CasConflict
        );
    }
}
