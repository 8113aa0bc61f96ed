use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::actor::{ActorState, ShardRouter, ShardedStore};
use crate::config::rate_limit::EndpointClass;
use crate::config::ConfigResolver;

/// Outcome of a fixed-window check, carried into the response headers.
#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds at which the current window closes.
    pub reset: i64,
    pub retry_after: i64,
}

#[derive(Debug, Default)]
pub struct CounterState {
    windows: HashMap<String, Window>,
}

#[derive(Debug)]
struct Window {
    count: u32,
    started_at: DateTime<Utc>,
    length: i64,
}

#[derive(Clone, Debug)]
pub enum CounterOp {
    Hit {
        key: String,
        limit: u32,
        window_seconds: i64,
    },
}

impl ActorState for CounterState {
    type Op = CounterOp;
    type Reply = RateDecision;

    fn apply(&mut self, op: CounterOp, now: DateTime<Utc>) -> RateDecision {
        match op {
            CounterOp::Hit {
                key,
                limit,
                window_seconds,
            } => {
                let window = self.windows.entry(key).or_insert(Window {
                    count: 0,
                    started_at: now,
                    length: window_seconds,
                });
                if now - window.started_at >= Duration::seconds(window.length) {
                    window.count = 0;
                    window.started_at = now;
                    window.length = window_seconds;
                }

                let reset = (window.started_at + Duration::seconds(window.length)).timestamp();
                if window.count >= limit {
                    RateDecision {
                        allowed: false,
                        limit,
                        remaining: 0,
                        reset,
                        retry_after: (reset - now.timestamp()).max(1),
                    }
                } else {
                    window.count += 1;
                    RateDecision {
                        allowed: true,
                        limit,
                        remaining: limit - window.count,
                        reset,
                        retry_after: 0,
                    }
                }
            }
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now - w.started_at < Duration::seconds(w.length * 2));
        before - self.windows.len()
    }
}

/// Fixed-window limiter over `(profile, endpoint-class, ip)` counters held in
/// counter actors. Whitelisted addresses bypass counting entirely; actor
/// failures fail open.
#[derive(Clone)]
pub struct RateLimiter {
    counters: ShardedStore<CounterState>,
    resolver: ConfigResolver,
}

impl RateLimiter {
    pub fn new(router: ShardRouter, resolver: ConfigResolver) -> Self {
        Self {
            counters: ShardedStore::spawn_with(router, std::time::Duration::from_secs(120), |_| {
                CounterState::default()
            }),
            resolver,
        }
    }

    pub async fn check(&self, class: EndpointClass, ip: &str) -> RateDecision {
        let profile = self.resolver.rate_limit_profile().await;
        if self.is_whitelisted(ip) {
            let (limit, window) = profile.window(class);
            return RateDecision {
                allowed: true,
                limit,
                remaining: limit,
                reset: (Utc::now() + Duration::seconds(window)).timestamp(),
                retry_after: 0,
            };
        }

        let (limit, window_seconds) = profile.window(class);
        let key = format!("{}:{}:{}", profile.as_str(), class.as_str(), ip);

        match self
            .counters
            .handle_for("rate", &key)
            .call(CounterOp::Hit {
                key: key.clone(),
                limit,
                window_seconds,
            })
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                // Fail open: a broken counter must not take the endpoint down.
                tracing::error!(error = %err, "rate-limit counter unavailable, failing open");
                RateDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    reset: (Utc::now() + Duration::seconds(window_seconds)).timestamp(),
                    retry_after: 0,
                }
            }
        }
    }

    fn is_whitelisted(&self, ip: &str) -> bool {
        self.resolver
            .boot()
            .rate_limit
            .whitelist
            .iter()
            .any(|allowed| allowed == ip)
    }
}

/// Brute-force limiter for device-grant user codes: more than five failed
/// verifications per hour blocks the address, each further block doubling in
/// duration up to 24 h. A successful verification clears the record.
#[derive(Debug, Default)]
pub struct UserCodeLimiterState {
    records: HashMap<String, UserCodeRecord>,
}

#[derive(Debug, Default)]
struct UserCodeRecord {
    failures: Vec<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
    block_seconds: i64,
}

const FAILURE_WINDOW: i64 = 3600;
const FAILURE_THRESHOLD: usize = 5;
const INITIAL_BLOCK_SECONDS: i64 = 300;
const MAX_BLOCK_SECONDS: i64 = 86_400;

#[derive(Clone, Debug)]
pub enum UserCodeLimiterOp {
    Check { ip: String },
    RecordFailure { ip: String },
    RecordSuccess { ip: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum UserCodeLimiterReply {
    Allowed,
    Blocked { retry_after: i64 },
    Recorded,
}

impl ActorState for UserCodeLimiterState {
    type Op = UserCodeLimiterOp;
    type Reply = UserCodeLimiterReply;

    fn apply(&mut self, op: UserCodeLimiterOp, now: DateTime<Utc>) -> UserCodeLimiterReply {
        match op {
            UserCodeLimiterOp::Check { ip } => match self.records.get(&ip) {
                Some(record) => match record.blocked_until {
                    Some(until) if until > now => UserCodeLimiterReply::Blocked {
                        retry_after: (until - now).num_seconds().max(1),
                    },
                    _ => UserCodeLimiterReply::Allowed,
                },
                None => UserCodeLimiterReply::Allowed,
            },
            UserCodeLimiterOp::RecordFailure { ip } => {
                let record = self.records.entry(ip).or_default();
                record
                    .failures
                    .retain(|at| now - *at < Duration::seconds(FAILURE_WINDOW));
                record.failures.push(now);

                if record.failures.len() > FAILURE_THRESHOLD {
                    record.block_seconds = if record.block_seconds == 0 {
                        INITIAL_BLOCK_SECONDS
                    } else {
                        (record.block_seconds * 2).min(MAX_BLOCK_SECONDS)
                    };
                    record.blocked_until = Some(now + Duration::seconds(record.block_seconds));
                    record.failures.clear();
                    return UserCodeLimiterReply::Blocked {
                        retry_after: record.block_seconds,
                    };
                }
                UserCodeLimiterReply::Recorded
            }
            UserCodeLimiterOp::RecordSuccess { ip } => {
                self.records.remove(&ip);
                UserCodeLimiterReply::Recorded
            }
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| {
            let blocked = record.blocked_until.map(|until| until > now).unwrap_or(false);
            let recent = record
                .failures
                .iter()
                .any(|at| now - *at < Duration::seconds(FAILURE_WINDOW));
            blocked || recent
        });
        before - self.records.len()
    }
}
