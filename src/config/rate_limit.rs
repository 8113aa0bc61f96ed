use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Fixed-window rate-limit profile. The active profile name is resolvable at
/// runtime through the config resolver, so operators can switch profiles
/// without a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RateLimitProfile {
    Strict,
    Moderate,
    Lenient,
    LoadTest,
}

impl RateLimitProfile {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "strict" => Some(Self::Strict),
            "moderate" => Some(Self::Moderate),
            "lenient" => Some(Self::Lenient),
            "loadTest" => Some(Self::LoadTest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Moderate => "moderate",
            Self::Lenient => "lenient",
            Self::LoadTest => "loadTest",
        }
    }

    /// `(limit, window_seconds)` for an endpoint class under this profile.
    pub fn window(&self, class: EndpointClass) -> (u32, i64) {
        use EndpointClass::*;
        match (self, class) {
            (Self::Strict, Token) => (30, 60),
            (Self::Strict, Authorize) => (20, 60),
            (Self::Strict, Par) => (20, 60),
            (Self::Strict, Introspect) => (60, 60),
            (Self::Strict, Backchannel) => (10, 60),
            (Self::Moderate, Token) => (120, 60),
            (Self::Moderate, Authorize) => (60, 60),
            (Self::Moderate, Par) => (60, 60),
            (Self::Moderate, Introspect) => (240, 60),
            (Self::Moderate, Backchannel) => (30, 60),
            (Self::Lenient, Token) => (600, 60),
            (Self::Lenient, Authorize) => (300, 60),
            (Self::Lenient, Par) => (300, 60),
            (Self::Lenient, Introspect) => (1200, 60),
            (Self::Lenient, Backchannel) => (120, 60),
            (Self::LoadTest, _) => (100_000, 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Authorize,
    Token,
    Par,
    Introspect,
    Backchannel,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authorize => "authorize",
            Self::Token => "token",
            Self::Par => "par",
            Self::Introspect => "introspect",
            Self::Backchannel => "backchannel",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub profile: RateLimitProfile,
    pub whitelist: Vec<String>,
}

impl RateLimitConfig {
    pub fn from_env() -> Result<Self> {
        let profile = env::var("RATE_LIMIT_PROFILE")
            .ok()
            .and_then(|v| RateLimitProfile::parse(&v))
            .unwrap_or(RateLimitProfile::Moderate);
        let whitelist = env::var("RATE_LIMIT_WHITELIST")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().to_string())
            .collect();
        Ok(RateLimitConfig { profile, whitelist })
    }
}
