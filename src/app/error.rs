use crate::actor::ActorError;

/// Protocol-level error vocabulary (RFC 6749 §5.2, RFC 8628 §3.5, RFC 9126,
/// RFC 9449). Services return these; the HTTP layer maps them onto status
/// codes and JSON bodies. `ServerError` carries internal detail for logging
/// only and is never serialized to the wire.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("invalid_client: {0}")]
    InvalidClient(String),
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    #[error("unauthorized_client: {0}")]
    UnauthorizedClient(String),
    #[error("unsupported_grant_type")]
    UnsupportedGrantType,
    #[error("unsupported_response_type")]
    UnsupportedResponseType,
    #[error("invalid_scope: {0}")]
    InvalidScope(String),
    #[error("access_denied")]
    AccessDenied,
    #[error("authorization_pending")]
    AuthorizationPending,
    #[error("slow_down")]
    SlowDown,
    #[error("expired_token")]
    ExpiredToken,
    #[error("invalid_request_object: {0}")]
    InvalidRequestObject(String),
    #[error("invalid_request_uri: {0}")]
    InvalidRequestUri(String),
    #[error("invalid_dpop_proof: {0}")]
    InvalidDpopProof(String),
    #[error("invalid_token: {0}")]
    InvalidToken(String),
    #[error("interaction_required")]
    InteractionRequired,
    #[error("login_required")]
    LoginRequired,
    #[error("server_error: {0}")]
    ServerError(#[from] anyhow::Error),
}

impl OAuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnauthorizedClient(_) => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope(_) => "invalid_scope",
            Self::AccessDenied => "access_denied",
            Self::AuthorizationPending => "authorization_pending",
            Self::SlowDown => "slow_down",
            Self::ExpiredToken => "expired_token",
            Self::InvalidRequestObject(_) => "invalid_request_object",
            Self::InvalidRequestUri(_) => "invalid_request_uri",
            Self::InvalidDpopProof(_) => "invalid_dpop_proof",
            Self::InvalidToken(_) => "invalid_token",
            Self::InteractionRequired => "interaction_required",
            Self::LoginRequired => "login_required",
            Self::ServerError(_) => "server_error",
        }
    }

    /// Description safe to put on the wire. Internal errors get a generic
    /// message; everything else carries its protocol-visible detail.
    pub fn public_description(&self) -> Option<String> {
        match self {
            Self::ServerError(_) => None,
            Self::UnsupportedGrantType
            | Self::UnsupportedResponseType
            | Self::AccessDenied
            | Self::AuthorizationPending
            | Self::SlowDown
            | Self::ExpiredToken
            | Self::InteractionRequired
            | Self::LoginRequired => None,
            Self::InvalidRequest(d)
            | Self::InvalidClient(d)
            | Self::InvalidGrant(d)
            | Self::UnauthorizedClient(d)
            | Self::InvalidScope(d)
            | Self::InvalidRequestObject(d)
            | Self::InvalidRequestUri(d)
            | Self::InvalidDpopProof(d)
            | Self::InvalidToken(d) => Some(d.clone()),
        }
    }
}

impl From<ActorError> for OAuthError {
    fn from(err: ActorError) -> Self {
        Self::ServerError(anyhow::anyhow!(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_detail_stays_internal() {
        let err = OAuthError::ServerError(anyhow::anyhow!("connection refused to shard 3"));
        assert_eq!(err.code(), "server_error");
        assert_eq!(err.public_description(), None);
    }

    #[test]
    fn grant_errors_expose_detail() {
        let err = OAuthError::InvalidGrant("authorization code already used".to_string());
        assert_eq!(err.code(), "invalid_grant");
        assert!(err.public_description().unwrap().contains("already used"));
    }
}
