use serde::{Deserialize, Serialize};

/// Authorization request parameters, as pushed to PAR or supplied directly to
/// the authorization endpoint. Request-object claims override the same-named
/// members.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationParams {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub response_mode: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub prompt: Option<String>,
    pub max_age: Option<u64>,
    pub login_hint: Option<String>,
    pub acr_values: Option<String>,
    pub claims: Option<String>,
    /// Inline JAR (signed, optionally encrypted request object).
    pub request: Option<String>,
    pub request_uri: Option<String>,
}

impl AuthorizationParams {
    /// Build from a raw query/form map. Numeric members are parsed here so
    /// handlers can stay on string maps.
    pub fn from_map(map: &std::collections::HashMap<String, String>) -> Self {
        let take = |key: &str| map.get(key).filter(|v| !v.is_empty()).cloned();
        Self {
            response_type: take("response_type"),
            client_id: take("client_id"),
            redirect_uri: take("redirect_uri"),
            scope: take("scope"),
            state: take("state"),
            nonce: take("nonce"),
            response_mode: take("response_mode"),
            code_challenge: take("code_challenge"),
            code_challenge_method: take("code_challenge_method"),
            prompt: take("prompt"),
            max_age: take("max_age").and_then(|v| v.parse().ok()),
            login_hint: take("login_hint"),
            acr_values: take("acr_values"),
            claims: take("claims"),
            request: take("request"),
            request_uri: take("request_uri"),
        }
    }

    /// Apply request-object claims on top of the query parameters. Any member
    /// present in the request object wins.
    pub fn overridden_by(mut self, other: AuthorizationParams) -> Self {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(response_type);
        take!(client_id);
        take!(redirect_uri);
        take!(scope);
        take!(state);
        take!(nonce);
        take!(response_mode);
        take!(code_challenge);
        take!(code_challenge_method);
        take!(prompt);
        take!(max_age);
        take!(login_hint);
        take!(acr_values);
        take!(claims);
        self
    }

    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn is_openid(&self) -> bool {
        self.scopes().iter().any(|s| s == "openid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_object_members_override_query_params() {
        let query = AuthorizationParams {
            scope: Some("openid".to_string()),
            state: Some("from-query".to_string()),
            ..Default::default()
        };
        let object = AuthorizationParams {
            state: Some("from-object".to_string()),
            nonce: Some("n1".to_string()),
            ..Default::default()
        };

        let merged = query.overridden_by(object);
        assert_eq!(merged.state.as_deref(), Some("from-object"));
        assert_eq!(merged.scope.as_deref(), Some("openid"));
        assert_eq!(merged.nonce.as_deref(), Some("n1"));
    }

    #[test]
    fn openid_scope_detection() {
        let mut params = AuthorizationParams::default();
        assert!(!params.is_openid());
        params.scope = Some("openid profile".to_string());
        assert!(params.is_openid());
    }
}
