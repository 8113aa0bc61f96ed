use axum::{
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::app::error::OAuthError;

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            OAuthError::InvalidClient(_) => StatusCode::UNAUTHORIZED,
            OAuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            OAuthError::ServerError(detail) => {
                tracing::error!(error = %detail, "internal error surfaced as server_error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };

        let mut body = json!({ "error": self.code() });
        if let Some(description) = self.public_description() {
            body["error_description"] = json!(description);
        }

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            let challenge = match &self {
                OAuthError::InvalidClient(_) => "Basic realm=\"oxauth\"".to_string(),
                other => format!("Bearer error=\"{}\"", other.code()),
            };
            if let Ok(value) = challenge.parse() {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

/// Auto-submitting form-post response (OAuth 2.0 Form Post Response Mode).
/// Every interpolated value goes through `encode_quoted_attribute`, which escapes the
/// full `< > " ' &` set, so hostile parameter values can neither break out
/// of the attribute nor inject markup into the body.
pub fn render_form_post(action: &str, fields: &[(&str, &str)]) -> Html<String> {
    let mut inputs = String::new();
    for (name, value) in fields {
        inputs.push_str(&format!(
            "        <input type=\"hidden\" name=\"{}\" value=\"{}\"/>\n",
            html_escape::encode_quoted_attribute(name),
            html_escape::encode_quoted_attribute(value),
        ));
    }

    Html(format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head>\n\
             <meta charset=\"utf-8\"/>\n\
             <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\"/>\n\
             <title>Redirecting</title>\n\
         </head>\n\
         <body onload=\"document.getElementById('auth-form').submit()\">\n\
             <p>Redirecting&hellip;</p>\n\
             <form id=\"auth-form\" method=\"post\" action=\"{}\">\n{}\
                 <noscript><button type=\"submit\">Continue</button></noscript>\n\
             </form>\n\
             <script>document.getElementById('auth-form').submit();</script>\n\
         </body>\n\
         </html>\n",
        html_escape::encode_quoted_attribute(action),
        inputs,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_post_escapes_hostile_state() {
        let Html(body) = render_form_post(
            "https://rp/cb",
            &[("code", "abc"), ("state", "<script>alert(1)</script>")],
        );

        assert!(body.contains("<!DOCTYPE html>"));
        assert!(body.contains("value=\"&lt;script&gt;alert(1)&lt;/script&gt;\""));
        assert!(!body.contains("<script>alert(1)</script>"));
        assert!(body.contains("document.getElementById('auth-form').submit()"));
        assert!(body.contains("Redirecting"));
    }

    #[test]
    fn form_post_escapes_quotes_and_ampersands() {
        let Html(body) = render_form_post("https://rp/cb?a=1&b=2", &[("state", "a\"b'c&d")]);
        assert!(body.contains("action=\"https://rp/cb?a=1&amp;b=2\""));
        assert!(!body.contains("a\"b'c&d"));
    }
}
