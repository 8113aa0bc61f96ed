use crate::app::error::OAuthError;

use super::crypto;

pub const MIN_LENGTH: usize = 43;
pub const MAX_LENGTH: usize = 128;

/// RFC 7636 shape check for challenges and verifiers: 43–128 characters from
/// the unreserved set.
fn valid_shape(value: &str) -> bool {
    (MIN_LENGTH..=MAX_LENGTH).contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// Validate the challenge parameters presented at authorization time. If a
/// challenge is present a method must accompany it; `S256` is mandatory under
/// FAPI.
pub fn validate_challenge(
    code_challenge: Option<&str>,
    code_challenge_method: Option<&str>,
    fapi: bool,
) -> Result<(), OAuthError> {
    let challenge = match code_challenge {
        Some(c) => c,
        None => {
            if fapi {
                return Err(OAuthError::InvalidRequest(
                    "code_challenge is required".to_string(),
                ));
            }
            return Ok(());
        }
    };

    if !valid_shape(challenge) {
        return Err(OAuthError::InvalidRequest(
            "code_challenge must be 43-128 characters".to_string(),
        ));
    }

    match code_challenge_method {
        Some("S256") => Ok(()),
        Some("plain") if !fapi => Ok(()),
        Some("plain") => Err(OAuthError::InvalidRequest(
            "code_challenge_method must be S256".to_string(),
        )),
        Some(_) => Err(OAuthError::InvalidRequest(
            "unknown code_challenge_method".to_string(),
        )),
        None => Err(OAuthError::InvalidRequest(
            "code_challenge_method is required when code_challenge is present".to_string(),
        )),
    }
}

/// Verify a token-request verifier against the challenge bound at mint time.
pub fn verify(challenge: &str, method: &str, verifier: &str) -> Result<(), OAuthError> {
    if !valid_shape(verifier) {
        return Err(OAuthError::InvalidGrant(
            "code_verifier must be 43-128 characters".to_string(),
        ));
    }

    let ok = match method {
        "S256" => crypto::sha256_b64url(verifier.as_bytes()) == challenge,
        "plain" => crypto::constant_time_compare(verifier.as_bytes(), challenge.as_bytes()),
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(OAuthError::InvalidGrant("PKCE verification failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7636 appendix B test vector.
    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

    #[test]
    fn s256_vector_verifies() {
        assert!(verify(CHALLENGE, "S256", VERIFIER).is_ok());
        assert!(verify(CHALLENGE, "S256", "wrong-verifier-wrong-verifier-wrong-verifier").is_err());
    }

    #[test]
    fn plain_method_compares_directly() {
        assert!(verify(VERIFIER, "plain", VERIFIER).is_ok());
        assert!(verify(CHALLENGE, "plain", VERIFIER).is_err());
    }

    #[test]
    fn length_boundaries() {
        let ok_43 = "a".repeat(43);
        let ok_128 = "a".repeat(128);
        let bad_42 = "a".repeat(42);
        let bad_129 = "a".repeat(129);

        assert!(validate_challenge(Some(&ok_43), Some("S256"), false).is_ok());
        assert!(validate_challenge(Some(&ok_128), Some("S256"), false).is_ok());
        assert!(validate_challenge(Some(&bad_42), Some("S256"), false).is_err());
        assert!(validate_challenge(Some(&bad_129), Some("S256"), false).is_err());
    }

    #[test]
    fn method_is_required_with_challenge() {
        let challenge = "a".repeat(43);
        assert!(validate_challenge(Some(&challenge), None, false).is_err());
    }

    #[test]
    fn fapi_requires_s256_and_presence() {
        let challenge = "a".repeat(43);
        assert!(validate_challenge(None, None, true).is_err());
        assert!(validate_challenge(Some(&challenge), Some("plain"), true).is_err());
        assert!(validate_challenge(Some(&challenge), Some("S256"), true).is_ok());
    }
}
