use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use jsonwebtoken::{Algorithm, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actor::replay_window::{ReplayWindowOp, ReplayWindowState};
use crate::actor::{ShardRouter, ShardedStore};
use crate::app::error::OAuthError;

use super::{crypto, jwk};

const JTI_TENANT: &str = "dpop";

#[derive(Debug, Deserialize)]
struct DpopProofHeader {
    typ: Option<String>,
    alg: String,
    jwk: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DpopProofClaims {
    jti: String,
    htm: String,
    htu: String,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    ath: Option<String>,
}

/// RFC 9449 proof validation. The verified outcome is the proof key's RFC
/// 7638 thumbprint (`jkt`), which binds issued tokens to the key.
#[derive(Clone)]
pub struct DpopService {
    jti_store: ShardedStore<ReplayWindowState>,
    iat_skew: i64,
}

impl DpopService {
    pub fn new(router: ShardRouter, iat_skew: i64) -> Self {
        let jti_store = ShardedStore::spawn_with(
            router,
            std::time::Duration::from_secs(60),
            |_| ReplayWindowState::default(),
        );
        Self { jti_store, iat_skew }
    }

    /// Validate a DPoP proof for `method`/`url`. When the request carries a
    /// bound access token, its hash must match the proof's `ath` claim.
    pub async fn verify_proof(
        &self,
        proof: &str,
        method: &str,
        url: &str,
        access_token: Option<&str>,
    ) -> Result<String, OAuthError> {
        let (header, proof_jwk) = Self::parse_header(proof)?;

        if header.typ.as_deref() != Some("dpop+jwt") {
            return Err(OAuthError::InvalidDpopProof("typ must be dpop+jwt".to_string()));
        }

        let alg = Self::parse_alg(&header.alg)?;
        let decoding_key = jwk::decoding_key_from_jwk(&proof_jwk)
            .map_err(|e| OAuthError::InvalidDpopProof(e.to_string()))?;

        let mut validation = Validation::new(alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = jsonwebtoken::decode::<DpopProofClaims>(proof, &decoding_key, &validation)
            .map_err(|e| OAuthError::InvalidDpopProof(format!("signature check failed: {}", e)))?
            .claims;

        if claims.htm != method {
            return Err(OAuthError::InvalidDpopProof("htm mismatch".to_string()));
        }

        let normalized = Self::normalize_url(url)?;
        if claims.htu != normalized {
            return Err(OAuthError::InvalidDpopProof("htu mismatch".to_string()));
        }

        let now = Utc::now().timestamp();
        if (now - claims.iat).abs() > self.iat_skew {
            return Err(OAuthError::InvalidDpopProof("iat outside acceptance window".to_string()));
        }

        match (access_token, &claims.ath) {
            (Some(token), Some(ath)) => {
                if crypto::sha256_b64url(token.as_bytes()) != *ath {
                    return Err(OAuthError::InvalidDpopProof("ath mismatch".to_string()));
                }
            }
            (Some(_), None) => {
                return Err(OAuthError::InvalidDpopProof(
                    "ath required for bound access token".to_string(),
                ));
            }
            _ => {}
        }

        let jkt = crypto::fingerprint_jwk(&proof_jwk)
            .map_err(|e| OAuthError::InvalidDpopProof(e.to_string()))?;

        // One observation per (jkt, jti) inside the skew window; shards are
        // keyed by jkt so observations for one key stay linearized.
        let fresh = self
            .jti_store
            .handle_for(JTI_TENANT, &jkt)
            .call(ReplayWindowOp::Observe {
                key: format!("{}:{}", jkt, claims.jti),
                ttl_seconds: self.iat_skew * 2,
            })
            .await?;
        if !fresh {
            tracing::warn!(jkt = %jkt, "replayed DPoP jti rejected");
            return Err(OAuthError::InvalidDpopProof("jti already used".to_string()));
        }

        Ok(jkt)
    }

    fn parse_header(proof: &str) -> Result<(DpopProofHeader, Value), OAuthError> {
        let head = proof
            .split('.')
            .next()
            .ok_or_else(|| OAuthError::InvalidDpopProof("malformed proof".to_string()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(head)
            .map_err(|_| OAuthError::InvalidDpopProof("invalid header encoding".to_string()))?;
        let header: DpopProofHeader = serde_json::from_slice(&bytes)
            .map_err(|_| OAuthError::InvalidDpopProof("invalid header JSON".to_string()))?;
        let jwk = header
            .jwk
            .clone()
            .ok_or_else(|| OAuthError::InvalidDpopProof("header must carry jwk".to_string()))?;
        if jwk.get("d").is_some() {
            return Err(OAuthError::InvalidDpopProof(
                "jwk must not contain private members".to_string(),
            ));
        }
        Ok((header, jwk))
    }

    fn parse_alg(raw: &str) -> Result<Algorithm, OAuthError> {
        match raw {
            "ES256" => Ok(Algorithm::ES256),
            "ES384" => Ok(Algorithm::ES384),
            "RS256" => Ok(Algorithm::RS256),
            "RS384" => Ok(Algorithm::RS384),
            "RS512" => Ok(Algorithm::RS512),
            "PS256" => Ok(Algorithm::PS256),
            other => Err(OAuthError::InvalidDpopProof(format!(
                "unsupported proof algorithm: {}",
                other
            ))),
        }
    }

    /// `htu` comparison form: scheme, host, optional port, path; query and
    /// fragment dropped.
    fn normalize_url(raw: &str) -> Result<String, OAuthError> {
        let parsed = url::Url::parse(raw)
            .map_err(|_| OAuthError::InvalidDpopProof("invalid request URL".to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| OAuthError::InvalidDpopProof("URL has no host".to_string()))?;
        let mut normalized = format!("{}://{}", parsed.scheme(), host);
        if let Some(port) = parsed.port() {
            normalized.push_str(&format!(":{}", port));
        }
        normalized.push_str(parsed.path());
        Ok(normalized)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::{Signature, SigningKey};
    use p256::elliptic_curve::sec1::ToEncodedPoint;
    use serde_json::json;

    pub struct ProofKey {
        signing: SigningKey,
        pub jwk: Value,
    }

    impl ProofKey {
        pub fn generate() -> Self {
            let signing = SigningKey::random(&mut rand::thread_rng());
            let point = signing.verifying_key().to_encoded_point(false);
            let jwk = json!({
                "kty": "EC",
                "crv": "P-256",
                "x": URL_SAFE_NO_PAD.encode(point.x().unwrap()),
                "y": URL_SAFE_NO_PAD.encode(point.y().unwrap()),
            });
            Self { signing, jwk }
        }

        pub fn jkt(&self) -> String {
            crypto::fingerprint_jwk(&self.jwk).unwrap()
        }

        /// Raw JOSE signature (r || s) over an arbitrary signing input.
        pub fn sign_raw(&self, message: &[u8]) -> Vec<u8> {
            let signature: Signature = self.signing.sign(message);
            signature.to_bytes().to_vec()
        }

        pub fn proof(&self, method: &str, url: &str, jti: &str, ath: Option<&str>) -> String {
            self.proof_at(method, url, jti, ath, Utc::now().timestamp())
        }

        pub fn proof_at(
            &self,
            method: &str,
            url: &str,
            jti: &str,
            ath: Option<&str>,
            iat: i64,
        ) -> String {
            let header = json!({"typ": "dpop+jwt", "alg": "ES256", "jwk": self.jwk});
            let mut claims = json!({"jti": jti, "htm": method, "htu": url, "iat": iat});
            if let Some(ath) = ath {
                claims["ath"] = json!(ath);
            }
            let signing_input = format!(
                "{}.{}",
                URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
                URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap()),
            );
            let signature: Signature = self.signing.sign(signing_input.as_bytes());
            format!(
                "{}.{}",
                signing_input,
                URL_SAFE_NO_PAD.encode(signature.to_bytes())
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ProofKey;
    use super::*;

    fn service() -> DpopService {
        DpopService::new(ShardRouter::new(1, "auto", 2), 60)
    }

    #[tokio::test]
    async fn valid_proof_yields_jkt() {
        let svc = service();
        let key = ProofKey::generate();
        let proof = key.proof("POST", "https://auth.test/token", "jti-1", None);
        let jkt = svc
            .verify_proof(&proof, "POST", "https://auth.test/token", None)
            .await
            .unwrap();
        assert_eq!(jkt, key.jkt());
    }

    #[tokio::test]
    async fn replayed_jti_is_rejected() {
        let svc = service();
        let key = ProofKey::generate();
        let proof = key.proof("POST", "https://auth.test/token", "jti-replay", None);

        assert!(svc
            .verify_proof(&proof, "POST", "https://auth.test/token", None)
            .await
            .is_ok());
        let err = svc
            .verify_proof(&proof, "POST", "https://auth.test/token", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_dpop_proof");
    }

    #[tokio::test]
    async fn htm_and_htu_must_match() {
        let svc = service();
        let key = ProofKey::generate();

        let wrong_method = key.proof("GET", "https://auth.test/token", "j1", None);
        assert!(svc
            .verify_proof(&wrong_method, "POST", "https://auth.test/token", None)
            .await
            .is_err());

        let wrong_url = key.proof("POST", "https://other.test/token", "j2", None);
        assert!(svc
            .verify_proof(&wrong_url, "POST", "https://auth.test/token", None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn query_string_is_ignored_for_htu() {
        let svc = service();
        let key = ProofKey::generate();
        let proof = key.proof("POST", "https://auth.test/token", "j3", None);
        assert!(svc
            .verify_proof(&proof, "POST", "https://auth.test/token?extra=1", None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn stale_iat_is_rejected() {
        let svc = service();
        let key = ProofKey::generate();
        let old = Utc::now().timestamp() - 300;
        let proof = key.proof_at("POST", "https://auth.test/token", "j4", None, old);
        assert!(svc
            .verify_proof(&proof, "POST", "https://auth.test/token", None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn bound_token_requires_matching_ath() {
        let svc = service();
        let key = ProofKey::generate();
        let token = "an.access.token";
        let ath = crypto::sha256_b64url(token.as_bytes());

        let good = key.proof("GET", "https://auth.test/userinfo", "j5", Some(&ath));
        assert!(svc
            .verify_proof(&good, "GET", "https://auth.test/userinfo", Some(token))
            .await
            .is_ok());

        let missing = key.proof("GET", "https://auth.test/userinfo", "j6", None);
        assert!(svc
            .verify_proof(&missing, "GET", "https://auth.test/userinfo", Some(token))
            .await
            .is_err());
    }
}
