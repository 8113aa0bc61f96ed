use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::crypto;

/// Algorithms accepted for DID-style key-bound logins. The JWS backend has
/// no P-521 support, so ES512 proofs are not accepted.
pub const DID_ALLOWED_ALGS: &[&str] = &["ES256", "ES384", "EdDSA"];

struct RingKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    public_jwk: Value,
    private_pem: String,
    /// Retired keys no longer sign but stay in the published JWKS until
    /// every token they signed has expired.
    retired: bool,
}

/// Sole owner of private key material. Reads are concurrent; rotation and
/// retirement are the only writes and are serialized, so callers never
/// observe a ring without an active signing key.
#[derive(Clone)]
pub struct KeyRing {
    issuer: String,
    keys: Arc<RwLock<Vec<RingKey>>>,
}

impl KeyRing {
    /// Build the ring from configured PKCS#8 PEM material, or fall back to a
    /// process-local generated RSA-2048 key (dev/test). The fallback key is
    /// generated once per process; rotation always mints fresh material.
    pub fn from_config(issuer: &str, signing_key_pem: Option<&str>) -> Result<Self> {
        let key = match signing_key_pem {
            Some(pem) => Self::key_from_pem(pem)?,
            None => Self::key_from_pem(Self::process_dev_key_pem()?)?,
        };
        Ok(Self {
            issuer: issuer.to_string(),
            keys: Arc::new(RwLock::new(vec![key])),
        })
    }

    fn process_dev_key_pem() -> Result<&'static str> {
        use std::sync::OnceLock;
        static DEV_KEY_PEM: OnceLock<String> = OnceLock::new();
        if DEV_KEY_PEM.get().is_none() {
            use rsa::pkcs8::EncodePrivateKey;
            let mut rng = rand::thread_rng();
            let private = rsa::RsaPrivateKey::new(&mut rng, 2048)
                .map_err(|e| anyhow::anyhow!("key generation failed: {}", e))?;
            let pem = private
                .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
                .map_err(|e| anyhow::anyhow!("key encoding failed: {}", e))?
                .to_string();
            let _ = DEV_KEY_PEM.set(pem);
        }
        Ok(DEV_KEY_PEM.get().expect("just initialized"))
    }

    fn key_from_pem(pem: &str) -> Result<RingKey> {
        use rsa::pkcs8::DecodePrivateKey;
        let private = rsa::RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| anyhow::anyhow!("invalid signing key PEM: {}", e))?;
        Self::build_key(private, pem.to_string())
    }

    fn generate_key() -> Result<RingKey> {
        use rsa::pkcs8::EncodePrivateKey;
        let mut rng = rand::thread_rng();
        let private = rsa::RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| anyhow::anyhow!("key generation failed: {}", e))?;
        let pem = private
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| anyhow::anyhow!("key encoding failed: {}", e))?
            .to_string();
        Self::build_key(private, pem)
    }

    fn build_key(private: rsa::RsaPrivateKey, private_pem: String) -> Result<RingKey> {
        use rsa::pkcs8::EncodePublicKey;
        use rsa::traits::PublicKeyParts;

        let public = private.to_public_key();
        let public_pem = public
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| anyhow::anyhow!("public key encoding failed: {}", e))?;

        let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
        let mut public_jwk = json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "n": n,
            "e": e,
        });
        let kid = crypto::fingerprint_jwk(&public_jwk)?;
        public_jwk["kid"] = json!(kid);

        Ok(RingKey {
            kid,
            encoding: EncodingKey::from_rsa_pem(private_pem.as_bytes())
                .map_err(|e| anyhow::anyhow!("signing key rejected: {}", e))?,
            decoding: DecodingKey::from_rsa_pem(public_pem.as_bytes())
                .map_err(|e| anyhow::anyhow!("verification key rejected: {}", e))?,
            public_jwk,
            private_pem,
            retired: false,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub async fn active_kid(&self) -> String {
        let keys = self.keys.read().await;
        keys.iter()
            .rev()
            .find(|k| !k.retired)
            .map(|k| k.kid.clone())
            .unwrap_or_default()
    }

    /// Compact JWS over `claims` with the active key (RS256).
    pub async fn sign(&self, claims: &Value) -> Result<String> {
        self.sign_with_typ(claims, None).await
    }

    pub async fn sign_with_typ(&self, claims: &Value, typ: Option<&str>) -> Result<String> {
        let keys = self.keys.read().await;
        let key = keys
            .iter()
            .rev()
            .find(|k| !k.retired)
            .ok_or_else(|| anyhow::anyhow!("no active signing key"))?;

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key.kid.clone());
        if let Some(typ) = typ {
            header.typ = Some(typ.to_string());
        }
        jsonwebtoken::encode(&header, claims, &key.encoding)
            .map_err(|e| anyhow::anyhow!("signing failed: {}", e))
    }

    /// Verify a compact JWS issued by this ring. Any published kid is
    /// accepted; the algorithm must be in `allowed_algs`.
    pub async fn verify(
        &self,
        jws: &str,
        expected_aud: Option<&str>,
        allowed_algs: &[Algorithm],
    ) -> Result<Value> {
        let header = jsonwebtoken::decode_header(jws)
            .map_err(|e| anyhow::anyhow!("invalid JWS header: {}", e))?;
        if !allowed_algs.contains(&header.alg) {
            return Err(anyhow::anyhow!("algorithm {:?} not allowed", header.alg));
        }

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        match expected_aud {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        let keys = self.keys.read().await;
        let candidates: Vec<&RingKey> = match header.kid.as_deref() {
            Some(kid) => keys.iter().filter(|k| k.kid == kid).collect(),
            None => keys.iter().collect(),
        };
        if candidates.is_empty() {
            return Err(anyhow::anyhow!("unknown kid"));
        }

        let mut last_err = None;
        for key in candidates {
            match jsonwebtoken::decode::<Value>(jws, &key.decoding, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(e) => last_err = Some(e),
            }
        }
        Err(anyhow::anyhow!(
            "verification failed: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    /// Decrypt a compact JWE addressed to this ring and return the inner
    /// payload (normally a nested compact JWS).
    pub async fn decrypt_jwe(&self, compact: &str) -> Result<String> {
        use picky::jose::jwe::Jwe;
        use picky::key::PrivateKey;

        let keys = self.keys.read().await;
        let mut last_err = None;
        for key in keys.iter() {
            let private = PrivateKey::from_pem_str(&key.private_pem)
                .map_err(|e| anyhow::anyhow!("key material rejected: {}", e))?;
            match Jwe::decode(compact, &private) {
                Ok(jwe) => {
                    return String::from_utf8(jwe.payload)
                        .map_err(|_| anyhow::anyhow!("JWE payload is not UTF-8"));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(anyhow::anyhow!(
            "JWE decryption failed: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    /// Encrypt a payload (normally a signed id_token) to a recipient RSA JWK.
    pub fn encrypt_to_jwk(recipient_jwk: &Value, payload: &str) -> Result<String> {
        use picky::jose::jwe::{Jwe, JweAlg, JweEnc};
        use picky::key::PublicKey;

        let pem = super::jwk::rsa_public_pem_from_jwk(recipient_jwk)?;
        let public = PublicKey::from_pem_str(&pem)
            .map_err(|e| anyhow::anyhow!("recipient key rejected: {}", e))?;

        Jwe::new(JweAlg::RsaOaep256, JweEnc::Aes256Gcm, payload.as_bytes().to_vec())
            .encode(&public)
            .map_err(|e| anyhow::anyhow!("JWE encryption failed: {}", e))
    }

    /// Published verification keys, retired kids included.
    pub async fn public_jwks(&self) -> Value {
        let keys = self.keys.read().await;
        let jwks: Vec<Value> = keys.iter().map(|k| k.public_jwk.clone()).collect();
        json!({ "keys": jwks })
    }

    /// Rotate: a fresh key becomes the signer, the previous one is retired
    /// from signing but remains published for verification.
    pub async fn rotate(&self) -> Result<String> {
        let new_key = Self::generate_key()?;
        let kid = new_key.kid.clone();
        let mut keys = self.keys.write().await;
        for key in keys.iter_mut() {
            key.retired = true;
        }
        keys.push(new_key);
        tracing::info!(kid = %kid, at = %Utc::now(), "signing key rotated");
        Ok(kid)
    }

    /// Drop a retired kid from the published set.
    pub async fn retire(&self, kid: &str) -> bool {
        let mut keys = self.keys.write().await;
        let before = keys.len();
        keys.retain(|k| !(k.retired && k.kid == kid));
        keys.len() != before
    }

    /// Verify a key-bound login assertion (DID-style) against the holder's
    /// own JWK. Only the key-bound algorithm set is accepted; RSA and HMAC
    /// algorithms never are.
    pub fn verify_key_bound_assertion(jws: &str, holder_jwk: &Value) -> Result<Value> {
        let header = jsonwebtoken::decode_header(jws)
            .map_err(|e| anyhow::anyhow!("invalid assertion header: {}", e))?;

        let alg_name = match header.alg {
            Algorithm::HS256 => "HS256",
            Algorithm::HS384 => "HS384",
            Algorithm::HS512 => "HS512",
            Algorithm::ES256 => "ES256",
            Algorithm::ES384 => "ES384",
            Algorithm::RS256 => "RS256",
            Algorithm::RS384 => "RS384",
            Algorithm::RS512 => "RS512",
            Algorithm::PS256 => "PS256",
            Algorithm::PS384 => "PS384",
            Algorithm::PS512 => "PS512",
            Algorithm::EdDSA => "EdDSA",
        };
        if !DID_ALLOWED_ALGS.contains(&alg_name) {
            return Err(anyhow::anyhow!("algorithm {} not allowed for key-bound login", alg_name));
        }

        let decoding = super::jwk::decoding_key_from_jwk(holder_jwk)?;
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        jsonwebtoken::decode::<Value>(jws, &decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| anyhow::anyhow!("assertion verification failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ring() -> KeyRing {
        KeyRing::from_config("https://auth.test", None).unwrap()
    }

    #[tokio::test]
    async fn sign_verify_round_trip() {
        let ring = ring().await;
        let claims = json!({
            "iss": "https://auth.test",
            "sub": "user-1",
            "exp": Utc::now().timestamp() + 300,
        });
        let jws = ring.sign(&claims).await.unwrap();
        let verified = ring.verify(&jws, None, &[Algorithm::RS256]).await.unwrap();
        assert_eq!(verified["sub"], "user-1");
    }

    #[tokio::test]
    async fn verify_rejects_disallowed_alg() {
        let ring = ring().await;
        let claims = json!({"iss": "https://auth.test", "exp": Utc::now().timestamp() + 300});
        let jws = ring.sign(&claims).await.unwrap();
        assert!(ring.verify(&jws, None, &[Algorithm::ES256]).await.is_err());
    }

    #[tokio::test]
    async fn rotation_keeps_old_kid_verifiable() {
        let ring = ring().await;
        let claims = json!({"iss": "https://auth.test", "exp": Utc::now().timestamp() + 300});
        let old_jws = ring.sign(&claims).await.unwrap();
        let old_kid = ring.active_kid().await;

        let new_kid = ring.rotate().await.unwrap();
        assert_ne!(old_kid, new_kid);
        assert_eq!(ring.active_kid().await, new_kid);

        // Tokens signed before rotation still verify.
        assert!(ring.verify(&old_jws, None, &[Algorithm::RS256]).await.is_ok());

        let jwks = ring.public_jwks().await;
        let kids: Vec<&str> = jwks["keys"]
            .as_array()
            .unwrap()
            .iter()
            .map(|k| k["kid"].as_str().unwrap())
            .collect();
        assert!(kids.contains(&old_kid.as_str()));
        assert!(kids.contains(&new_kid.as_str()));
    }

    #[tokio::test]
    async fn key_bound_assertion_enforces_the_algorithm_allowlist() {
        use crate::app::services::dpop_service::test_support::ProofKey;
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

        // An ES256 assertion from the holder's key verifies.
        let holder = ProofKey::generate();
        let header = json!({"alg": "ES256", "typ": "JWT"});
        let claims = json!({"iss": "did:example:holder", "sub": "did:example:holder"});
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap()),
        );
        let jws = format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(holder.sign_raw(signing_input.as_bytes()))
        );

        let verified = KeyRing::verify_key_bound_assertion(&jws, &holder.jwk).unwrap();
        assert_eq!(verified["sub"], "did:example:holder");

        // An RS256 token is refused before any key work happens.
        let ring = KeyRing::from_config("https://auth.test", None).unwrap();
        let rs256 = ring
            .sign(&json!({
                "iss": "https://auth.test",
                "exp": Utc::now().timestamp() + 60,
            }))
            .await
            .unwrap();
        assert!(KeyRing::verify_key_bound_assertion(&rs256, &holder.jwk).is_err());
    }

    #[tokio::test]
    async fn retire_removes_published_key() {
        let ring = ring().await;
        let old_kid = ring.active_kid().await;
        ring.rotate().await.unwrap();
        assert!(ring.retire(&old_kid).await);

        let jwks = ring.public_jwks().await;
        assert!(jwks["keys"]
            .as_array()
            .unwrap()
            .iter()
            .all(|k| k["kid"].as_str() != Some(old_kid.as_str())));
    }
}
