use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::DecodingKey;
use serde_json::Value;

/// JWK to verification-key conversions shared by client-assertion, request
/// object, and DPoP proof validation.
pub fn decoding_key_from_jwk(jwk: &Value) -> Result<DecodingKey> {
    let kty = jwk
        .get("kty")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("JWK missing kty"))?;

    match kty {
        "RSA" => {
            let pem = rsa_public_pem_from_jwk(jwk)?;
            DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| anyhow::anyhow!("invalid RSA JWK: {}", e))
        }
        "EC" => {
            let pem = ec_public_pem_from_jwk(jwk)?;
            DecodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|e| anyhow::anyhow!("invalid EC JWK: {}", e))
        }
        other => Err(anyhow::anyhow!("unsupported JWK key type: {}", other)),
    }
}

pub fn rsa_public_pem_from_jwk(jwk: &Value) -> Result<String> {
    use rsa::pkcs8::EncodePublicKey;
    use rsa::{BigUint, RsaPublicKey};

    let n = member(jwk, "n")?;
    let e = member(jwk, "e")?;

    let n_bytes = URL_SAFE_NO_PAD
        .decode(n)
        .map_err(|_| anyhow::anyhow!("invalid RSA modulus encoding"))?;
    let e_bytes = URL_SAFE_NO_PAD
        .decode(e)
        .map_err(|_| anyhow::anyhow!("invalid RSA exponent encoding"))?;

    let key = RsaPublicKey::new(BigUint::from_bytes_be(&n_bytes), BigUint::from_bytes_be(&e_bytes))
        .map_err(|e| anyhow::anyhow!("failed to construct RSA public key: {}", e))?;

    key.to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| anyhow::anyhow!("failed to encode RSA key to PEM: {}", e))
}

pub fn ec_public_pem_from_jwk(jwk: &Value) -> Result<String> {
    use p256::elliptic_curve::sec1::FromEncodedPoint;
    use p256::pkcs8::EncodePublicKey;
    use p256::{EncodedPoint, PublicKey};

    let crv = member(jwk, "crv")?;
    if crv != "P-256" {
        return Err(anyhow::anyhow!("unsupported EC curve: {}", crv));
    }

    let x_bytes = URL_SAFE_NO_PAD
        .decode(member(jwk, "x")?)
        .map_err(|_| anyhow::anyhow!("invalid EC x coordinate encoding"))?;
    let y_bytes = URL_SAFE_NO_PAD
        .decode(member(jwk, "y")?)
        .map_err(|_| anyhow::anyhow!("invalid EC y coordinate encoding"))?;

    // Uncompressed SEC1 point: 0x04 || x || y.
    let mut point_bytes = vec![0x04];
    point_bytes.extend_from_slice(&x_bytes);
    point_bytes.extend_from_slice(&y_bytes);

    let encoded_point = EncodedPoint::from_bytes(&point_bytes)
        .map_err(|e| anyhow::anyhow!("invalid EC point: {}", e))?;
    let public_key = Option::<PublicKey>::from(PublicKey::from_encoded_point(&encoded_point))
        .ok_or_else(|| anyhow::anyhow!("point is not on the P-256 curve"))?;

    public_key
        .to_public_key_pem(p256::pkcs8::LineEnding::LF)
        .map_err(|e| anyhow::anyhow!("failed to encode EC key to PEM: {}", e))
}

/// First signature-capable key in a JWK set, optionally matched by kid.
pub fn select_key<'a>(jwks: &'a Value, kid: Option<&str>) -> Option<&'a Value> {
    let keys = jwks.get("keys")?.as_array()?;
    match kid {
        Some(kid) => keys
            .iter()
            .find(|k| k.get("kid").and_then(|v| v.as_str()) == Some(kid)),
        None => keys
            .iter()
            .find(|k| k.get("use").and_then(|v| v.as_str()) != Some("enc"))
            .or_else(|| keys.first()),
    }
}

fn member<'a>(jwk: &'a Value, name: &str) -> Result<&'a str> {
    jwk.get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("JWK missing {}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn select_key_prefers_kid_match() {
        let jwks = json!({"keys": [
            {"kid": "a", "kty": "RSA"},
            {"kid": "b", "kty": "RSA"},
        ]});
        let key = select_key(&jwks, Some("b")).unwrap();
        assert_eq!(key.get("kid").unwrap(), "b");
    }

    #[test]
    fn select_key_skips_encryption_keys_without_kid() {
        let jwks = json!({"keys": [
            {"kid": "enc", "kty": "RSA", "use": "enc"},
            {"kid": "sig", "kty": "RSA", "use": "sig"},
        ]});
        let key = select_key(&jwks, None).unwrap();
        assert_eq!(key.get("kid").unwrap(), "sig");
    }

    #[test]
    fn rejects_unknown_key_types() {
        let jwk = json!({"kty": "oct", "k": "c2VjcmV0"});
        assert!(decoding_key_from_jwk(&jwk).is_err());
    }
}
