use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub fn sha256_b64url(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Left-half hash used for `c_hash` / `at_hash` with SHA-256-based signing
/// algorithms: base64url of the left 128 bits of SHA-256(input).
fn left_half_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(&digest[..16])
}

pub fn c_hash(code: &str) -> String {
    left_half_sha256(code)
}

pub fn at_hash(access_token: &str) -> String {
    left_half_sha256(access_token)
}

/// RFC 7638 JWK thumbprint. The canonical form keeps only the required
/// members per key type; serde_json's map ordering is lexicographic, which is
/// exactly the canonical ordering the RFC asks for.
pub fn fingerprint_jwk(jwk: &Value) -> Result<String> {
    let kty = jwk
        .get("kty")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("JWK missing kty"))?;

    let canonical = match kty {
        "RSA" => json!({
            "e": required(jwk, "e")?,
            "kty": "RSA",
            "n": required(jwk, "n")?,
        }),
        "EC" => json!({
            "crv": required(jwk, "crv")?,
            "kty": "EC",
            "x": required(jwk, "x")?,
            "y": required(jwk, "y")?,
        }),
        "OKP" => json!({
            "crv": required(jwk, "crv")?,
            "kty": "OKP",
            "x": required(jwk, "x")?,
        }),
        other => return Err(anyhow::anyhow!("unsupported JWK key type: {}", other)),
    };

    let serialized = serde_json::to_string(&canonical)?;
    Ok(sha256_b64url(serialized.as_bytes()))
}

fn required<'a>(jwk: &'a Value, member: &str) -> Result<&'a str> {
    jwk.get(member)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("JWK missing {}", member))
}

/// Constant-time byte comparison for secret checks.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (byte_a, byte_b) in a.iter().zip(b.iter()) {
        result |= byte_a ^ byte_b;
    }
    result == 0
}
