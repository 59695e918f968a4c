//! Attestation signatures (compact JWS) and JWK key material.
//!
//! The verifier is keyed by the JWK's curve: `EC`/`P-256` keys verify
//! `ES256`, `OKP`/`Ed25519` keys verify `EdDSA`. Issuing always uses P-256.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine};
use p256::ecdsa::signature::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{KeytraceError, KeytraceResult};

/// Signature algorithm implied by a key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Es256,
    EdDsa,
}

impl KeyAlgorithm {
    /// JOSE `alg` name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Es256 => "ES256",
            Self::EdDsa => "EdDSA",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A JSON Web Key, public or private.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

/// Public key material for attestation verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyMaterial {
    P256(p256::ecdsa::VerifyingKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl PublicKeyMaterial {
    /// Parse a public JWK serialized as a JSON string.
    pub fn from_jwk_str(jwk: &str) -> KeytraceResult<Self> {
        let jwk: Jwk = serde_json::from_str(jwk)
            .map_err(|e| KeytraceError::signature(format!("invalid public JWK: {e}")))?;
        Self::from_jwk(&jwk)
    }

    pub fn from_jwk(jwk: &Jwk) -> KeytraceResult<Self> {
        match (jwk.kty.as_str(), jwk.crv.as_str()) {
            ("EC", "P-256") => {
                let x = decode_coordinate(&jwk.x, "x")?;
                let y = decode_coordinate(
                    jwk.y
                        .as_deref()
                        .ok_or_else(|| KeytraceError::signature("EC JWK is missing y"))?,
                    "y",
                )?;
                let mut sec1 = Vec::with_capacity(65);
                sec1.push(0x04);
                sec1.extend(x);
                sec1.extend(y);
                p256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
                    .map(Self::P256)
                    .map_err(|_| KeytraceError::signature("invalid P-256 public key"))
            }
            ("OKP", "Ed25519") => {
                let x = decode_coordinate(&jwk.x, "x")?;
                ed25519_dalek::VerifyingKey::from_bytes(&x)
                    .map(Self::Ed25519)
                    .map_err(|_| KeytraceError::signature("invalid Ed25519 public key"))
            }
            (kty, crv) => Err(KeytraceError::signature(format!(
                "unsupported key type {kty}/{crv}"
            ))),
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::P256(_) => KeyAlgorithm::Es256,
            Self::Ed25519(_) => KeyAlgorithm::EdDsa,
        }
    }

    /// The public JWK.
    pub fn to_jwk(&self) -> Jwk {
        match self {
            Self::P256(key) => {
                let point = key.to_encoded_point(false);
                Jwk {
                    kty: "EC".to_string(),
                    crv: "P-256".to_string(),
                    x: point.x().map(|x| B64URL.encode(x)).unwrap_or_default(),
                    y: point.y().map(|y| B64URL.encode(y)),
                    d: None,
                }
            }
            Self::Ed25519(key) => Jwk {
                kty: "OKP".to_string(),
                crv: "Ed25519".to_string(),
                x: B64URL.encode(key.as_bytes()),
                y: None,
                d: None,
            },
        }
    }

    /// `sha256:<hex>` over the canonical public JWK.
    pub fn fingerprint(&self) -> KeytraceResult<String> {
        let jwk = serde_json::to_value(self.to_jwk())
            .map_err(|e| KeytraceError::signature(format!("JWK serialization failed: {e}")))?;
        let bytes = serde_jcs::to_vec(&jwk)
            .map_err(|e| KeytraceError::signature(format!("canonicalization failed: {e}")))?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> KeytraceResult<()> {
        match self {
            Self::P256(key) => {
                let sig = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| KeytraceError::signature("malformed ES256 signature"))?;
                key.verify(message, &sig)
                    .map_err(|_| KeytraceError::signature("signature does not match payload"))
            }
            Self::Ed25519(key) => {
                let sig = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|_| KeytraceError::signature("malformed EdDSA signature"))?;
                key.verify_strict(message, &sig)
                    .map_err(|_| KeytraceError::signature("signature does not match payload"))
            }
        }
    }
}

fn decode_coordinate(value: &str, name: &str) -> KeytraceResult<[u8; 32]> {
    let bytes = B64URL
        .decode(value)
        .map_err(|_| KeytraceError::signature(format!("JWK {name} is not base64url")))?;
    bytes
        .try_into()
        .map_err(|_| KeytraceError::signature(format!("JWK {name} must be 32 bytes")))
}

#[derive(Debug, Deserialize)]
struct JwsHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Verify a compact JWS attestation over `canonical`.
///
/// The decoded payload must equal `canonical` byte for byte and the header
/// `alg` must match the key. When both the header and `expected_kid` carry
/// a key id they must agree.
pub fn verify_attestation(
    attestation: &str,
    canonical: &[u8],
    key: &PublicKeyMaterial,
    expected_kid: Option<&str>,
) -> KeytraceResult<()> {
    let mut parts = attestation.split('.');
    let (header_b64, payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) => (h, p, s),
        _ => return Err(KeytraceError::signature("attestation is not a compact JWS")),
    };

    let header_bytes = B64URL
        .decode(header_b64)
        .map_err(|_| KeytraceError::signature("JWS header is not base64url"))?;
    let header: JwsHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| KeytraceError::signature(format!("invalid JWS header: {e}")))?;

    if header.alg != key.algorithm().as_str() {
        return Err(KeytraceError::signature(format!(
            "algorithm {} does not match {} key",
            header.alg,
            key.algorithm()
        )));
    }
    if let (Some(found), Some(expected)) = (header.kid.as_deref(), expected_kid) {
        if found != expected {
            return Err(KeytraceError::signature(format!(
                "JWS kid {found} does not match {expected}"
            )));
        }
    }

    let payload = B64URL
        .decode(payload_b64)
        .map_err(|_| KeytraceError::signature("JWS payload is not base64url"))?;
    if payload != canonical {
        return Err(KeytraceError::signature("payload does not match claim data"));
    }

    let signature = B64URL
        .decode(sig_b64)
        .map_err(|_| KeytraceError::signature("JWS signature is not base64url"))?;

    let signing_input = format!("{header_b64}.{payload_b64}");
    key.verify(signing_input.as_bytes(), &signature)
}

/// Sign `canonical` as an ES256 compact JWS.
pub fn sign_attestation(key: &p256::ecdsa::SigningKey, kid: &str, canonical: &[u8]) -> String {
    let header = json!({ "alg": KeyAlgorithm::Es256.as_str(), "kid": kid, "typ": "JWT" });
    let header_b64 = B64URL.encode(header.to_string());
    let payload_b64 = B64URL.encode(canonical);
    let signing_input = format!("{header_b64}.{payload_b64}");

    let signature: p256::ecdsa::Signature = key.sign(signing_input.as_bytes());
    format!("{signing_input}.{}", B64URL.encode(signature.to_bytes()))
}

/// Private JWK for a P-256 signing key.
pub fn signing_key_to_jwk(key: &p256::ecdsa::SigningKey) -> Jwk {
    let mut jwk = PublicKeyMaterial::P256(*key.verifying_key()).to_jwk();
    jwk.d = Some(B64URL.encode(key.to_bytes()));
    jwk
}

/// P-256 signing key from a private JWK.
pub fn signing_key_from_jwk(jwk: &Jwk) -> KeytraceResult<p256::ecdsa::SigningKey> {
    if jwk.kty != "EC" || jwk.crv != "P-256" {
        return Err(KeytraceError::signature(format!(
            "signing keys must be EC/P-256, got {}/{}",
            jwk.kty, jwk.crv
        )));
    }
    let d = jwk
        .d
        .as_deref()
        .ok_or_else(|| KeytraceError::signature("private JWK is missing d"))?;
    let d = decode_coordinate(d, "d")?;
    p256::ecdsa::SigningKey::from_slice(&d)
        .map_err(|_| KeytraceError::signature("invalid P-256 private key"))
}

/// Parse any JSON value as a JWK.
pub fn jwk_from_value(value: &Value) -> KeytraceResult<Jwk> {
    serde_json::from_value(value.clone())
        .map_err(|e| KeytraceError::signature(format!("invalid JWK: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Signer as _;

    fn p256_key() -> p256::ecdsa::SigningKey {
        p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng)
    }

    fn public_of(key: &p256::ecdsa::SigningKey) -> PublicKeyMaterial {
        PublicKeyMaterial::P256(*key.verifying_key())
    }

    #[test]
    fn test_es256_sign_and_verify() {
        let key = p256_key();
        let payload = br#"{"did":"did:plc:alice"}"#;
        let jws = sign_attestation(&key, "2026-01-15", payload);

        verify_attestation(&jws, payload, &public_of(&key), Some("2026-01-15")).unwrap();
    }

    #[test]
    fn test_payload_mismatch_fails() {
        let key = p256_key();
        let jws = sign_attestation(&key, "2026-01-15", br#"{"did":"did:plc:alice"}"#);
        let err = verify_attestation(&jws, br#"{"did":"did:plc:mallory"}"#, &public_of(&key), None)
            .unwrap_err();
        assert!(matches!(err, KeytraceError::SignatureInvalid { .. }));
    }

    #[test]
    fn test_wrong_key_fails() {
        let payload = b"{}";
        let jws = sign_attestation(&p256_key(), "k", payload);
        assert!(verify_attestation(&jws, payload, &public_of(&p256_key()), None).is_err());
    }

    #[test]
    fn test_tampered_signature_fails() {
        let key = p256_key();
        let payload = b"{}";
        let mut jws = sign_attestation(&key, "k", payload);
        let last = jws.pop().unwrap();
        jws.push(if last == 'A' { 'B' } else { 'A' });
        assert!(verify_attestation(&jws, payload, &public_of(&key), None).is_err());
    }

    #[test]
    fn test_kid_mismatch_fails() {
        let key = p256_key();
        let jws = sign_attestation(&key, "2026-01-15", b"{}");
        assert!(verify_attestation(&jws, b"{}", &public_of(&key), Some("2026-01-16")).is_err());
    }

    #[test]
    fn test_not_compact_jws() {
        let key = public_of(&p256_key());
        for bad in ["", "a.b", "a.b.c.d", "!!.b.c"] {
            assert!(verify_attestation(bad, b"{}", &key, None).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_jwk_round_trip() {
        let key = p256_key();
        let jwk = signing_key_to_jwk(&key);
        assert!(jwk.d.is_some());

        let restored = signing_key_from_jwk(&jwk).unwrap();
        assert_eq!(restored.to_bytes(), key.to_bytes());

        let public_json = serde_json::to_string(&public_of(&key).to_jwk()).unwrap();
        assert!(!public_json.contains("\"d\""));
        assert_eq!(PublicKeyMaterial::from_jwk_str(&public_json).unwrap(), public_of(&key));
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = public_of(&p256_key()).fingerprint().unwrap();
        assert!(fp.starts_with("sha256:"));
        assert_eq!(fp.len(), 7 + 64);
    }

    #[test]
    fn test_eddsa_verification() {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let public = PublicKeyMaterial::Ed25519(signing.verifying_key());
        let jwk = serde_json::to_string(&public.to_jwk()).unwrap();
        let key = PublicKeyMaterial::from_jwk_str(&jwk).unwrap();
        assert_eq!(key.algorithm(), KeyAlgorithm::EdDsa);

        let payload = br#"{"subject":"alice"}"#;
        let header_b64 = B64URL.encode(r#"{"alg":"EdDSA"}"#);
        let payload_b64 = B64URL.encode(payload);
        let input = format!("{header_b64}.{payload_b64}");
        let sig = signing.sign(input.as_bytes());
        let jws = format!("{input}.{}", B64URL.encode(sig.to_bytes()));

        verify_attestation(&jws, payload, &key, None).unwrap();

        // an ES256 header on an Ed25519 key is rejected
        let es_header = B64URL.encode(r#"{"alg":"ES256"}"#);
        let forged = format!("{es_header}.{payload_b64}.{}", B64URL.encode(sig.to_bytes()));
        assert!(verify_attestation(&forged, payload, &key, None).is_err());
    }

    #[test]
    fn test_unsupported_key_type() {
        let err = PublicKeyMaterial::from_jwk_str(r#"{"kty":"RSA","crv":"","x":""}"#).unwrap_err();
        assert!(err.to_string().contains("unsupported key type"));
    }
}
