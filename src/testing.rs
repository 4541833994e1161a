//! Fixtures shared by unit tests.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::jwks::{Jwk, Jwks};
use crate::keys::KeyManager;

pub const SIGNING_KEY_PEM: &str = include_str!("../tests/fixtures/signing_key.pem");
pub const IDP_KEY_PEM: &str = include_str!("../tests/fixtures/idp_key.pem");
pub const SIGNING_KID: &str = "test-signing-key";
pub const IDP_KID: &str = "idp-key-1";

pub fn key_manager() -> KeyManager {
    KeyManager::from_pem(
        SIGNING_KEY_PEM,
        Some(SIGNING_KID.to_string()),
        Duration::from_secs(60),
    )
    .unwrap()
}

pub fn idp_rsa_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(IDP_KEY_PEM).unwrap()
}

/// Public JWKS of the identity-provider test key.
pub fn idp_jwks() -> Jwks {
    let key = idp_rsa_key();
    Jwks {
        keys: vec![Jwk::rsa(
            IDP_KID,
            URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
            URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        )],
    }
}

/// RS256 JWT signed by the identity-provider test key.
pub fn sign_idp_token(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(IDP_KID.to_string());
    let key = EncodingKey::from_rsa_pem(IDP_KEY_PEM.as_bytes()).unwrap();
    encode(&header, claims, &key).unwrap()
}

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Claims of a valid ID token from `issuer` for `client_id`.
pub fn id_token_claims(issuer: &str, client_id: &str, email: &str) -> Value {
    json!({
        "iss": issuer,
        "aud": client_id,
        "sub": "user-123",
        "email": email,
        "iat": now(),
        "exp": now() + 300
    })
}
