//! Signing key ownership, token signing and JWKS publication.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::config::KeyConfig;
use crate::error::TratError;
use crate::jwks::{Jwk, Jwks};
use crate::token::TXN_TOKEN_TYP;

struct SigningKey {
    kid: String,
    encoding_key: EncodingKey,
    jwk: Jwk,
}

impl SigningKey {
    fn from_rsa(key: &RsaPrivateKey, kid: Option<String>) -> Result<Self> {
        let n = URL_SAFE_NO_PAD.encode(key.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(key.e().to_bytes_be());
        let kid = kid.unwrap_or_else(|| rsa_thumbprint(&n, &e));

        let der = key
            .to_pkcs1_der()
            .context("Failed to encode RSA private key")?;
        let encoding_key = EncodingKey::from_rsa_der(der.as_bytes());

        Ok(Self {
            jwk: Jwk::rsa(&kid, n, e),
            kid,
            encoding_key,
        })
    }
}

struct RetiredKey {
    jwk: Jwk,
    retired_at: Instant,
}

struct KeyState {
    active: Arc<SigningKey>,
    retired: Vec<RetiredKey>,
}

/// Owns the RS256 signing key and its published public half.
pub struct KeyManager {
    state: RwLock<KeyState>,
    grace_period: Duration,
}

impl KeyManager {
    /// Load the configured key, or generate one.
    pub fn load(config: &KeyConfig) -> Result<Self> {
        let key = match &config.private_key_path {
            Some(path) => read_private_key(path)?,
            None => {
                info!(bits = config.key_bits, "Generating RSA signing key");
                generate_rsa_key(config.key_bits)?
            }
        };
        Self::from_private_key(
            key,
            config.key_id.clone(),
            Duration::from_secs(config.rotation_grace_secs),
        )
    }

    /// Build from a PEM-encoded RSA private key.
    pub fn from_pem(pem: &str, kid: Option<String>, grace_period: Duration) -> Result<Self> {
        Self::from_private_key(parse_private_key(pem)?, kid, grace_period)
    }

    pub fn from_private_key(
        key: RsaPrivateKey,
        kid: Option<String>,
        grace_period: Duration,
    ) -> Result<Self> {
        let active = SigningKey::from_rsa(&key, kid)?;
        info!(kid = %active.kid, "Signing key installed");
        Ok(Self {
            state: RwLock::new(KeyState {
                active: Arc::new(active),
                retired: Vec::new(),
            }),
            grace_period,
        })
    }

    fn active(&self) -> Result<Arc<SigningKey>, TratError> {
        self.state
            .read()
            .map(|state| Arc::clone(&state.active))
            .map_err(|_| TratError::SigningFailure("key state lock poisoned".to_string()))
    }

    /// Id of the key new tokens are signed with.
    pub fn kid(&self) -> Result<String, TratError> {
        Ok(self.active()?.kid.clone())
    }

    /// Sign claims as a transaction token with the active key.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, TratError> {
        let key = self.active()?;

        let mut header = Header::new(Algorithm::RS256);
        header.typ = Some(TXN_TOKEN_TYP.to_string());
        header.kid = Some(key.kid.clone());

        encode(&header, claims, &key.encoding_key)
            .map_err(|e| TratError::SigningFailure(e.to_string()))
    }

    /// Active key plus retired keys still inside the grace window.
    pub fn public_jwks(&self) -> Result<Jwks> {
        let state = self
            .state
            .read()
            .map_err(|_| anyhow::anyhow!("key state lock poisoned"))?;

        let mut keys = vec![state.active.jwk.clone()];
        keys.extend(
            state
                .retired
                .iter()
                .filter(|r| r.retired_at.elapsed() < self.grace_period)
                .map(|r| r.jwk.clone()),
        );
        Ok(Jwks { keys })
    }

    /// Swap in a new signing key. The old public key stays published for
    /// the grace period so tokens already in flight still verify.
    pub fn rotate(&self, key: RsaPrivateKey, kid: Option<String>) -> Result<String> {
        let next = SigningKey::from_rsa(&key, kid)?;
        let new_kid = next.kid.clone();

        let mut state = self
            .state
            .write()
            .map_err(|_| anyhow::anyhow!("key state lock poisoned"))?;
        let previous = std::mem::replace(&mut state.active, Arc::new(next));
        let grace = self.grace_period;
        state.retired.retain(|r| r.retired_at.elapsed() < grace);
        state.retired.push(RetiredKey {
            jwk: previous.jwk.clone(),
            retired_at: Instant::now(),
        });

        info!(old_kid = %previous.kid, new_kid = %new_kid, "Signing key rotated");
        Ok(new_kid)
    }
}

/// Generate an RSA private key of the given size.
pub fn generate_rsa_key(bits: usize) -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut rand::rngs::OsRng, bits).context("Failed to generate RSA key")
}

fn read_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read signing key: {:?}", path))?;
    debug!(path = ?path, "Loaded signing key file");
    parse_private_key(&pem)
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    if pem.contains("BEGIN RSA PRIVATE KEY") {
        RsaPrivateKey::from_pkcs1_pem(pem).context("Failed to parse PKCS#1 RSA private key")
    } else {
        RsaPrivateKey::from_pkcs8_pem(pem).context("Failed to parse PKCS#8 RSA private key")
    }
}

/// RFC 7638 JWK thumbprint of an RSA public key.
fn rsa_thumbprint(n: &str, e: &str) -> String {
    let canonical = format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, e, n);
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwks::JwksCache;
    use crate::testing;
    use jsonwebtoken::{decode, decode_header, Validation};
    use serde_json::{json, Value};

    #[test]
    fn test_sign_embeds_kid_and_type() {
        let keys = testing::key_manager();
        let token = keys.sign(&json!({"purp": "x", "exp": 4_000_000_000u64})).unwrap();

        let header = decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.typ.as_deref(), Some(TXN_TOKEN_TYP));
        assert_eq!(header.kid.as_deref(), Some(testing::SIGNING_KID));
    }

    #[tokio::test]
    async fn test_signature_verifies_against_published_jwks() {
        let keys = testing::key_manager();
        let token = keys.sign(&json!({"purp": "x", "exp": 4_000_000_000u64})).unwrap();

        let cache = JwksCache::from_jwks(&keys.public_jwks().unwrap()).unwrap();
        let key = cache.get_key(testing::SIGNING_KID).await.unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.required_spec_claims.clear();
        let data = decode::<Value>(&token, &key.key, &validation).unwrap();
        assert_eq!(data.claims["purp"], "x");
    }

    #[test]
    fn test_thumbprint_kid_is_stable() {
        let a = KeyManager::from_pem(testing::SIGNING_KEY_PEM, None, Duration::ZERO).unwrap();
        let b = KeyManager::from_pem(testing::SIGNING_KEY_PEM, None, Duration::ZERO).unwrap();
        assert_eq!(a.kid().unwrap(), b.kid().unwrap());
        assert_eq!(a.kid().unwrap().len(), 43);
    }

    #[test]
    fn test_rotation_keeps_old_key_during_grace() {
        let keys = KeyManager::from_pem(
            testing::SIGNING_KEY_PEM,
            Some("old".to_string()),
            Duration::from_secs(60),
        )
        .unwrap();
        let new_kid = keys
            .rotate(testing::idp_rsa_key(), Some("new".to_string()))
            .unwrap();
        assert_eq!(new_kid, "new");
        assert_eq!(keys.kid().unwrap(), "new");

        let jwks = keys.public_jwks().unwrap();
        assert!(jwks.find("new").is_some());
        assert!(jwks.find("old").is_some());
    }

    #[test]
    fn test_rotation_without_grace_drops_old_key() {
        let keys = KeyManager::from_pem(
            testing::SIGNING_KEY_PEM,
            Some("old".to_string()),
            Duration::ZERO,
        )
        .unwrap();
        keys.rotate(testing::idp_rsa_key(), Some("new".to_string()))
            .unwrap();

        let jwks = keys.public_jwks().unwrap();
        assert_eq!(jwks.keys.len(), 1);
        assert!(jwks.find("old").is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, testing::SIGNING_KEY_PEM.as_bytes()).unwrap();

        let config = KeyConfig {
            private_key_path: Some(file.path().to_path_buf()),
            key_id: Some("file-key".to_string()),
            ..Default::default()
        };
        let keys = KeyManager::load(&config).unwrap();
        assert_eq!(keys.kid().unwrap(), "file-key");
    }

    #[test]
    fn test_invalid_pem_rejected() {
        assert!(KeyManager::from_pem("not a key", None, Duration::ZERO).is_err());
    }
}
