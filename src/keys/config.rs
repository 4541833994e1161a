//! Signing key configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the signing key comes from and how long retired keys stay published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    /// PEM file holding an RSA private key (PKCS#8 or PKCS#1).
    /// A fresh key is generated when unset.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Key id to publish. Defaults to the RFC 7638 thumbprint.
    #[serde(default)]
    pub key_id: Option<String>,

    /// Modulus size for generated keys.
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,

    /// Seconds a rotated-out public key remains in the JWKS.
    #[serde(default = "default_rotation_grace")]
    pub rotation_grace_secs: u64,
}

fn default_key_bits() -> usize {
    2048
}

fn default_rotation_grace() -> u64 {
    300 // 5 minutes
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            private_key_path: None,
            key_id: None,
            key_bits: default_key_bits(),
            rotation_grace_secs: default_rotation_grace(),
        }
    }
}

impl KeyConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.private_key_path.is_none() && self.key_bits < 2048 {
            return Err(format!(
                "generated RSA keys must be at least 2048 bits, got {}",
                self.key_bits
            ));
        }
        if let Some(kid) = &self.key_id {
            if kid.trim().is_empty() {
                return Err("key id must not be empty".to_string());
            }
        }
        Ok(())
    }
}
