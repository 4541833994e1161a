//! Transaction token claims, shared by issuance and verification.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::rules::AzdValue;

/// Value of the JWT `typ` header on every transaction token.
pub const TXN_TOKEN_TYP: &str = "txn_token";

/// Canonical subject identifier carried in `sub`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum SubjectIdentifier {
    Email { email: String },
    Opaque { id: String },
}

impl SubjectIdentifier {
    /// Build from the claim the subject was read from.
    pub fn from_claim(claim: &str, value: String) -> Self {
        if claim == "email" {
            SubjectIdentifier::Email { email: value }
        } else {
            SubjectIdentifier::Opaque { id: value }
        }
    }

    pub fn value(&self) -> &str {
        match self {
            SubjectIdentifier::Email { email } => email,
            SubjectIdentifier::Opaque { id } => id,
        }
    }
}

/// Claims of a transaction token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnTokenClaims {
    pub iss: String,
    pub aud: String,
    pub exp: u64,
    pub iat: u64,
    /// Random transaction id.
    pub txn: String,
    pub sub: SubjectIdentifier,
    pub purp: String,
    #[serde(default)]
    pub azd: BTreeMap<String, AzdValue>,
    #[serde(default)]
    pub rctx: Map<String, Value>,
}
