//! Token type URNs accepted and issued by the token endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Token exchange grant type (RFC 8693).
pub const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// `token_type` of issued transaction tokens; they are not access tokens.
pub const ISSUED_TOKEN_TYPE_NA: &str = "N_A";

/// Token type URNs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// OpenID Connect ID token.
    IdToken,
    /// JWT signed by the calling workload itself.
    SelfSigned,
    /// Transaction token.
    TxnToken,
}

impl TokenType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            TokenType::IdToken => "urn:ietf:params:oauth:token-type:id_token",
            TokenType::SelfSigned => "urn:ietf:params:oauth:token-type:self_signed",
            TokenType::TxnToken => "urn:ietf:params:oauth:token-type:txn_token",
        }
    }

    pub fn from_urn(urn: &str) -> Option<Self> {
        match urn {
            "urn:ietf:params:oauth:token-type:id_token" => Some(TokenType::IdToken),
            "urn:ietf:params:oauth:token-type:self_signed" => Some(TokenType::SelfSigned),
            "urn:ietf:params:oauth:token-type:txn_token" => Some(TokenType::TxnToken),
            _ => None,
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_urn())
    }
}
