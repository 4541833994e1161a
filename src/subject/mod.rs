//! Subject credential verification.
//!
//! Supports:
//! - OIDC ID tokens, verified against a discovered provider
//! - Self-signed workload JWTs, optionally verified against a JWKS

pub mod config;
pub mod oidc;
pub mod self_signed;

use anyhow::Result;
use jsonwebtoken::errors::ErrorKind;
use serde_json::{Map, Value};
use std::future::Future;

pub use config::{OidcConfig, SelfSignedConfig, SubjectTokensConfig};
pub use oidc::OidcTokenHandler;
pub use self_signed::SelfSignedTokenHandler;

use crate::error::{SubjectTokenError, TratError};
use crate::exchange::TokenType;
use crate::jwks::JwksError;
use crate::token::SubjectIdentifier;

/// Verified claims of a subject credential.
pub type Claims = Map<String, Value>;

/// One kind of subject credential.
pub trait SubjectTokenHandler {
    fn token_type(&self) -> TokenType;

    /// Verify the credential and return its claims.
    fn verify_and_parse(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<Claims, SubjectTokenError>> + Send;

    /// Canonical subject identifier from verified claims.
    fn extract_subject(&self, claims: &Claims) -> Result<SubjectIdentifier, TratError>;
}

/// The handler selected for a request.
pub enum SubjectHandler<'a> {
    Oidc(&'a OidcTokenHandler),
    SelfSigned(&'a SelfSignedTokenHandler),
}

impl SubjectTokenHandler for SubjectHandler<'_> {
    fn token_type(&self) -> TokenType {
        match self {
            SubjectHandler::Oidc(h) => h.token_type(),
            SubjectHandler::SelfSigned(h) => h.token_type(),
        }
    }

    async fn verify_and_parse(&self, token: &str) -> Result<Claims, SubjectTokenError> {
        match self {
            SubjectHandler::Oidc(h) => h.verify_and_parse(token).await,
            SubjectHandler::SelfSigned(h) => h.verify_and_parse(token).await,
        }
    }

    fn extract_subject(&self, claims: &Claims) -> Result<SubjectIdentifier, TratError> {
        match self {
            SubjectHandler::Oidc(h) => h.extract_subject(claims),
            SubjectHandler::SelfSigned(h) => h.extract_subject(claims),
        }
    }
}

/// Handlers built from the current [`SubjectTokensConfig`].
#[derive(Default)]
pub struct SubjectTokenHandlers {
    oidc: Option<OidcTokenHandler>,
    self_signed: Option<SelfSignedTokenHandler>,
}

impl SubjectTokenHandlers {
    /// Build every configured handler. OIDC discovery happens here.
    pub async fn build(
        config: &SubjectTokensConfig,
        http_client: &reqwest::Client,
    ) -> Result<Self> {
        let oidc = match &config.oidc {
            Some(oidc) => {
                Some(OidcTokenHandler::discover(oidc.clone(), http_client.clone()).await?)
            }
            None => None,
        };
        let self_signed = config
            .self_signed
            .as_ref()
            .map(|c| SelfSignedTokenHandler::new(c.clone(), http_client.clone()));

        Ok(Self { oidc, self_signed })
    }

    /// Handler for a caller-declared subject token type.
    pub fn select(&self, token_type: TokenType) -> Result<SubjectHandler<'_>, TratError> {
        let handler = match token_type {
            TokenType::IdToken => self.oidc.as_ref().map(SubjectHandler::Oidc),
            TokenType::SelfSigned => self.self_signed.as_ref().map(SubjectHandler::SelfSigned),
            TokenType::TxnToken => None,
        };
        handler.ok_or_else(|| TratError::UnsupportedTokenType(token_type.as_urn().to_string()))
    }
}

/// Read the subject from `field`, accepting strings and numbers.
pub(crate) fn subject_from_claims(
    claims: &Claims,
    field: &str,
) -> Result<SubjectIdentifier, TratError> {
    let value = match claims.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(TratError::SubjectFieldMissing(field.to_string())),
    };
    Ok(SubjectIdentifier::from_claim(field, value))
}

pub(crate) fn map_jwt_error(err: jsonwebtoken::errors::Error) -> SubjectTokenError {
    match err.kind() {
        ErrorKind::ExpiredSignature => SubjectTokenError::Expired,
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
            SubjectTokenError::SignatureInvalid
        }
        _ => SubjectTokenError::Malformed(err.to_string()),
    }
}

pub(crate) fn map_jwks_error(err: JwksError) -> SubjectTokenError {
    match err {
        JwksError::KeyNotFound(_) => SubjectTokenError::SignatureInvalid,
        other => SubjectTokenError::Unavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unconfigured_type_is_unsupported() {
        let handlers = SubjectTokenHandlers::default();
        assert!(matches!(
            handlers.select(TokenType::IdToken),
            Err(TratError::UnsupportedTokenType(_))
        ));

        let config = SubjectTokensConfig {
            oidc: None,
            self_signed: Some(SelfSignedConfig {
                validation: false,
                ..Default::default()
            }),
        };
        let handlers = SubjectTokenHandlers::build(&config, &reqwest::Client::new())
            .await
            .unwrap();
        assert!(handlers.select(TokenType::SelfSigned).is_ok());
        assert!(handlers.select(TokenType::IdToken).is_err());
        assert!(handlers.select(TokenType::TxnToken).is_err());
    }

    #[test]
    fn test_subject_from_claims() {
        let claims: Claims = serde_json::from_value(json!({
            "sub": "u-1",
            "email": "a@b.c",
            "uid": 42,
            "blank": ""
        }))
        .unwrap();

        assert_eq!(
            subject_from_claims(&claims, "email").unwrap(),
            SubjectIdentifier::Email {
                email: "a@b.c".to_string()
            }
        );
        assert_eq!(subject_from_claims(&claims, "uid").unwrap().value(), "42");
        assert!(subject_from_claims(&claims, "blank").is_err());
        assert!(subject_from_claims(&claims, "nope").is_err());
    }
}
