//! Self-signed workload JWTs.

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use std::time::Duration;
use tracing::{debug, warn};

use super::config::SelfSignedConfig;
use super::{map_jwt_error, map_jwks_error, subject_from_claims, Claims, SubjectTokenHandler};
use crate::error::{SubjectTokenError, TratError};
use crate::exchange::TokenType;
use crate::jwks::JwksCache;
use crate::token::SubjectIdentifier;

pub struct SelfSignedTokenHandler {
    config: SelfSignedConfig,
    /// `None` when signature validation is disabled.
    jwks: Option<JwksCache>,
    timeout: Duration,
}

impl SelfSignedTokenHandler {
    pub fn new(config: SelfSignedConfig, http_client: reqwest::Client) -> Self {
        let jwks = match (&config.jwks_endpoint, config.validation) {
            (Some(endpoint), true) => Some(JwksCache::remote(
                http_client,
                endpoint.clone(),
                Duration::from_secs(config.jwks_refresh_secs),
            )),
            _ => {
                warn!(
                    "Self-signed subject token signature validation is disabled; \
                     this is a security risk"
                );
                None
            }
        };

        Self {
            timeout: Duration::from_millis(config.request_timeout_ms),
            config,
            jwks,
        }
    }

    async fn verify(&self, jwks: &JwksCache, token: &str) -> Result<Claims, SubjectTokenError> {
        let header = decode_header(token)
            .map_err(|e| SubjectTokenError::Malformed(format!("invalid header: {}", e)))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| SubjectTokenError::Malformed("token has no key id".to_string()))?;

        let key = tokio::time::timeout(self.timeout, jwks.get_key(kid))
            .await
            .map_err(|_| SubjectTokenError::Unavailable("JWKS fetch timed out".to_string()))?
            .map_err(map_jwks_error)?;

        if !key.permits(header.alg) {
            return Err(SubjectTokenError::SignatureInvalid);
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.config.clock_skew_secs;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);

        decode::<Claims>(token, &key.key, &validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    fn parse_unverified(&self, token: &str) -> Result<Claims, SubjectTokenError> {
        warn!("Accepting self-signed subject token without signature validation");

        let mut validation = Validation::new(Algorithm::RS256);
        validation.insecure_disable_signature_validation();
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.leeway = self.config.clock_skew_secs;

        decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }
}

impl SubjectTokenHandler for SelfSignedTokenHandler {
    fn token_type(&self) -> TokenType {
        TokenType::SelfSigned
    }

    async fn verify_and_parse(&self, token: &str) -> Result<Claims, SubjectTokenError> {
        debug!(validation = self.jwks.is_some(), "Parsing self-signed subject token");
        match &self.jwks {
            Some(jwks) => self.verify(jwks, token).await,
            None => self.parse_unverified(token),
        }
    }

    fn extract_subject(&self, claims: &Claims) -> Result<SubjectIdentifier, TratError> {
        subject_from_claims(claims, &self.config.subject_field)
    }
}
