//! OIDC ID token verification against a discovered provider.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{decode, decode_header, Validation};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::OidcConfig;
use super::{map_jwt_error, map_jwks_error, subject_from_claims, Claims, SubjectTokenHandler};
use crate::error::{SubjectTokenError, TratError};
use crate::exchange::TokenType;
use crate::jwks::JwksCache;
use crate::token::SubjectIdentifier;

/// Subset of the provider metadata we rely on.
#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    issuer: String,
    jwks_uri: String,
}

/// Verifies ID tokens issued by one OIDC provider.
pub struct OidcTokenHandler {
    config: OidcConfig,
    issuer: String,
    jwks: JwksCache,
    timeout: Duration,
}

impl OidcTokenHandler {
    /// Discover the provider, retrying with exponential backoff.
    pub async fn discover(config: OidcConfig, http_client: reqwest::Client) -> Result<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let mut delay = Duration::from_millis(config.discovery_backoff_ms);
        let mut attempt = 1;

        let metadata = loop {
            match fetch_metadata(&http_client, &config.provider_url, timeout).await {
                Ok(metadata) => break metadata,
                Err(e) if attempt < config.discovery_attempts => {
                    warn!(
                        provider = %config.provider_url,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "OIDC discovery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "OIDC discovery for {} failed after {} attempts",
                        config.provider_url, attempt
                    )))
                }
            }
        };

        if metadata.issuer.trim_end_matches('/') != config.provider_url.trim_end_matches('/') {
            return Err(anyhow!(
                "OIDC issuer '{}' does not match provider URL '{}'",
                metadata.issuer,
                config.provider_url
            ));
        }

        info!(issuer = %metadata.issuer, jwks_uri = %metadata.jwks_uri, "OIDC provider discovered");

        let jwks = JwksCache::remote(
            http_client,
            metadata.jwks_uri,
            Duration::from_secs(config.jwks_refresh_secs),
        );

        Ok(Self {
            issuer: metadata.issuer,
            config,
            jwks,
            timeout,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }
}

async fn fetch_metadata(
    http_client: &reqwest::Client,
    provider_url: &str,
    timeout: Duration,
) -> Result<ProviderMetadata> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        provider_url.trim_end_matches('/')
    );
    let response = http_client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .context("Failed to fetch OIDC discovery document")?;

    if !response.status().is_success() {
        return Err(anyhow!("Discovery endpoint returned status {}", response.status()));
    }

    response
        .json()
        .await
        .context("Failed to parse OIDC discovery document")
}

impl SubjectTokenHandler for OidcTokenHandler {
    fn token_type(&self) -> TokenType {
        TokenType::IdToken
    }

    async fn verify_and_parse(&self, token: &str) -> Result<Claims, SubjectTokenError> {
        let header = decode_header(token)
            .map_err(|e| SubjectTokenError::Malformed(format!("invalid header: {}", e)))?;

        debug!(kid = ?header.kid, alg = ?header.alg, "Validating OIDC token");

        let lookup = async {
            match header.kid.as_deref() {
                Some(kid) => self.jwks.get_key(kid).await,
                None => self.jwks.get_default_key().await,
            }
        };
        let key = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| SubjectTokenError::Unavailable("JWKS fetch timed out".to_string()))?
            .map_err(map_jwks_error)?;

        if !key.permits(header.alg) {
            return Err(SubjectTokenError::SignatureInvalid);
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.config.clock_skew_secs;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.config.client_id]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        decode::<Claims>(token, &key.key, &validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    fn extract_subject(&self, claims: &Claims) -> Result<SubjectIdentifier, TratError> {
        subject_from_claims(claims, &self.config.subject_field)
    }
}
