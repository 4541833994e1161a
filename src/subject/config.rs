//! Subject credential configuration.

use serde::{Deserialize, Serialize};

/// Which subject credential kinds the service accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectTokensConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signed: Option<SelfSignedConfig>,
}

impl SubjectTokensConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(oidc) = &self.oidc {
            oidc.validate()?;
        }
        if let Some(self_signed) = &self.self_signed {
            self_signed.validate()?;
        }
        Ok(())
    }
}

/// OpenID Connect ID token verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcConfig {
    /// Expected audience (aud claim).
    pub client_id: String,

    /// Issuer URL; discovery is read from `/.well-known/openid-configuration`.
    pub provider_url: String,

    /// Claim holding the subject. Defaults to "sub".
    #[serde(default = "default_subject_field")]
    pub subject_field: String,

    /// JWKS cache refresh interval in seconds.
    #[serde(default = "default_jwks_refresh")]
    pub jwks_refresh_secs: u64,

    /// Clock skew tolerance in seconds for exp/nbf validation.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Discovery attempts before giving up.
    #[serde(default = "default_discovery_attempts")]
    pub discovery_attempts: u32,

    /// Delay before the first discovery retry; doubles on each retry.
    #[serde(default = "default_discovery_backoff")]
    pub discovery_backoff_ms: u64,

    /// Per-request timeout for discovery and JWKS calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

/// Self-signed workload JWT verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfSignedConfig {
    /// Verify signatures. Turning this off accepts any well-formed JWT.
    #[serde(default = "default_validation")]
    pub validation: bool,

    /// JWKS used to verify signatures. Required when validation is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_endpoint: Option<String>,

    /// Claim holding the subject. Defaults to "sub".
    #[serde(default = "default_subject_field")]
    pub subject_field: String,

    #[serde(default = "default_jwks_refresh")]
    pub jwks_refresh_secs: u64,

    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_subject_field() -> String {
    "sub".to_string()
}

fn default_jwks_refresh() -> u64 {
    3600 // 1 hour
}

fn default_clock_skew() -> u64 {
    30
}

fn default_discovery_attempts() -> u32 {
    5
}

fn default_discovery_backoff() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_validation() -> bool {
    true
}

impl OidcConfig {
    pub fn new(client_id: &str, provider_url: &str, subject_field: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            provider_url: provider_url.to_string(),
            subject_field: subject_field.to_string(),
            jwks_refresh_secs: default_jwks_refresh(),
            clock_skew_secs: default_clock_skew(),
            discovery_attempts: default_discovery_attempts(),
            discovery_backoff_ms: default_discovery_backoff(),
            request_timeout_ms: default_request_timeout(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.client_id.is_empty() {
            return Err("oidc.clientId is required".to_string());
        }
        if self.provider_url.is_empty() {
            return Err("oidc.providerUrl is required".to_string());
        }
        if self.subject_field.is_empty() {
            return Err("oidc.subjectField must not be empty".to_string());
        }
        if self.discovery_attempts == 0 {
            return Err("oidc.discoveryAttempts must be at least 1".to_string());
        }
        Ok(())
    }
}

impl Default for SelfSignedConfig {
    fn default() -> Self {
        Self {
            validation: default_validation(),
            jwks_endpoint: None,
            subject_field: default_subject_field(),
            jwks_refresh_secs: default_jwks_refresh(),
            clock_skew_secs: default_clock_skew(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl SelfSignedConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.validation && self.jwks_endpoint.as_deref().map_or(true, str::is_empty) {
            return Err(
                "selfSigned.jwksEndpoint is required when validation is enabled".to_string(),
            );
        }
        if self.subject_field.is_empty() {
            return Err("selfSigned.subjectField must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_oidc_defaults() {
        let config: OidcConfig = serde_json::from_value(json!({
            "clientId": "stocks-app",
            "providerUrl": "https://idp.example.com"
        }))
        .unwrap();
        assert_eq!(config.subject_field, "sub");
        assert_eq!(config.discovery_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_self_signed_requires_jwks_when_validating() {
        let config = SelfSignedConfig::default();
        assert!(config.validate().is_err());

        let config = SelfSignedConfig {
            validation: false,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = SelfSignedConfig {
            jwks_endpoint: Some("https://workload.example.com/jwks".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
