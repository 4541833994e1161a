//! Service-level configuration pushed alongside the generation rules.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::access::AccessEvaluationConfig;
use crate::subject::SubjectTokensConfig;

/// Token, credential, access-evaluation and caller settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Issuance settings. Issuance is refused until these are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenSettings>,

    #[serde(default)]
    pub subject_tokens: SubjectTokensConfig,

    #[serde(default)]
    pub access_evaluation: AccessEvaluationConfig,

    /// Caller identities allowed to request tokens. Empty means unrestricted.
    #[serde(default)]
    pub authorized_callers: Vec<String>,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(token) = &self.token {
            token.validate()?;
        }
        self.subject_tokens.validate()?;
        self.access_evaluation.validate()?;
        if self.authorized_callers.iter().any(|c| c.trim().is_empty()) {
            return Err("authorized callers must not contain empty entries".to_string());
        }
        Ok(())
    }
}

/// Claims every issued token carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSettings {
    pub issuer: String,
    pub audience: String,
    /// Lifetime such as "15s", "5m" or "1h30m".
    #[serde(default = "default_lifetime")]
    pub lifetime: String,
}

fn default_lifetime() -> String {
    "15s".to_string()
}

impl TokenSettings {
    /// Parsed lifetime. Accepts humantime forms such as "250ms" or "1h 30m".
    pub fn lifetime(&self) -> Result<Duration, String> {
        humantime::parse_duration(self.lifetime.trim())
            .map_err(|e| format!("invalid token lifetime '{}': {}", self.lifetime, e))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.issuer.trim().is_empty() {
            return Err("token issuer must not be empty".to_string());
        }
        if self.audience.trim().is_empty() {
            return Err("token audience must not be empty".to_string());
        }
        if self.lifetime()?.is_zero() {
            return Err(format!("token lifetime '{}' must be positive", self.lifetime));
        }
        Ok(())
    }
}
