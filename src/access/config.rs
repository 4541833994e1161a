//! Access evaluation configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// External policy decision point settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEvaluationConfig {
    /// Enable access evaluation. When off every request is allowed.
    #[serde(default)]
    pub enabled: bool,

    /// Decision endpoint, called with POST.
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationConfig>,

    /// JSON template of the decision request; `${...}` strings are resolved.
    #[serde(default)]
    pub request_mapping: Value,
}

/// How to authenticate to the decision endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationConfig {
    pub method: AuthenticationMethod,
    pub token: TokenValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationMethod {
    Bearer,
}

/// A secret value; `${NAME}` reads environment variable `NAME`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenValue {
    pub value: String,
}

fn default_timeout() -> u64 {
    5000
}

impl Default for AccessEvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            timeout_ms: default_timeout(),
            authentication: None,
            request_mapping: Value::Null,
        }
    }
}

impl AccessEvaluationConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }

        if self.endpoint.is_empty() {
            return Err("access evaluation requires an endpoint".to_string());
        }

        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(format!(
                "access evaluation endpoint '{}' must be an http(s) URL",
                self.endpoint
            ));
        }

        match &self.request_mapping {
            Value::Object(map) if !map.is_empty() => {}
            _ => {
                return Err(
                    "access evaluation requires a non-empty requestMapping object".to_string(),
                )
            }
        }

        if let Some(auth) = &self.authentication {
            if auth.token.value.is_empty() {
                return Err("access evaluation token value must not be empty".to_string());
            }
        }

        Ok(())
    }
}
