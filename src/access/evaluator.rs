//! Calls the external policy decision point.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::AccessEvaluationConfig;
use crate::error::TratError;
use crate::exchange::RequestDetails;
use crate::rules::{resolve_template, AzdValue};
use crate::subject::Claims;

/// Everything a decision request may reference.
pub struct AccessRequest<'a> {
    pub subject_claims: &'a Claims,
    pub purpose: &'a str,
    pub azd: &'a BTreeMap<String, AzdValue>,
    pub details: &'a RequestDetails,
    pub context: &'a Map<String, Value>,
    pub path_params: &'a BTreeMap<String, String>,
    /// Rule-specific mapping that replaces the configured one.
    pub mapping_override: Option<&'a Value>,
}

impl AccessRequest<'_> {
    /// Input document the request mapping is resolved against.
    pub fn input_document(&self) -> Result<Value, serde_json::Error> {
        let mut doc = Map::new();
        for (name, value) in self.path_params {
            doc.insert(name.clone(), Value::String(value.clone()));
        }
        doc.insert(
            "subject_token".to_string(),
            Value::Object(self.subject_claims.clone()),
        );
        doc.insert("purp".to_string(), Value::String(self.purpose.to_string()));
        doc.insert("azd".to_string(), serde_json::to_value(self.azd)?);
        doc.insert("body".to_string(), self.details.body.clone());
        doc.insert("headers".to_string(), self.details.headers.clone());
        doc.insert(
            "queryParameters".to_string(),
            self.details.query_parameters.clone(),
        );
        doc.insert(
            "request_details".to_string(),
            serde_json::to_value(self.details)?,
        );
        doc.insert(
            "request_context".to_string(),
            Value::Object(self.context.clone()),
        );
        Ok(Value::Object(doc))
    }
}

#[derive(Debug, Deserialize)]
struct Decision {
    decision: bool,
}

struct Endpoint {
    url: String,
    bearer_token: Option<String>,
    request_mapping: Value,
    timeout: Duration,
    http_client: reqwest::Client,
}

/// Access evaluator; a disabled evaluator allows everything.
pub struct AccessEvaluator {
    endpoint: Option<Endpoint>,
}

impl AccessEvaluator {
    pub fn disabled() -> Self {
        Self { endpoint: None }
    }

    /// Build from configuration, resolving `${ENV}` token indirection once.
    pub fn new(config: &AccessEvaluationConfig, http_client: reqwest::Client) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }

        config.validate().map_err(|e| anyhow!(e))?;

        let bearer_token = match &config.authentication {
            Some(auth) => Some(resolve_env_reference(&auth.token.value)?),
            None => None,
        };

        info!(
            endpoint = %config.endpoint,
            authenticated = bearer_token.is_some(),
            "Access evaluation enabled"
        );

        Ok(Self {
            endpoint: Some(Endpoint {
                url: config.endpoint.clone(),
                bearer_token,
                request_mapping: config.request_mapping.clone(),
                timeout: Duration::from_millis(config.timeout_ms),
                http_client,
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// `Ok(())` on an explicit allow, `AccessDenied` on an explicit deny.
    /// Transport and decoding failures are `UpstreamUnavailable`.
    pub async fn evaluate(&self, request: &AccessRequest<'_>) -> Result<(), TratError> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(());
        };

        let doc = request
            .input_document()
            .map_err(|e| TratError::Misconfigured(format!("access evaluation input: {}", e)))?;
        let mapping = request
            .mapping_override
            .unwrap_or(&endpoint.request_mapping);
        let payload = resolve_template(mapping, &doc)
            .map_err(|e| TratError::Misconfigured(format!("access evaluation mapping: {}", e)))?;

        let mut call = endpoint
            .http_client
            .post(&endpoint.url)
            .timeout(endpoint.timeout)
            .json(&payload);
        if let Some(token) = &endpoint.bearer_token {
            call = call.bearer_auth(token);
        }

        let response = call.send().await.map_err(|e| {
            warn!(error = %e, "Access evaluation request failed");
            TratError::UpstreamUnavailable(format!("access evaluation request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Access evaluation endpoint returned an error");
            return Err(TratError::UpstreamUnavailable(format!(
                "access evaluation returned status {}",
                status
            )));
        }

        let decision: Decision = response.json().await.map_err(|e| {
            TratError::UpstreamUnavailable(format!("access evaluation response undecodable: {}", e))
        })?;

        debug!(purpose = %request.purpose, decision = decision.decision, "Access evaluated");

        if decision.decision {
            Ok(())
        } else {
            Err(TratError::AccessDenied)
        }
    }
}

/// Resolve `${NAME}` from the environment; other values pass through.
fn resolve_env_reference(value: &str) -> Result<String> {
    match value.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        Some(name) if !name.is_empty() => std::env::var(name)
            .with_context(|| format!("Environment variable {} not set", name)),
        _ => Ok(value.to_string()),
    }
}
