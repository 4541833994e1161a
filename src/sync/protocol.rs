//! Control channel wire format.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rules::{GenerationRule, GenerationRuleSet, ServiceConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Register,
    Heartbeat,
    Response,
    UpsertGenerationRule,
    DeleteGenerationRule,
    UpsertServiceConfig,
    Reconcile,
    GetRulesHash,
    GetRules,
}

/// Every frame on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responding_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// A new request with a fresh id.
    pub fn request<T: Serialize>(
        message_type: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type,
            responding_to: None,
            status: None,
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// A response correlated to `request_id`.
    pub fn response(request_id: &str, status: u16, payload: Option<Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: MessageType::Response,
            responding_to: Some(request_id.to_string()),
            status: Some(status),
            payload,
        }
    }

    /// Decode the payload; a missing payload decodes from `null`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone().unwrap_or(Value::Null))
    }

    pub fn is_success(&self) -> bool {
        self.status.map_or(false, |s| (200..300).contains(&s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub namespace: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub rules_hash: String,
}

/// Server answer to REGISTER.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub rule_set: GenerationRuleSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertRulePayload {
    pub rule: GenerationRule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRulePayload {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfigPayload {
    pub config: ServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetPayload {
    pub rule_set: GenerationRuleSet,
}
