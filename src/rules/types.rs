//! Generation rules and the rule-set aggregate.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::config::ServiceConfig;

/// HTTP verbs a generation rule can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(format!("unsupported HTTP method '{}'", other)),
        }
    }
}

/// One authorization-context field: a literal or a `${...}` expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AzdField {
    #[serde(default)]
    pub required: bool,
    pub value: String,
}

impl AzdField {
    pub fn required(value: &str) -> Self {
        Self {
            required: true,
            value: value.to_string(),
        }
    }

    pub fn optional(value: &str) -> Self {
        Self {
            required: false,
            value: value.to_string(),
        }
    }
}

/// Maps one API operation to a purpose and an authorization context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRule {
    pub name: String,
    pub method: HttpMethod,
    /// Path template, e.g. `/api/order/{#id}`.
    pub path: String,
    pub purpose: String,
    #[serde(default)]
    pub azd_mapping: BTreeMap<String, AzdField>,
    /// Overrides the service-level access-evaluation request mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_evaluation: Option<Value>,
}

impl GenerationRule {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("rule name must not be empty".to_string());
        }
        if self.purpose.trim().is_empty() {
            return Err(format!("rule '{}' has an empty purpose", self.name));
        }
        for (field, spec) in &self.azd_mapping {
            if field.is_empty() {
                return Err(format!("rule '{}' has an unnamed azd field", self.name));
            }
            if spec.value.is_empty() {
                return Err(format!(
                    "rule '{}' field '{}' has an empty value",
                    self.name, field
                ));
            }
        }
        if let Some(mapping) = &self.access_evaluation {
            if !mapping.is_object() {
                return Err(format!(
                    "rule '{}' access evaluation mapping must be an object",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

/// Everything the control plane owns for one namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRuleSet {
    #[serde(default)]
    pub service_config: ServiceConfig,
    #[serde(default)]
    pub generation_rules: BTreeMap<String, GenerationRule>,
}

impl GenerationRuleSet {
    /// Read a rule set from a YAML or JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule set {}", path.display()))?;
        let rule_set: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse rule set {}", path.display()))?;
        rule_set
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid rule set {}: {}", path.display(), e))?;
        Ok(rule_set)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.service_config.validate()?;
        for (name, rule) in &self.generation_rules {
            if name != &rule.name {
                return Err(format!(
                    "rule keyed '{}' declares name '{}'",
                    name, rule.name
                ));
            }
            rule.validate()?;
        }
        Ok(())
    }

    /// Hex SHA-256 over the compact JSON form. `serde_json::Map` keeps
    /// object keys sorted, so free-form sections hash the same whatever
    /// order they arrived in.
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json::to_vec(&serde_json::to_value(self)?)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trade_rule() -> GenerationRule {
        serde_json::from_value(json!({
            "name": "stocks-trade",
            "method": "POST",
            "path": "/api/order",
            "purpose": "StocksTrade",
            "azdMapping": {
                "action": {"required": true, "value": "${body.orderType}"},
                "stockID": {"required": true, "value": "${body.stockID}"},
                "quantity": {"required": true, "value": "${body.quantity}"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_rule_deserialization() {
        let rule = trade_rule();
        assert_eq!(rule.method, HttpMethod::Post);
        assert_eq!(rule.azd_mapping.len(), 3);
        assert!(rule.azd_mapping["action"].required);
        assert!(rule.access_evaluation.is_none());
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("patch".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert!("TRACE".parse::<HttpMethod>().is_err());
        assert!(serde_json::from_value::<HttpMethod>(json!("get")).is_err());
    }

    #[test]
    fn test_rule_validation() {
        let mut rule = trade_rule();
        rule.purpose = " ".to_string();
        assert!(rule.validate().is_err());

        let mut rule = trade_rule();
        rule.access_evaluation = Some(json!("nope"));
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_rule_set_key_must_match_name() {
        let mut set = GenerationRuleSet::default();
        set.generation_rules.insert("other".to_string(), trade_rule());
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_content_hash_is_canonical() {
        let mut a = GenerationRuleSet::default();
        a.generation_rules.insert("stocks-trade".to_string(), trade_rule());
        let b = a.clone();
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
        assert_eq!(a.content_hash().unwrap().len(), 64);

        let mut c = a.clone();
        c.generation_rules
            .get_mut("stocks-trade")
            .unwrap()
            .purpose = "Other".to_string();
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }

    #[test]
    fn test_rule_set_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"
serviceConfig:
  token:
    issuer: https://txn.example.com
    audience: stocks.example.com
    lifetime: 30s
generationRules:
  stock-details:
    name: stock-details
    method: GET
    path: /api/stocks/{#id}
    purpose: StockDetails
    azdMapping:
      stockID: { required: true, value: "${id}" }
"#,
        )
        .unwrap();

        let set = GenerationRuleSet::from_file(file.path()).unwrap();
        assert_eq!(set.generation_rules["stock-details"].purpose, "StockDetails");
        assert!(set.service_config.token.is_some());

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        let mismatched_name =
            b"generationRules:\n  a:\n    name: b\n    method: GET\n    path: /x\n    purpose: X\n";
        std::io::Write::write_all(&mut bad, mismatched_name).unwrap();
        assert!(GenerationRuleSet::from_file(bad.path()).is_err());
        assert!(GenerationRuleSet::from_file(Path::new("/nonexistent/rules.yaml")).is_err());
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let rule_set = |access_evaluation: &str| -> GenerationRuleSet {
            let mut rule = trade_rule();
            rule.access_evaluation = Some(serde_json::from_str(access_evaluation).unwrap());
            GenerationRuleSet {
                generation_rules: BTreeMap::from([("stocks-trade".to_string(), rule)]),
                ..Default::default()
            }
        };
        let a = rule_set(r#"{"subject": {"id": "${sub}"}, "action": {"name": "trade"}}"#);
        let b = rule_set(r#"{"action": {"name": "trade"}, "subject": {"id": "${sub}"}}"#);
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());

        let c = rule_set(r#"{"action": {"name": "sell"}, "subject": {"id": "${sub}"}}"#);
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }
}
