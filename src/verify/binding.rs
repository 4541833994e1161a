//! Binding a verified token to the request it arrives on.
//!
//! Each route a resource service exposes declares the purpose it accepts and
//! which `azd` fields must equal which parts of the live request. A token is
//! only good for the exact parameters it was minted for.

use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::VerificationError;
use crate::rules::{AzdValue, Expression, HttpMethod, PathTemplate, TemplateError, TemplateIndex};
use crate::token::TxnTokenClaims;

/// Where a bound value is read from on the inbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestSource {
    /// Template placeholder name.
    PathParam(String),
    /// Dotted expression into the JSON body.
    Body(String),
    Query(String),
    Header(String),
}

/// How the token value and the request value are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    #[default]
    String,
    Integer,
    Number,
    #[serde(alias = "bool")]
    Boolean,
}

impl ValueKind {
    fn same(&self, token: &AzdValue, request: &AzdValue) -> bool {
        match self {
            ValueKind::String => token.to_string() == request.to_string(),
            ValueKind::Integer => matches!(
                (token.as_i64(), request.as_i64()),
                (Some(a), Some(b)) if a == b
            ),
            ValueKind::Number => matches!(
                (token.as_f64(), request.as_f64()),
                (Some(a), Some(b)) if a == b
            ),
            ValueKind::Boolean => matches!(
                (token.as_bool(), request.as_bool()),
                (Some(a), Some(b)) if a == b
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldBinding {
    /// Key in the token's `azd` claim.
    pub field: String,
    pub source: RequestSource,
    #[serde(default)]
    pub kind: ValueKind,
    /// Accepted token values. Empty accepts any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
}

/// One route of a resource service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRule {
    pub method: HttpMethod,
    pub path: String,
    pub purpose: String,
    #[serde(default)]
    pub bindings: Vec<FieldBinding>,
}

/// File form: `{rules: [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationRules {
    pub rules: Vec<VerificationRule>,
}

impl VerificationRules {
    /// Parse YAML (JSON is valid YAML).
    pub fn from_yaml(input: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(input)
    }
}

/// The parts of an inbound request bindings may read.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: HttpMethod,
    pub path: String,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Value,
}

impl InboundRequest {
    pub fn new(method: HttpMethod, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: Value::Null,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Build from HTTP request parts and the buffered body.
    ///
    /// A body that is not JSON is kept as `null`; body bindings then miss.
    pub fn from_http(parts: &Parts, body: &[u8]) -> Result<Self, VerificationError> {
        let method: HttpMethod = parts
            .method
            .as_str()
            .parse()
            .map_err(|_| VerificationError::UnsupportedMethod(parts.method.to_string()))?;

        let mut request = Self::new(method, parts.uri.path());
        for (name, value) in &parts.headers {
            if let Ok(value) = value.to_str() {
                request.headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        if let Some(query) = parts.uri.query() {
            let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query)
                .map_err(|e| VerificationError::Malformed(format!("query string: {}", e)))?;
            request.query.extend(pairs);
        }
        if !body.is_empty() {
            match serde_json::from_slice(body) {
                Ok(json) => request.body = json,
                Err(e) => debug!(error = %e, "Request body is not JSON"),
            }
        }
        Ok(request)
    }
}

enum CompiledSource {
    PathParam(String),
    Body(Expression),
    Query(String),
    Header(String),
}

struct CompiledBinding {
    field: String,
    source: CompiledSource,
    kind: ValueKind,
    allowed: Vec<String>,
}

struct CompiledRoute {
    purpose: String,
    bindings: Vec<CompiledBinding>,
}

/// Checks a verified token against the inbound request.
pub struct RequestBinder {
    routes: TemplateIndex<CompiledRoute>,
    identity_header: String,
}

impl RequestBinder {
    /// Compile the route table. `identity_header` carries the caller identity
    /// set by the upstream authenticator.
    pub fn new(rules: Vec<VerificationRule>, identity_header: &str) -> Result<Self, TemplateError> {
        let mut entries = Vec::with_capacity(rules.len());
        for rule in rules {
            let template = PathTemplate::parse(&rule.path)?;
            let mut bindings = Vec::with_capacity(rule.bindings.len());
            for binding in rule.bindings {
                let source = match binding.source {
                    RequestSource::PathParam(name) => {
                        if !template.params().contains(&name) {
                            return Err(TemplateError::Pattern {
                                template: rule.path.clone(),
                                message: format!("binding reads unknown placeholder '{}'", name),
                            });
                        }
                        CompiledSource::PathParam(name)
                    }
                    RequestSource::Body(expr) => {
                        CompiledSource::Body(Expression::parse(&expr).map_err(|e| {
                            TemplateError::Pattern {
                                template: rule.path.clone(),
                                message: e.to_string(),
                            }
                        })?)
                    }
                    RequestSource::Query(name) => CompiledSource::Query(name),
                    RequestSource::Header(name) => {
                        CompiledSource::Header(name.to_ascii_lowercase())
                    }
                };
                bindings.push(CompiledBinding {
                    field: binding.field,
                    source,
                    kind: binding.kind,
                    allowed: binding.allowed,
                });
            }
            entries.push((
                rule.method,
                template,
                CompiledRoute {
                    purpose: rule.purpose,
                    bindings,
                },
            ));
        }

        Ok(Self {
            routes: TemplateIndex::build(entries)?,
            identity_header: identity_header.to_ascii_lowercase(),
        })
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Fails on the first mismatch.
    pub fn bind(
        &self,
        claims: &TxnTokenClaims,
        request: &InboundRequest,
    ) -> Result<(), VerificationError> {
        match request.header(&self.identity_header) {
            Some(identity) if identity == claims.sub.value() => {}
            _ => return Err(VerificationError::IdentityMismatch),
        }

        let (route, path_params) = self
            .routes
            .find(request.method, &request.path)
            .ok_or_else(|| VerificationError::UnknownRoute {
                method: request.method,
                path: request.path.clone(),
            })?;

        if claims.purp != route.purpose {
            return Err(VerificationError::PurposeMismatch {
                actual: claims.purp.clone(),
            });
        }

        for binding in &route.bindings {
            let token_value = claims
                .azd
                .get(&binding.field)
                .ok_or_else(|| VerificationError::MissingField(binding.field.clone()))?;

            if !binding.allowed.is_empty() && !binding.allowed.contains(&token_value.to_string()) {
                return Err(VerificationError::FieldMismatch(binding.field.clone()));
            }

            let text = |v: &String| AzdValue::from(v.as_str());
            let request_value = match &binding.source {
                CompiledSource::PathParam(name) => path_params.get(name).map(text),
                CompiledSource::Query(name) => request.query.get(name).map(text),
                CompiledSource::Header(name) => request.headers.get(name).map(text),
                CompiledSource::Body(expr) => {
                    expr.lookup(&request.body).and_then(AzdValue::from_json)
                }
            };

            match request_value {
                Some(value) if binding.kind.same(token_value, &value) => {}
                _ => {
                    debug!(
                        field = %binding.field,
                        "Request does not match token authorization context"
                    );
                    return Err(VerificationError::FieldMismatch(binding.field.clone()));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::SubjectIdentifier;
    use serde_json::json;

    const RULES: &str = r#"
rules:
  - method: POST
    path: /api/order
    purpose: StocksTrade
    bindings:
      - field: action
        source: { body: orderType }
        allowed: [Buy, Sell]
      - field: stockID
        source: { body: stockID }
        kind: integer
      - field: quantity
        source: { body: quantity }
        kind: integer
  - method: GET
    path: /api/transactions/{#id}
    purpose: TradeTransactionDetails
    bindings:
      - field: transactionID
        source: { pathParam: id }
"#;

    fn binder() -> RequestBinder {
        let rules = VerificationRules::from_yaml(RULES).unwrap().rules;
        RequestBinder::new(rules, "X-User-Name").unwrap()
    }

    fn claims(purpose: &str, azd: serde_json::Value) -> TxnTokenClaims {
        TxnTokenClaims {
            iss: "https://txn.example.com".to_string(),
            aud: "stocks.example.com".to_string(),
            exp: 0,
            iat: 0,
            txn: "t-1".to_string(),
            sub: SubjectIdentifier::Email {
                email: "alice@example.com".to_string(),
            },
            purp: purpose.to_string(),
            azd: serde_json::from_value(azd).unwrap(),
            rctx: Default::default(),
        }
    }

    fn trade_claims() -> TxnTokenClaims {
        claims("StocksTrade", json!({"action": "Buy", "stockID": 42, "quantity": 5}))
    }

    fn order(body: serde_json::Value) -> InboundRequest {
        InboundRequest::new(HttpMethod::Post, "/api/order")
            .with_header("x-user-name", "alice@example.com")
            .with_body(body)
    }

    #[test]
    fn test_matching_request_binds() {
        let request = order(json!({"orderType": "Buy", "stockID": 42, "quantity": 5}));
        assert!(binder().bind(&trade_claims(), &request).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let binder = binder();
        for body in [
            json!({"orderType": "Buy", "stockID": 42, "quantity": 500}),
            json!({"orderType": "Buy", "stockID": 43, "quantity": 5}),
            json!({"orderType": "Sell", "stockID": 42, "quantity": 5}),
            json!({"orderType": "Buy", "stockID": 42}),
        ] {
            let err = binder.bind(&trade_claims(), &order(body)).unwrap_err();
            assert!(matches!(err, VerificationError::FieldMismatch(_)), "{err:?}");
            assert_eq!(err.status_code(), 403);
        }
    }

    #[test]
    fn test_identity_must_match_subject() {
        let request = InboundRequest::new(HttpMethod::Post, "/api/order")
            .with_header("X-User-Name", "mallory@example.com")
            .with_body(json!({"orderType": "Buy", "stockID": 42, "quantity": 5}));
        assert!(matches!(
            binder().bind(&trade_claims(), &request),
            Err(VerificationError::IdentityMismatch)
        ));

        let request = InboundRequest::new(HttpMethod::Post, "/api/order");
        assert!(matches!(
            binder().bind(&trade_claims(), &request),
            Err(VerificationError::IdentityMismatch)
        ));
    }

    #[test]
    fn test_purpose_and_route_checks() {
        let request = order(json!({"orderType": "Buy", "stockID": 42, "quantity": 5}));
        let wrong_purpose = claims(
            "StockSearch",
            json!({"action": "Buy", "stockID": 42, "quantity": 5}),
        );
        assert!(matches!(
            binder().bind(&wrong_purpose, &request),
            Err(VerificationError::PurposeMismatch { .. })
        ));

        let request = InboundRequest::new(HttpMethod::Delete, "/api/order")
            .with_header("x-user-name", "alice@example.com");
        assert!(matches!(
            binder().bind(&trade_claims(), &request),
            Err(VerificationError::UnknownRoute { .. })
        ));
    }

    #[test]
    fn test_missing_azd_field_rejected() {
        let partial = claims("StocksTrade", json!({"action": "Buy", "stockID": 42}));
        let request = order(json!({"orderType": "Buy", "stockID": 42, "quantity": 5}));
        assert!(matches!(
            binder().bind(&partial, &request),
            Err(VerificationError::MissingField(field)) if field == "quantity"
        ));
    }

    #[test]
    fn test_disallowed_token_value_rejected() {
        let odd = claims("StocksTrade", json!({"action": "Short", "stockID": 42, "quantity": 5}));
        let request = order(json!({"orderType": "Short", "stockID": 42, "quantity": 5}));
        assert!(matches!(
            binder().bind(&odd, &request),
            Err(VerificationError::FieldMismatch(_))
        ));
    }

    #[test]
    fn test_path_param_binding() {
        let token = claims("TradeTransactionDetails", json!({"transactionID": "tx-9"}));
        let binder = binder();

        let request = InboundRequest::new(HttpMethod::Get, "/api/transactions/tx-9")
            .with_header("x-user-name", "alice@example.com");
        assert!(binder.bind(&token, &request).is_ok());

        let request = InboundRequest::new(HttpMethod::Get, "/api/transactions/tx-10")
            .with_header("x-user-name", "alice@example.com");
        assert!(binder.bind(&token, &request).is_err());
    }

    #[test]
    fn test_from_http_parts() {
        let (parts, _) = axum::http::Request::builder()
            .method("GET")
            .uri("/api/stocks/search?query=ACME&limit=5")
            .header("X-User-Name", "alice@example.com")
            .body(())
            .unwrap()
            .into_parts();
        let request = InboundRequest::from_http(&parts, b"").unwrap();
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.path, "/api/stocks/search");
        assert_eq!(request.query.get("query").map(String::as_str), Some("ACME"));
        assert_eq!(request.header("x-user-name"), Some("alice@example.com"));
        assert_eq!(request.body, Value::Null);
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let rules = vec![VerificationRule {
            method: HttpMethod::Get,
            path: "/api/stocks/{#id}".to_string(),
            purpose: "StockDetails".to_string(),
            bindings: vec![FieldBinding {
                field: "stockID".to_string(),
                source: RequestSource::PathParam("stock".to_string()),
                kind: ValueKind::Integer,
                allowed: vec![],
            }],
        }];
        assert!(RequestBinder::new(rules, "x-user-name").is_err());
    }
}
