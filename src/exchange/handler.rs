//! Token endpoint request parsing (RFC 8693 form body).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::config::{TokenType, GRANT_TYPE_TOKEN_EXCHANGE, ISSUED_TOKEN_TYPE_NA};
use crate::error::TratError;
use crate::rules::HttpMethod;

/// Token exchange request (form-urlencoded body).
#[derive(Debug, Deserialize)]
pub struct TokenExchangeRequest {
    pub grant_type: String,
    pub subject_token: String,
    pub subject_token_type: String,
    #[serde(default)]
    pub requested_token_type: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    /// base64url-encoded JSON [`RequestDetails`].
    #[serde(default)]
    pub request_details: Option<String>,
    /// base64url-encoded JSON object.
    #[serde(default)]
    pub request_context: Option<String>,
}

/// Snapshot of the API call the token is requested for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDetails {
    /// Bare path, e.g. `/api/order`.
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default = "empty_object")]
    pub query_parameters: Value,
    #[serde(default = "empty_object")]
    pub headers: Value,
    #[serde(default)]
    pub body: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl RequestDetails {
    pub fn new(method: HttpMethod, endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            method,
            query_parameters: empty_object(),
            headers: empty_object(),
            body: Value::Null,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_query(mut self, query: Value) -> Self {
        self.query_parameters = query;
        self
    }

    pub fn with_headers(mut self, headers: Value) -> Self {
        self.headers = headers;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        let endpoint = &self.endpoint;
        if !endpoint.starts_with('/') || endpoint.starts_with("//") {
            return Err(format!("endpoint '{}' must be a bare path", endpoint));
        }
        if endpoint.contains("://") || endpoint.contains('?') || endpoint.contains('#') {
            return Err(format!(
                "endpoint '{}' must not carry a scheme, query or fragment",
                endpoint
            ));
        }
        Ok(())
    }

    /// Extraction input: `body`, `headers`, `queryParameters` plus path params.
    pub fn input_document(&self, path_params: &BTreeMap<String, String>) -> Value {
        let mut doc = Map::new();
        doc.insert("body".to_string(), self.body.clone());
        doc.insert("headers".to_string(), self.headers.clone());
        doc.insert("queryParameters".to_string(), self.query_parameters.clone());
        for (name, value) in path_params {
            doc.insert(name.clone(), Value::String(value.clone()));
        }
        Value::Object(doc)
    }
}

/// Validated input to issuance.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub subject_token_type: TokenType,
    pub subject_token: String,
    pub audience: String,
    pub details: RequestDetails,
    pub context: Map<String, Value>,
}

impl TokenRequest {
    /// Validate a parsed form body.
    pub fn from_exchange(request: TokenExchangeRequest) -> Result<Self, TratError> {
        if request.grant_type != GRANT_TYPE_TOKEN_EXCHANGE {
            return Err(TratError::UnsupportedGrant(format!(
                "grant_type must be {}",
                GRANT_TYPE_TOKEN_EXCHANGE
            )));
        }

        match request.requested_token_type.as_deref() {
            Some(urn) if TokenType::from_urn(urn) == Some(TokenType::TxnToken) => {}
            Some(urn) => {
                return Err(TratError::UnsupportedGrant(format!(
                    "requested_token_type '{}' is not supported",
                    urn
                )))
            }
            None => {
                return Err(TratError::InvalidRequest(
                    "requested_token_type is required".to_string(),
                ))
            }
        }

        let subject_token_type = TokenType::from_urn(&request.subject_token_type)
            .filter(|t| *t != TokenType::TxnToken)
            .ok_or_else(|| TratError::UnsupportedTokenType(request.subject_token_type.clone()))?;

        if request.subject_token.trim().is_empty() {
            return Err(TratError::InvalidRequest(
                "subject_token is required".to_string(),
            ));
        }

        let audience = request
            .audience
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| TratError::InvalidRequest("audience is required".to_string()))?;

        let raw_details = request
            .request_details
            .ok_or_else(|| TratError::InvalidRequest("request_details is required".to_string()))?;
        let details: RequestDetails = decode_json_param("request_details", &raw_details)?;
        details.validate().map_err(TratError::InvalidRequest)?;

        let context = match request.request_context.as_deref() {
            Some(raw) if !raw.is_empty() => decode_json_param("request_context", raw)?,
            _ => Map::new(),
        };

        Ok(Self {
            subject_token_type,
            subject_token: request.subject_token,
            audience,
            details,
            context,
        })
    }
}

/// Decode a base64url JSON form parameter; padding is optional.
fn decode_json_param<T: DeserializeOwned>(name: &str, raw: &str) -> Result<T, TratError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw.trim().trim_end_matches('='))
        .map_err(|e| TratError::InvalidRequest(format!("{} is not base64url: {}", name, e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TratError::InvalidRequest(format!("{} is not valid JSON: {}", name, e)))
}

/// Encode a JSON value for a form parameter.
pub fn encode_json_param<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(value)?))
}

/// Token exchange response (JSON).
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenExchangeResponse {
    pub token_type: String,
    pub issued_token_type: String,
    pub access_token: String,
}

impl TokenExchangeResponse {
    pub fn txn_token(access_token: String) -> Self {
        Self {
            token_type: ISSUED_TOKEN_TYPE_NA.to_string(),
            issued_token_type: TokenType::TxnToken.as_urn().to_string(),
            access_token,
        }
    }
}

/// Token exchange error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenExchangeError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl From<&TratError> for TokenExchangeError {
    fn from(err: &TratError) -> Self {
        Self {
            error: err.error_code().to_string(),
            error_description: Some(err.public_description()),
        }
    }
}

/// Parse form-urlencoded request body.
pub fn parse_exchange_request(body: &str) -> Result<TokenExchangeRequest, TratError> {
    serde_urlencoded::from_str(body)
        .map_err(|e| TratError::InvalidRequest(format!("invalid request body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn details_param(value: Value) -> String {
        encode_json_param(&value).unwrap()
    }

    fn form(details: &str) -> String {
        serde_urlencoded::to_string([
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", "eyJhbGciOiJSUzI1NiJ9.e30.sig"),
            ("subject_token_type", TokenType::IdToken.as_urn()),
            ("requested_token_type", TokenType::TxnToken.as_urn()),
            ("audience", "stocks.example.com"),
            ("request_details", details),
        ])
        .unwrap()
    }

    #[test]
    fn test_parse_exchange_request() {
        let details = details_param(json!({
            "endpoint": "/api/order",
            "method": "POST",
            "body": {"orderType": "Buy", "stockID": 42, "quantity": 5}
        }));
        let request = parse_exchange_request(&form(&details)).unwrap();
        let request = TokenRequest::from_exchange(request).unwrap();

        assert_eq!(request.subject_token_type, TokenType::IdToken);
        assert_eq!(request.details.method, HttpMethod::Post);
        assert_eq!(request.details.body["stockID"], json!(42));
        assert_eq!(request.details.headers, json!({}));
        assert!(request.context.is_empty());
    }

    #[test]
    fn test_padded_details_accepted() {
        let raw = serde_json::to_vec(&json!({"endpoint": "/a", "method": "GET"})).unwrap();
        let padded = base64::engine::general_purpose::URL_SAFE.encode(raw);
        let request = parse_exchange_request(&form(&padded)).unwrap();
        assert!(TokenRequest::from_exchange(request).is_ok());
    }

    #[test]
    fn test_endpoint_must_be_bare_path() {
        for endpoint in ["https://evil.example.com/api", "//evil/api", "/api?x=1", "api", "/a#b"] {
            let details = details_param(json!({"endpoint": endpoint, "method": "GET"}));
            let request = parse_exchange_request(&form(&details)).unwrap();
            let err = TokenRequest::from_exchange(request).unwrap_err();
            assert!(matches!(err, TratError::InvalidRequest(_)), "{}", endpoint);
        }
    }

    #[test]
    fn test_invalid_grant_type() {
        let details = details_param(json!({"endpoint": "/a", "method": "GET"}));
        let body = form(&details).replace("token-exchange", "client_credentials");
        let request = parse_exchange_request(&body).unwrap();
        let err = TokenRequest::from_exchange(request).unwrap_err();
        assert_eq!(err.status_code(), 422);
    }

    #[test]
    fn test_unsupported_subject_token_type() {
        let details = details_param(json!({"endpoint": "/a", "method": "GET"}));
        let body = form(&details).replace("id_token", "saml2");
        let request = parse_exchange_request(&body).unwrap();
        let err = TokenRequest::from_exchange(request).unwrap_err();
        assert!(matches!(err, TratError::UnsupportedTokenType(_)));
    }

    #[test]
    fn test_unknown_method_rejected() {
        let details = details_param(json!({"endpoint": "/a", "method": "TRACE"}));
        let request = parse_exchange_request(&form(&details)).unwrap();
        assert!(TokenRequest::from_exchange(request).is_err());
    }

    #[test]
    fn test_input_document_merges_path_params() {
        let details = RequestDetails::new(HttpMethod::Get, "/api/stocks/17")
            .with_query(json!({"q": "ACME"}));
        let params = BTreeMap::from([("id".to_string(), "17".to_string())]);
        let doc = details.input_document(&params);
        assert_eq!(doc["id"], json!("17"));
        assert_eq!(doc["queryParameters"]["q"], json!("ACME"));
        assert_eq!(doc["body"], Value::Null);
    }

    #[test]
    fn test_error_body() {
        let err = TratError::AccessDenied;
        let body = TokenExchangeError::from(&err);
        assert_eq!(body.error, "access_denied");
    }
}
