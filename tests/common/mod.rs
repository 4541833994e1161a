#![allow(dead_code)]

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;

use txn_token_service::exchange::{
    encode_json_param, RequestDetails, TokenExchangeResponse, TokenService, TokenType,
    GRANT_TYPE_TOKEN_EXCHANGE,
};
use txn_token_service::jwks::{Jwks, JwksCache};
use txn_token_service::keys::KeyManager;
use txn_token_service::rules::RuleStore;
use txn_token_service::server::{build_router, AppState};
use txn_token_service::verify::TxnTokenVerifier;

pub const ISSUER: &str = "https://txn.example.com";
pub const AUDIENCE: &str = "stocks.example.com";
pub const CALLER: &str = "spiffe://example.com/gateway";

const SIGNING_KEY_PEM: &str = include_str!("../fixtures/signing_key.pem");
const WORKLOAD_KEY_PEM: &str = include_str!("../fixtures/idp_key.pem");

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Self-signed subject token for `email`, valid for a minute.
pub fn subject_token(email: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("workload-1".to_string());
    let key = EncodingKey::from_rsa_pem(WORKLOAD_KEY_PEM.as_bytes()).unwrap();
    encode(
        &header,
        &json!({"email": email, "iat": now(), "exp": now() + 60}),
        &key,
    )
    .unwrap()
}

/// Service config accepting unverified self-signed subject tokens.
pub fn service_config() -> Value {
    json!({
        "token": {"issuer": ISSUER, "audience": AUDIENCE, "lifetime": "2m"},
        "subjectTokens": {"selfSigned": {"validation": false, "subjectField": "email"}},
        "authorizedCallers": [CALLER]
    })
}

pub fn stocks_rules() -> Value {
    json!({
        "stocks-trade": {
            "name": "stocks-trade",
            "method": "POST",
            "path": "/api/order",
            "purpose": "StocksTrade",
            "azdMapping": {
                "action": {"required": true, "value": "${body.orderType}"},
                "stockID": {"required": true, "value": "${body.stockID}"},
                "quantity": {"required": true, "value": "${body.quantity}"}
            }
        },
        "stock-details": {
            "name": "stock-details",
            "method": "GET",
            "path": "/api/stocks/{#id}",
            "purpose": "StockDetails",
            "azdMapping": {
                "stockID": {"required": true, "value": "${id}"}
            }
        }
    })
}

pub struct TestService {
    pub base_url: String,
    pub store: Arc<RuleStore>,
}

pub async fn spawn_service() -> TestService {
    let keys = KeyManager::from_pem(
        SIGNING_KEY_PEM,
        Some("txn-signing-1".to_string()),
        Duration::from_secs(60),
    )
    .unwrap();
    let store = Arc::new(RuleStore::new(reqwest::Client::new()).unwrap());
    let service = Arc::new(TokenService::new(store.clone(), Arc::new(keys)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(AppState::new(service));
    tokio::spawn(async move { axum::serve(listener, router).await });

    TestService {
        base_url: format!("http://{}", addr),
        store,
    }
}

impl TestService {
    /// POST the token endpoint as the authorized caller.
    pub async fn request_token(&self, email: &str, details: &RequestDetails) -> reqwest::Response {
        let subject = subject_token(email);
        let details = encode_json_param(details).unwrap();
        let context = encode_json_param(&json!({"req_ip": "10.0.0.7"})).unwrap();
        let form = serde_urlencoded::to_string([
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", subject.as_str()),
            ("subject_token_type", TokenType::SelfSigned.as_urn()),
            ("requested_token_type", TokenType::TxnToken.as_urn()),
            ("audience", AUDIENCE),
            ("request_details", details.as_str()),
            ("request_context", context.as_str()),
        ])
        .unwrap();

        reqwest::Client::new()
            .post(format!("{}/token_endpoint", self.base_url))
            .header("x-caller-id", CALLER)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(form)
            .send()
            .await
            .unwrap()
    }

    pub async fn issue(&self, email: &str, details: &RequestDetails) -> String {
        let response = self.request_token(email, details).await;
        assert_eq!(response.status(), 200);
        let body: TokenExchangeResponse = response.json().await.unwrap();
        body.access_token
    }

    /// Verifier over the service's published JWKS.
    pub async fn verifier(&self) -> TxnTokenVerifier {
        let jwks: Jwks = reqwest::get(format!("{}/.well-known/jwks.json", self.base_url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        TxnTokenVerifier::new(ISSUER, AUDIENCE, Arc::new(JwksCache::from_jwks(&jwks).unwrap()))
    }
}
