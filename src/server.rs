//! HTTP surface: token endpoint, JWKS, rule export and health.

use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::error::TratError;
use crate::exchange::{
    parse_exchange_request, TokenExchangeError, TokenExchangeResponse, TokenRequest, TokenService,
};

pub const RULES_HASH_HEADER: &str = "x-rules-hash";

/// Default header carrying the authenticated caller identity.
pub const DEFAULT_CALLER_HEADER: &str = "x-caller-id";

/// Shared state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub token_service: Arc<TokenService>,
    /// Set by the transport layer in front of this service.
    pub caller_header: HeaderName,
    /// Deadline for a single issuance.
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(token_service: Arc<TokenService>) -> Self {
        Self {
            token_service,
            caller_header: HeaderName::from_static(DEFAULT_CALLER_HEADER),
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/token_endpoint", post(token_endpoint))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/generation-rules", get(generation_rules))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error response in token endpoint form.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: TokenExchangeError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<TratError> for ApiError {
    fn from(err: TratError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %err, "Token request failed");
        } else {
            debug!(error = %err, "Token request rejected");
        }
        Self {
            status,
            body: TokenExchangeError::from(&err),
        }
    }
}

fn server_error(message: &str) -> ApiError {
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: TokenExchangeError {
            error: "server_error".to_string(),
            error_description: Some(message.to_string()),
        },
    }
}

async fn token_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<TokenExchangeResponse>, ApiError> {
    let caller = headers
        .get(&state.caller_header)
        .and_then(|value| value.to_str().ok());

    let request = TokenRequest::from_exchange(parse_exchange_request(&body)?)?;

    let issued = tokio::time::timeout(
        state.request_timeout,
        state.token_service.generate_token(caller, &request),
    )
    .await
    .map_err(|_| TratError::UpstreamUnavailable("token request timed out".to_string()))??;

    Ok(Json(TokenExchangeResponse::txn_token(issued.token)))
}

async fn jwks(State(state): State<AppState>) -> Result<Response, ApiError> {
    let jwks = state.token_service.keys().public_jwks().map_err(|e| {
        error!(error = %e, "Failed to build JWKS");
        server_error("signing keys unavailable")
    })?;
    Ok(Json(jwks).into_response())
}

async fn generation_rules(State(state): State<AppState>) -> Result<Response, ApiError> {
    let snapshot = state.token_service.rules().snapshot().map_err(|e| {
        error!(error = %e, "Failed to read rule set");
        server_error("rule set unavailable")
    })?;
    let hash = HeaderValue::from_str(snapshot.hash())
        .map_err(|_| server_error("rule set hash unavailable"))?;

    let mut response = Json(snapshot.rule_set().clone()).into_response();
    response.headers_mut().insert(RULES_HASH_HEADER, hash);
    Ok(response)
}

async fn health(State(state): State<AppState>) -> Result<Response, ApiError> {
    let hash = state
        .token_service
        .rules()
        .rules_hash()
        .map_err(|_| server_error("rule set unavailable"))?;
    Ok(Json(json!({"status": "ok", "rulesHash": hash})).into_response())
}
