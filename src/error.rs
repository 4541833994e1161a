//! Error types shared across issuance, configuration and verification.

use thiserror::Error;

use crate::rules::{ExtractionError, HttpMethod, TemplateError};

/// Failures while verifying a subject credential.
#[derive(Debug, Error)]
pub enum SubjectTokenError {
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("token has expired")]
    Expired,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Issuance failures, one variant per externally visible outcome.
#[derive(Debug, Error)]
pub enum TratError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported grant: {0}")]
    UnsupportedGrant(String),

    #[error("subject token invalid: {0}")]
    SubjectTokenInvalid(SubjectTokenError),

    #[error("unsupported subject token type: {0}")]
    UnsupportedTokenType(String),

    #[error("subject field '{0}' missing from subject token")]
    SubjectFieldMissing(String),

    #[error("caller '{0}' is not authorized to request transaction tokens")]
    UnauthorizedCaller(String),

    #[error("no generation rule matches {method} {path}")]
    NoMatchingRule { method: HttpMethod, path: String },

    #[error("authorization context field '{field}': {source}")]
    AuthorizationContext {
        field: String,
        #[source]
        source: ExtractionError,
    },

    #[error("access denied")]
    AccessDenied,

    #[error("signing failed: {0}")]
    SigningFailure(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("service misconfigured: {0}")]
    Misconfigured(String),
}

impl From<SubjectTokenError> for TratError {
    fn from(err: SubjectTokenError) -> Self {
        match err {
            SubjectTokenError::Unavailable(msg) => TratError::UpstreamUnavailable(msg),
            other => TratError::SubjectTokenInvalid(other),
        }
    }
}

impl TratError {
    /// HTTP status returned to the caller.
    pub fn status_code(&self) -> u16 {
        match self {
            TratError::InvalidRequest(_)
            | TratError::SubjectTokenInvalid(_)
            | TratError::UnsupportedTokenType(_)
            | TratError::SubjectFieldMissing(_)
            | TratError::AuthorizationContext { .. } => 400,
            TratError::UnsupportedGrant(_) => 422,
            TratError::UnauthorizedCaller(_) | TratError::AccessDenied => 403,
            TratError::NoMatchingRule { .. }
            | TratError::SigningFailure(_)
            | TratError::UpstreamUnavailable(_)
            | TratError::Misconfigured(_) => 500,
        }
    }

    /// OAuth-style error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            TratError::InvalidRequest(_) | TratError::AuthorizationContext { .. } => {
                "invalid_request"
            }
            TratError::UnsupportedGrant(_) => "unsupported_grant_type",
            TratError::SubjectTokenInvalid(_) | TratError::SubjectFieldMissing(_) => {
                "invalid_grant"
            }
            TratError::UnsupportedTokenType(_) => "unsupported_token_type",
            TratError::UnauthorizedCaller(_) | TratError::AccessDenied => "access_denied",
            TratError::NoMatchingRule { .. }
            | TratError::SigningFailure(_)
            | TratError::UpstreamUnavailable(_)
            | TratError::Misconfigured(_) => "server_error",
        }
    }

    /// Description safe to hand back to the caller.
    ///
    /// Server-side failures are reduced to a fixed message so endpoint URLs,
    /// key errors and rule contents stay in the logs.
    pub fn public_description(&self) -> String {
        match self {
            TratError::NoMatchingRule { .. } => {
                "no generation rule matches the request".to_string()
            }
            TratError::SigningFailure(_) => "failed to sign transaction token".to_string(),
            TratError::UpstreamUnavailable(_) => {
                "an upstream dependency is unavailable".to_string()
            }
            TratError::Misconfigured(_) => "service is not fully configured".to_string(),
            other => other.to_string(),
        }
    }
}

/// Failures while validating or mutating the generation rule set.
#[derive(Debug, Error)]
pub enum RuleSetError {
    #[error("invalid rule set: {0}")]
    Invalid(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("rule '{rule}' field '{field}': {source}")]
    Mapping {
        rule: String,
        field: String,
        #[source]
        source: ExtractionError,
    },

    #[error("generation rule '{0}' not found")]
    UnknownRule(String),

    #[error("failed to build service components: {0:#}")]
    Components(anyhow::Error),

    #[error("failed to hash rule set: {0}")]
    Hash(#[from] serde_json::Error),

    #[error("rule store lock poisoned")]
    Poisoned,
}

impl RuleSetError {
    /// Status reported back to the control plane.
    pub fn status_code(&self) -> u16 {
        match self {
            RuleSetError::Invalid(_)
            | RuleSetError::Template(_)
            | RuleSetError::Mapping { .. } => 400,
            RuleSetError::UnknownRule(_) => 404,
            RuleSetError::Components(_) | RuleSetError::Hash(_) | RuleSetError::Poisoned => 500,
        }
    }
}

/// Resource-side verification failures.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("no transaction token in request")]
    MissingToken,

    #[error("malformed transaction token: {0}")]
    Malformed(String),

    #[error("transaction token has no key id")]
    MissingKeyId,

    #[error("key '{0}' not found in JWKS")]
    KeyNotFound(String),

    #[error("verification keys unavailable: {0}")]
    KeysUnavailable(String),

    #[error("algorithm {0} is not accepted for this key")]
    UnsupportedAlgorithm(String),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("transaction token has expired")]
    Expired,

    #[error("issuer mismatch")]
    IssuerMismatch,

    #[error("audience mismatch")]
    AudienceMismatch,

    #[error("caller identity does not match token subject")]
    IdentityMismatch,

    #[error("no verification rule for {method} {path}")]
    UnknownRoute { method: HttpMethod, path: String },

    #[error("no verification rule for method {0}")]
    UnsupportedMethod(String),

    #[error("purpose '{actual}' is not valid for this route")]
    PurposeMismatch { actual: String },

    #[error("authorization context field '{0}' missing")]
    MissingField(String),

    #[error("authorization context field '{0}' does not match request")]
    FieldMismatch(String),
}

impl VerificationError {
    /// 401 for token-level failures, 403 when the token does not bind the request.
    pub fn status_code(&self) -> u16 {
        match self {
            VerificationError::IdentityMismatch
            | VerificationError::UnknownRoute { .. }
            | VerificationError::UnsupportedMethod(_)
            | VerificationError::PurposeMismatch { .. }
            | VerificationError::MissingField(_)
            | VerificationError::FieldMismatch(_) => 403,
            _ => 401,
        }
    }

    /// Whether the failure happened after the signature was accepted.
    pub fn is_binding_failure(&self) -> bool {
        self.status_code() == 403
    }
}

/// Control channel failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to connect to control plane: {0}")]
    Connect(String),

    #[error("registration failed: {0}")]
    Registration(String),

    #[error("control channel closed: {0}")]
    Closed(String),

    #[error("no control plane traffic for {0:?}")]
    Idle(std::time::Duration),

    #[error("control channel protocol error: {0}")]
    Protocol(String),

    #[error("fatal control channel failure: {0}")]
    Fatal(String),
}
