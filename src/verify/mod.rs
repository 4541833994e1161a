//! Resource-side verification of transaction tokens.

mod binding;
mod verifier;

pub use binding::{
    FieldBinding, InboundRequest, RequestBinder, RequestSource, ValueKind, VerificationRule,
    VerificationRules,
};
pub use verifier::{extract_token, TxnTokenVerifier, TXN_TOKEN_HEADER};
