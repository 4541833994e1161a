//! Token Exchange (RFC 8693) for transaction tokens.
//!
//! A caller presents a subject credential together with a description of
//! the API call it is about to make, and receives a short-lived token bound
//! to that call.

pub mod config;
pub mod handler;
pub mod issuer;

pub use config::{TokenType, GRANT_TYPE_TOKEN_EXCHANGE, ISSUED_TOKEN_TYPE_NA};
pub use handler::{
    encode_json_param, parse_exchange_request, RequestDetails, TokenExchangeError,
    TokenExchangeRequest, TokenExchangeResponse, TokenRequest,
};
pub use issuer::{IssuedToken, TokenService};
