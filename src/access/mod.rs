//! Optional external access evaluation.

pub mod config;
pub mod evaluator;

pub use config::{AccessEvaluationConfig, AuthenticationConfig, AuthenticationMethod, TokenValue};
pub use evaluator::{AccessEvaluator, AccessRequest};
