//! Transaction token signing keys.

pub mod config;
pub mod manager;

pub use config::KeyConfig;
pub use manager::{generate_rsa_key, KeyManager};
