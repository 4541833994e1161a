//! Transaction token service.
//!
//! Exchanges a caller's subject credential for a short-lived signed token
//! that binds the subject, a purpose and an authorization context derived
//! from the request being made. Generation rules arrive from a control
//! plane over a duplex channel or from a static file. The [`verify`] module
//! is the resource-service half: it checks the signature and binds the
//! token to the live request.

pub mod access;
pub mod error;
pub mod exchange;
pub mod jwks;
pub mod keys;
pub mod rules;
pub mod server;
pub mod subject;
pub mod sync;
pub mod token;
pub mod verify;

#[cfg(test)]
mod testing;
