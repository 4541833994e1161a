//! Control-plane configuration sync over a duplex WebSocket channel.

pub mod client;
pub mod config;
pub mod protocol;

pub use client::SyncClient;
pub use config::SyncConfig;
pub use protocol::{Envelope, MessageType};
