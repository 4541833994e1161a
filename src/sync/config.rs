//! Control channel settings.

use std::time::Duration;

/// How to reach and stay connected to the control plane.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `ws://` or `wss://` URL of the control plane.
    pub url: String,
    /// Namespace whose rules this instance serves.
    pub namespace: String,
    pub instance_id: String,
    /// Sent as `Authorization: Bearer` on the upgrade request.
    pub bearer_token: Option<String>,
    /// Overridden by the server in the registration response.
    pub heartbeat_interval: Duration,
    pub register_timeout: Duration,
    pub write_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl SyncConfig {
    pub fn new(url: &str, namespace: &str) -> Self {
        Self {
            url: url.to_string(),
            namespace: namespace.to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            bearer_token: None,
            heartbeat_interval: Duration::from_secs(30),
            register_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: 10,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.url.starts_with("ws://") && !self.url.starts_with("wss://") {
            return Err(format!("control plane URL '{}' must be ws:// or wss://", self.url));
        }
        if self.namespace.trim().is_empty() {
            return Err("control plane namespace must not be empty".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat interval must be positive".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max reconnect attempts must be at least 1".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            return Err("initial backoff must not exceed max backoff".to_string());
        }
        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        base + base.mul_f64(fastrand::f64() * 0.1)
    }
}
