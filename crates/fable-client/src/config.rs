use std::time::Duration;

use fable_core::ids::SessionId;

/// Reconnect backoff schedule. Delays are deterministic: within one outage
/// the waits never shrink, and the attempt counter resets only after a
/// successful connect.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Failed connect attempts tolerated before the client gives up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        let scaled = self.base_delay.as_millis() as f64 * factor.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Connection settings for one dialogue channel. `url` is the server's
/// channel endpoint without query parameters, e.g. `ws://127.0.0.1:8787/ws`.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub url: String,
    pub session_id: SessionId,
    /// Channel credential presented in the upgrade query string.
    pub token: String,
    pub reconnect: ReconnectPolicy,
    /// Handshake budget for a single connect attempt.
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Silence tolerated after an unanswered ping before the channel is
    /// declared dead.
    pub heartbeat_timeout: Duration,
    /// How long an unacknowledged turn waits before it is sent again.
    pub ack_timeout: Duration,
    /// Transmissions allowed per turn before it is surfaced as failed.
    pub send_retry_limit: u32,
    /// Chunks buffered per paused stream; the oldest is dropped beyond this.
    pub paused_buffer_limit: usize,
    /// Capacity of the subscriber event channel.
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, session_id: SessionId, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session_id,
            token: token.into(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            send_retry_limit: 5,
            paused_buffer_limit: 256,
            event_capacity: 256,
        }
    }

    /// Full upgrade URL with session and credential query parameters.
    pub fn channel_url(&self) -> String {
        format!("{}?session_id={}&token={}", self.url, self.session_id, self.token)
    }
}
