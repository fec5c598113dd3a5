use std::time::Duration;

use serde::Serialize;

/// Most recent errors kept in the status snapshot.
pub(crate) const RECENT_ERRORS_CAP: usize = 8;

/// Lifecycle of the client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of the connection. Cheap to clone; readable from
/// any task without touching the manager.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Last measured heartbeat round trip, in milliseconds. Kept across
    /// outages so dashboards show the final reading instead of a blank.
    pub latency_ms: Option<u64>,
    /// True when `latency_ms` predates the current connection.
    pub latency_stale: bool,
    /// Failed connect attempts in the current outage. Zero while healthy.
    pub reconnect_attempts: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub recent_errors: Vec<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            latency_ms: None,
            latency_stale: false,
            reconnect_attempts: 0,
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            recent_errors: Vec::new(),
        }
    }
}

impl ConnectionStatus {
    pub(crate) fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub(crate) fn record_latency(&mut self, rtt: Duration) {
        self.latency_ms = Some(rtt.as_millis() as u64);
        self.latency_stale = false;
    }

    pub(crate) fn mark_latency_stale(&mut self) {
        if self.latency_ms.is_some() {
            self.latency_stale = true;
        }
    }

    pub(crate) fn push_error(&mut self, error: impl Into<String>) {
        if self.recent_errors.len() == RECENT_ERRORS_CAP {
            self.recent_errors.remove(0);
        }
        self.recent_errors.push(error.into());
    }
}
