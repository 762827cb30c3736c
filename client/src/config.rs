use std::time::Duration;

/// Delay between a lost connection and the next attempt.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";

/// Connection settings for a [`crate::SyncSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub server_url: String,
    pub reconnect_interval: Duration,
}

impl SyncConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self { server_url: server_url.into(), reconnect_interval: DEFAULT_RECONNECT_INTERVAL }
    }

    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_URL)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
