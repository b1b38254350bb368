//! Configuration for the NATS event bus.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the NATS event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URLs (several for a cluster).
    pub urls: Vec<String>,
    /// JetStream stream holding every Cinder event.
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default)]
    pub max_reconnect_attempts: Option<usize>,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// Request timeout for JetStream operations.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Maximum delivery attempts per consumer message.
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,
    /// Message retention period.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

fn default_stream_name() -> String {
    "CINDER_EVENTS".to_string()
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    5
}

fn default_max_deliver() -> i64 {
    3
}

fn default_max_age() -> u64 {
    86400 * 7
}

/// Subjects captured by the event stream.
pub const SUBJECTS: &[&str] = &["job.>", "lease.>"];

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            stream_name: default_stream_name(),
            max_reconnect_attempts: None,
            connection_timeout_secs: default_connection_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_deliver: default_max_deliver(),
            max_age_secs: default_max_age(),
        }
    }
}

impl NatsConfig {
    /// Create a new config with a single URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_stream_name(mut self, name: impl Into<String>) -> Self {
        self.stream_name = name.into();
        self
    }

    pub fn with_max_reconnects(mut self, max: usize) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }

    pub fn with_max_deliver(mut self, max: i64) -> Self {
        self.max_deliver = max;
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NatsConfig::new("nats://localhost:4222")
            .with_stream_name("TEST_STREAM")
            .with_max_reconnects(5)
            .with_max_deliver(5);

        assert_eq!(config.stream_name, "TEST_STREAM");
        assert_eq!(config.max_reconnect_attempts, Some(5));
        assert_eq!(config.max_deliver, 5);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: NatsConfig =
            serde_json::from_str(r#"{"urls": ["nats://events:4222"]}"#).unwrap();
        assert_eq!(config.stream_name, "CINDER_EVENTS");
        assert_eq!(config.max_age(), Duration::from_secs(7 * 86400));
        assert_eq!(config.max_reconnect_attempts, None);
    }
}
