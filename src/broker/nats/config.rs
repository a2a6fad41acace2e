//! NATS JetStream configuration

use crate::broker::Route;
use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Connection and stream settings for the NATS broker
///
/// Each exchange is backed by its own JetStream stream named after the
/// exchange in upper case (`healthcheck` → `HEALTHCHECK`) and capturing
/// every subject under `<exchange>.>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    pub connect_timeout_secs: u64,

    pub request_timeout_secs: u64,

    pub storage: StorageType,

    /// Message retention, 0 keeps messages until other limits apply
    pub max_age_secs: u64,

    /// Maximum messages per stream, -1 for unlimited
    pub max_messages: i64,

    /// Maximum bytes per stream, -1 for unlimited
    pub max_bytes: i64,

    /// Window in which a repeated `Nats-Msg-Id` is dropped
    pub duplicate_window_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            storage: StorageType::File,
            max_age_secs: 7 * 24 * 3600,
            max_messages: 100_000,
            max_bytes: -1,
            duplicate_window_secs: 120,
        }
    }
}

impl NatsConfig {
    /// JetStream stream name for an exchange
    pub fn stream_name(&self, exchange: &str) -> String {
        exchange
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Subjects captured by an exchange's stream
    pub fn stream_subjects(&self, exchange: &str) -> Vec<String> {
        vec![format!("{}.>", exchange)]
    }

    /// Full subject for a route
    pub fn subject(&self, route: &Route) -> String {
        format!("{}.{}", route.exchange, route.routing_key)
    }
}
