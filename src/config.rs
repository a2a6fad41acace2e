//! Relay configuration
//!
//! Loaded from a JSON file, optionally merged with a secrets file, then
//! overridden by command-line flags. Every field has a default so an empty
//! object is a valid file; validation only demands at least one sink.

use crate::broker::nats::NatsConfig;
use crate::broker::Broker;
use crate::dispatch::DeliveryTarget;
use crate::error::{RelayError, Result};
use crate::frame::{FrameExtractor, NestedStartPolicy, DEFAULT_MAX_FRAME_BYTES};
use crate::heartbeat::HeartbeatConfig;
use crate::message::{NormalizeOptions, Normalizer};
use crate::retry::RetryPolicy;
use crate::sink::groupme::GROUPME_BOTS_URL;
use crate::sink::{http_client, BrokerSink, DiscordSink, GroupMeSink, WebhookSink};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Name used in routing keys and heartbeats
    #[serde(default = "default_application")]
    pub application: String,
    /// Serial device the ENDEC is attached to
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default)]
    pub webhooks: Vec<String>,
    #[serde(default)]
    pub groupme_bot_ids: Vec<String>,
    #[serde(default = "default_groupme_url")]
    pub groupme_url: String,
    #[serde(default)]
    pub discord_webhooks: Vec<String>,
    #[serde(default = "default_discord_username")]
    pub discord_username: String,
    #[serde(default)]
    pub normalize: NormalizeOptions,
    #[serde(default)]
    pub framing: FramingSettings,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub broker: BrokerSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    /// Retry policy for every sink
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramingSettings {
    #[serde(default)]
    pub nested_start: NestedStartPolicy,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for FramingSettings {
    fn default() -> Self {
        Self {
            nested_start: NestedStartPolicy::default(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout, bounds how long shutdown waits on a silent port
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Delay schedule between reconnects; `max_attempts` is ignored
    #[serde(default = "default_reconnect")]
    pub reconnect: RetryPolicy,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            reconnect: default_reconnect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Publish relayed alerts on the notifications exchange
    #[serde(default = "default_true")]
    pub publish_alerts: bool,
    #[serde(default)]
    pub nats: NatsConfig,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            publish_alerts: true,
            nats: NatsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_heartbeat_interval_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Credentials kept out of the main config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub webhooks: Vec<String>,
    #[serde(default)]
    pub groupme_bot_ids: Vec<String>,
    #[serde(default)]
    pub discord_webhooks: Vec<String>,
    #[serde(default)]
    pub broker_token: Option<String>,
}

fn default_application() -> String {
    "wbor-endec".into()
}
fn default_port() -> String {
    "/dev/ttyUSB0".into()
}
fn default_groupme_url() -> String {
    GROUPME_BOTS_URL.into()
}
fn default_discord_username() -> String {
    "ENDEC".into()
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_reconnect() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        base_delay_ms: 5_000,
        max_delay_ms: 60_000,
        jitter: 0.1,
        attempt_timeout_ms: None,
    }
}
fn default_true() -> bool {
    true
}
fn default_heartbeat_interval_secs() -> u64 {
    3600
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            application: default_application(),
            port: default_port(),
            webhooks: Vec::new(),
            groupme_bot_ids: Vec::new(),
            groupme_url: default_groupme_url(),
            discord_webhooks: Vec::new(),
            discord_username: default_discord_username(),
            normalize: NormalizeOptions::default(),
            framing: FramingSettings::default(),
            serial: SerialSettings::default(),
            broker: BrokerSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            retry: RetryPolicy::default(),
            http_timeout_secs: default_http_timeout_secs(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let src = std::fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&src)
        .map_err(|e| RelayError::Config(format!("parse error in {}: {e}", path.display())))
}

impl Secrets {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

impl RelayConfig {
    /// Load without validating; flags may still add sinks
    pub fn from_file(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// Add secret endpoints to the configured ones
    pub fn merge_secrets(&mut self, secrets: Secrets) {
        self.webhooks.extend(secrets.webhooks);
        self.groupme_bot_ids.extend(secrets.groupme_bot_ids);
        self.discord_webhooks.extend(secrets.discord_webhooks);
        if secrets.broker_token.is_some() {
            self.broker.nats.token = secrets.broker_token;
        }
    }

    fn publishes_alerts(&self) -> bool {
        self.broker.enabled && self.broker.publish_alerts
    }

    pub fn validate(&self) -> Result<()> {
        if self.webhooks.is_empty()
            && self.groupme_bot_ids.is_empty()
            && self.discord_webhooks.is_empty()
            && !self.publishes_alerts()
        {
            return Err(RelayError::Config(
                "at least one of --webhook, --groupme, --discord or an enabled broker \
                 must be configured"
                    .into(),
            ));
        }
        for url in self.webhooks.iter().chain(&self.discord_webhooks) {
            reqwest::Url::parse(url)
                .map_err(|e| RelayError::Config(format!("invalid webhook URL '{url}': {e}")))?;
        }
        if self.groupme_bot_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(RelayError::Config("empty GroupMe bot id".into()));
        }
        if self.application.is_empty() || self.application.contains(['.', '*', '>', ' ']) {
            return Err(RelayError::Config(format!(
                "application '{}' cannot be used in a routing key",
                self.application
            )));
        }
        let normalize = &self.normalize;
        let modes = [normalize.trim_to_alert_line, normalize.quiet, normalize.fork]
            .into_iter()
            .filter(|set| *set)
            .count();
        if modes > 1 {
            return Err(RelayError::Config(
                "normalize: only one of trim_to_alert_line, quiet and fork may be set".into(),
            ));
        }
        if self.framing.max_frame_bytes == 0 {
            return Err(RelayError::Config("framing.max_frame_bytes must be positive".into()));
        }
        if self.heartbeat.enabled && self.heartbeat.interval_secs == 0 {
            return Err(RelayError::Config("heartbeat.interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn extractor(&self) -> FrameExtractor {
        FrameExtractor::with_policy(self.framing.nested_start, self.framing.max_frame_bytes)
    }

    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(self.normalize, self.port.clone())
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            application: self.application.clone(),
            serial_port: self.port.clone(),
            interval: Duration::from_secs(self.heartbeat.interval_secs),
            retry: self.heartbeat.retry.clone(),
        }
    }

    /// One target per webhook URL, GroupMe bot and Discord webhook, plus
    /// the broker when alerts are published there
    pub fn build_targets(&self, broker: Option<Arc<dyn Broker>>) -> Result<Vec<DeliveryTarget>> {
        let client = http_client(Duration::from_secs(self.http_timeout_secs))?;
        let mut targets = Vec::new();

        for (i, url) in self.webhooks.iter().enumerate() {
            targets.push(DeliveryTarget::new(
                format!("webhook-{}", i + 1),
                Arc::new(WebhookSink::new(client.clone(), url.clone())),
                self.retry.clone(),
            ));
        }
        for (i, bot_id) in self.groupme_bot_ids.iter().enumerate() {
            targets.push(DeliveryTarget::new(
                format!("groupme-{}", i + 1),
                Arc::new(
                    GroupMeSink::new(client.clone(), bot_id.clone())
                        .with_url(self.groupme_url.clone()),
                ),
                self.retry.clone(),
            ));
        }
        for (i, url) in self.discord_webhooks.iter().enumerate() {
            targets.push(DeliveryTarget::new(
                format!("discord-{}", i + 1),
                Arc::new(DiscordSink::new(
                    client.clone(),
                    url.clone(),
                    self.discord_username.clone(),
                )),
                self.retry.clone(),
            ));
        }
        if self.publishes_alerts() {
            let broker = broker.ok_or_else(|| {
                RelayError::Config("broker alerts enabled but no broker connected".into())
            })?;
            targets.push(DeliveryTarget::new(
                "broker",
                Arc::new(BrokerSink::new(broker, self.application.clone())),
                self.retry.clone(),
            ));
        }
        Ok(targets)
    }
}
