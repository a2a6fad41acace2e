//! Delivery sinks
//!
//! A sink knows how to hand one [`Message`] to one external destination.
//! Retries, timeouts and fan-out live in the dispatcher; a sink only
//! reports whether a single attempt succeeded.

use crate::error::{RelayError, Result};
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod broker;
pub mod discord;
pub mod groupme;
pub mod webhook;

pub use broker::{AlertEnvelope, BrokerSink};
pub use discord::{DiscordNotifier, DiscordSink};
pub use groupme::GroupMeSink;
pub use webhook::WebhookSink;

/// Kind of destination a target delivers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Webhook,
    ChatBot,
    EmbedService,
    Broker,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Webhook => "webhook",
            TargetKind::ChatBot => "chat_bot",
            TargetKind::EmbedService => "embed_service",
            TargetKind::Broker => "broker",
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One destination for relayed messages
#[async_trait]
pub trait Sink: Send + Sync {
    /// Make a single delivery attempt
    async fn send(&self, message: &Message) -> Result<()>;

    fn kind(&self) -> TargetKind;

    /// Endpoint description that is safe to log
    fn endpoint(&self) -> String;
}

/// Build the shared HTTP client used by HTTP sinks
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("endec-relay/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(RelayError::from)
}

/// Turn a non-2xx response into a delivery error carrying the body
pub(crate) async fn check_response(target: &str, response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(RelayError::delivery(
        target,
        format!("HTTP {}: {}", status, truncate(&body, 200)),
    ))
}

/// Scheme and host of a URL; paths often embed tokens
pub fn redact_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => format!("{}://{}/…", parsed.scheme(), host),
            None => format!("{}:…", parsed.scheme()),
        },
        Err(_) => "<invalid url>".to_string(),
    }
}

/// Cut `text` to at most `max` characters
pub(crate) fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
