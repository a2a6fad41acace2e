//! Discord webhook delivery
//!
//! [`DiscordSink`] relays alerts as a rich embed. [`DiscordNotifier`] sends
//! the watchdog's plain-text outage and recovery notices.

use super::{check_response, redact_url, truncate, Sink, TargetKind};
use crate::error::Result;
use crate::message::Message;
use crate::watchdog::{Notifier, WatchdogNotice, DEFAULT_TIMEZONE};
use async_trait::async_trait;
use chrono_tz::Tz;
use serde::Serialize;

/// Discord limit for an embed description
const DESCRIPTION_CHARS: usize = 4096;

/// Discord limit for an embed field value
const FIELD_CHARS: usize = 1024;

/// Embed colour for relayed alerts
const ALERT_COLOR: u32 = 0xE0_2B_20;

#[derive(Debug, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    pub timestamp: String,
    pub footer: EmbedFooter,
}

#[derive(Debug, Serialize)]
pub struct WebhookBody {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

/// Build the embed posted for a relayed alert
pub fn alert_embed(message: &Message) -> Embed {
    let fields = message
        .header_line()
        .map(|line| EmbedField {
            name: "EAS".to_string(),
            value: truncate(line, FIELD_CHARS),
            inline: false,
        })
        .into_iter()
        .collect();

    Embed {
        title: "Emergency Alert".to_string(),
        description: truncate(message.body(), DESCRIPTION_CHARS),
        color: ALERT_COLOR,
        fields,
        timestamp: message.received_at().to_rfc3339(),
        footer: EmbedFooter {
            text: format!("Received on {}", message.source_port()),
        },
    }
}

/// Relays alerts to a Discord channel webhook as embeds
pub struct DiscordSink {
    client: reqwest::Client,
    url: String,
    username: String,
}

impl DiscordSink {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            username: username.into(),
        }
    }
}

#[async_trait]
impl Sink for DiscordSink {
    async fn send(&self, message: &Message) -> Result<()> {
        let body = WebhookBody {
            username: self.username.clone(),
            content: None,
            embeds: vec![alert_embed(message)],
        };
        let response = self.client.post(&self.url).json(&body).send().await?;
        check_response(&self.endpoint(), response).await
    }

    fn kind(&self) -> TargetKind {
        TargetKind::EmbedService
    }

    fn endpoint(&self) -> String {
        redact_url(&self.url)
    }
}

/// Posts watchdog notices to a Discord webhook as plain content
pub struct DiscordNotifier {
    client: reqwest::Client,
    url: String,
    username: String,
    application: String,
    timezone: Tz,
}

impl DiscordNotifier {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        application: impl Into<String>,
    ) -> Self {
        let application = application.into();
        Self {
            client,
            url: url.into(),
            username: format!("{} Health Monitor", application),
            application,
            timezone: DEFAULT_TIMEZONE,
        }
    }

    /// Show notice times in `timezone`
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn body_for(&self, notice: &WatchdogNotice) -> WebhookBody {
        WebhookBody {
            username: self.username.clone(),
            content: Some(notice.render(&self.application, self.timezone)),
            embeds: Vec::new(),
        }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, notice: &WatchdogNotice) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.body_for(notice))
            .send()
            .await?;
        check_response(&redact_url(&self.url), response).await?;
        tracing::info!("Discord notice sent");
        Ok(())
    }
}
