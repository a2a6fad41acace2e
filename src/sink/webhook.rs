//! Generic JSON webhook

use super::{check_response, redact_url, Sink, TargetKind};
use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use serde::Serialize;

/// Request body posted to a generic webhook
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eas: Option<&'a str>,
}

impl<'a> WebhookPayload<'a> {
    pub fn from_message(message: &'a Message) -> Self {
        Self {
            message: message.body(),
            eas: message.separate_header(),
        }
    }
}

/// POSTs `{"message": ..., "eas": ...}` to a URL
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Sink for WebhookSink {
    async fn send(&self, message: &Message) -> Result<()> {
        let payload = WebhookPayload::from_message(message);
        tracing::debug!(
            endpoint = %self.endpoint(),
            payload = %serde_json::to_string(&payload)?,
            "Posting to webhook"
        );

        let response = self.client.post(&self.url).json(&payload).send().await?;
        check_response(&self.endpoint(), response).await
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Webhook
    }

    fn endpoint(&self) -> String {
        redact_url(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_payload_without_header() {
        let msg = Message::new("hello", None, Utc::now(), "COM1");
        let json = serde_json::to_value(WebhookPayload::from_message(&msg)).unwrap();
        assert_eq!(json, serde_json::json!({"message": "hello"}));
    }

    #[test]
    fn test_payload_with_forked_header() {
        let msg = Message::new(
            "text",
            Some("ZCZC-EAS-RWT-".to_string()),
            Utc::now(),
            "COM1",
        );
        let json = serde_json::to_value(WebhookPayload::from_message(&msg)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"message": "text", "eas": "ZCZC-EAS-RWT-"})
        );
    }

    #[test]
    fn test_payload_header_equal_to_body_is_not_repeated() {
        let msg = Message::new("ZCZC-A-", Some("ZCZC-A-".to_string()), Utc::now(), "COM1");
        let payload = WebhookPayload::from_message(&msg);
        assert!(payload.eas.is_none());
    }
}
