//! GroupMe bot delivery
//!
//! GroupMe caps a bot post at 500 characters, so the body (plus footer) is
//! split into segments posted in order. A failed segment fails the whole
//! attempt; a retry re-sends every segment.

use super::{check_response, Sink, TargetKind};
use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use serde::Serialize;

/// Bot post endpoint
pub const GROUPME_BOTS_URL: &str = "https://api.groupme.com/v3/bots/post";

/// Maximum characters per GroupMe message
pub const SEGMENT_CHARS: usize = 500;

/// Footer appended to every relayed message
pub fn default_footer() -> String {
    format!(
        "\n\nThis message was sent using endec-relay v{}\n----------",
        env!("CARGO_PKG_VERSION")
    )
}

#[derive(Debug, Serialize)]
struct BotPost<'a> {
    bot_id: &'a str,
    text: &'a str,
}

/// Posts messages as one GroupMe bot
pub struct GroupMeSink {
    client: reqwest::Client,
    url: String,
    bot_id: String,
    footer: String,
}

impl GroupMeSink {
    pub fn new(client: reqwest::Client, bot_id: impl Into<String>) -> Self {
        Self {
            client,
            url: GROUPME_BOTS_URL.to_string(),
            bot_id: bot_id.into(),
            footer: default_footer(),
        }
    }

    /// Override the API endpoint
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = footer.into();
        self
    }

    /// Segments that would be posted for `message`
    pub fn segments_for(&self, message: &Message) -> Vec<String> {
        segments(&format!("{}{}", message.body(), self.footer), SEGMENT_CHARS)
    }
}

/// Split text into chunks of at most `max` characters
pub fn segments(text: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[async_trait]
impl Sink for GroupMeSink {
    async fn send(&self, message: &Message) -> Result<()> {
        let parts = self.segments_for(message);
        let total = parts.len();
        for (index, text) in parts.iter().enumerate() {
            tracing::debug!(segment = index + 1, total, "Posting to GroupMe");
            let response = self
                .client
                .post(&self.url)
                .json(&BotPost {
                    bot_id: &self.bot_id,
                    text,
                })
                .send()
                .await?;
            check_response(&self.endpoint(), response).await?;
        }
        tracing::info!(segments = total, "GroupMe post successful");
        Ok(())
    }

    fn kind(&self) -> TargetKind {
        TargetKind::ChatBot
    }

    fn endpoint(&self) -> String {
        let prefix: String = self.bot_id.chars().take(4).collect();
        format!("groupme bot {}…", prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_segments_split_by_chars() {
        let text = "é".repeat(1200);
        let parts = segments(&text, SEGMENT_CHARS);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].chars().count(), 500);
        assert_eq!(parts[2].chars().count(), 200);
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_segments_empty_text() {
        assert!(segments("", 500).is_empty());
    }

    #[test]
    fn test_segments_include_footer() {
        let sink =
            GroupMeSink::new(reqwest::Client::new(), "abcdef").with_footer(" -- bot");
        let msg = Message::new("alert", None, Utc::now(), "COM1");
        assert_eq!(sink.segments_for(&msg), vec!["alert -- bot".to_string()]);
    }

    #[test]
    fn test_endpoint_hides_bot_id() {
        let sink = GroupMeSink::new(reqwest::Client::new(), "1234567890");
        assert_eq!(sink.endpoint(), "groupme bot 1234…");
    }

    #[test]
    fn test_default_footer_mentions_version() {
        assert!(default_footer().contains(env!("CARGO_PKG_VERSION")));
    }
}
