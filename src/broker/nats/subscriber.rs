//! NATS pull-consumer subscription

use crate::broker::{BrokerMessage, Route, Subscription};
use crate::error::{RelayError, Result};
use async_nats::jetstream;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;

/// Subscription over a JetStream pull consumer
///
/// Messages are acknowledged as soon as they are received.
pub struct NatsSubscription {
    messages: jetstream::consumer::pull::Stream,
    exchange: String,
}

impl NatsSubscription {
    pub(crate) fn new(messages: jetstream::consumer::pull::Stream, exchange: String) -> Self {
        Self { messages, exchange }
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<BrokerMessage>> {
        let msg = match self.messages.next().await {
            None => return Ok(None),
            Some(Err(e)) => return Err(RelayError::Consumer(e.to_string())),
            Some(Ok(msg)) => msg,
        };

        msg.ack()
            .await
            .map_err(|e| RelayError::Ack(e.to_string()))?;

        let subject = msg.subject.to_string();
        Ok(Some(BrokerMessage {
            route: Route::new(
                self.exchange.clone(),
                routing_key(&self.exchange, &subject),
            ),
            payload: msg.payload.clone(),
            received_at: Utc::now(),
        }))
    }
}

/// Strip the `<exchange>.` prefix from a subject
fn routing_key(exchange: &str, subject: &str) -> String {
    subject
        .strip_prefix(exchange)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(subject)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key_from_subject() {
        assert_eq!(
            routing_key("healthcheck", "healthcheck.health.wbor-endec"),
            "health.wbor-endec"
        );
        assert_eq!(routing_key("healthcheck", "other.subject"), "other.subject");
    }
}
