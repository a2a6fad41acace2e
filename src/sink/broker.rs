//! Alert publishing to the notifications exchange

use super::{Sink, TargetKind};
use crate::broker::{Broker, PublishOptions, Route};
use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// `event_type` of relayed alerts
pub const ALERT_EVENT_TYPE: &str = "eas_alert";

/// Wire format of an alert on the notifications exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEnvelope {
    pub source_application: String,
    pub event_type: String,
    pub timestamp_utc: DateTime<Utc>,
    pub serial_port: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eas: Option<String>,
}

impl AlertEnvelope {
    pub fn from_message(application: &str, message: &Message) -> Self {
        Self {
            source_application: application.to_string(),
            event_type: ALERT_EVENT_TYPE.to_string(),
            timestamp_utc: message.received_at(),
            serial_port: message.source_port().to_string(),
            message: message.body().to_string(),
            eas: message.header_line().map(str::to_string),
        }
    }
}

/// Publishes alerts on `notifications` / `notification.<app>`
pub struct BrokerSink {
    broker: Arc<dyn Broker>,
    route: Route,
    application: String,
}

impl BrokerSink {
    pub fn new(broker: Arc<dyn Broker>, application: impl Into<String>) -> Self {
        let application = application.into();
        Self {
            broker,
            route: Route::notifications(&application),
            application,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Dedup id shared by every retry of the same message
    fn msg_id(&self, message: &Message) -> String {
        let at = message.received_at();
        format!(
            "alert-{}-{}-{}",
            self.application,
            at.timestamp(),
            at.timestamp_subsec_nanos()
        )
    }
}

#[async_trait]
impl Sink for BrokerSink {
    async fn send(&self, message: &Message) -> Result<()> {
        let envelope = AlertEnvelope::from_message(&self.application, message);
        let payload = Bytes::from(serde_json::to_vec(&envelope)?);
        let opts = PublishOptions {
            msg_id: Some(self.msg_id(message)),
        };
        self.broker.publish(&self.route, payload, &opts).await
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Broker
    }

    fn endpoint(&self) -> String {
        format!("{} {}", self.broker.name(), self.route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    #[tokio::test]
    async fn test_publishes_on_notifications_route() {
        let broker = Arc::new(MemoryBroker::default());
        let sink = BrokerSink::new(broker.clone(), "wbor-endec");
        let msg = Message::new("body", Some("ZCZC-X-".to_string()), Utc::now(), "COM1");

        sink.send(&msg).await.unwrap();

        let published = broker.published_on(&Route::notifications("wbor-endec"));
        assert_eq!(published.len(), 1);
        let envelope: AlertEnvelope = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(envelope.event_type, "eas_alert");
        assert_eq!(envelope.message, "body");
        assert_eq!(envelope.eas.as_deref(), Some("ZCZC-X-"));
        assert_eq!(envelope.serial_port, "COM1");
        assert!(broker
            .published_on(&Route::healthcheck("wbor-endec"))
            .is_empty());
    }

    #[test]
    fn test_msg_id_stable_per_message() {
        let sink = BrokerSink::new(Arc::new(MemoryBroker::default()), "app");
        let msg = Message::new("body", None, Utc::now(), "COM1");
        assert_eq!(sink.msg_id(&msg), sink.msg_id(&msg));
        assert!(sink.msg_id(&msg).starts_with("alert-app-"));
        assert_eq!(sink.endpoint(), "memory notifications/notification.app");
    }
}
