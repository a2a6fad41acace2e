//! NATS JetStream broker
//!
//! Implements [`Broker`] on NATS JetStream. An exchange maps to a stream,
//! a routing key to the subject `<exchange>.<routing key>`, and a queue to
//! a durable pull consumer.

mod client;
mod config;
mod subscriber;

pub use client::NatsClient;
pub use config::{NatsConfig, StorageType};
pub use subscriber::NatsSubscription;

use crate::broker::{Broker, PublishOptions, Route, Subscription};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// NATS JetStream broker
///
/// Wraps `NatsClient` and implements the `Broker` trait.
pub struct NatsBroker {
    client: NatsClient,
}

impl NatsBroker {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, route: &Route, payload: Bytes, opts: &PublishOptions) -> Result<()> {
        self.client.publish(route, payload, opts).await.map(|_| ())
    }

    async fn subscribe(&self, route: &Route, queue: &str) -> Result<Box<dyn Subscription>> {
        let sub = self.client.subscribe_durable(route, queue).await?;
        Ok(Box::new(sub))
    }

    fn name(&self) -> &str {
        "nats"
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.client.is_connected())
    }
}
