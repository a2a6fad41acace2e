//! Message broker abstraction
//!
//! Heartbeats and alert notifications travel over a broker organised as
//! named exchanges and routing keys. Health traffic and alert traffic use
//! separate exchanges so that an alert backlog never delays heartbeats:
//!
//! - `healthcheck` exchange, routing key `health.<app>`
//! - `notifications` exchange, routing key `notification.<app>`
//!
//! Backends implement [`Broker`]. Two are provided: NATS JetStream for
//! deployments and an in-memory broker for tests and single-process use.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod nats;

/// Exchange carrying liveness records
pub const HEALTHCHECK_EXCHANGE: &str = "healthcheck";

/// Exchange carrying relayed alerts
pub const NOTIFICATIONS_EXCHANGE: &str = "notifications";

/// Exchange plus routing key a message is published on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Route for heartbeats from `app`
    pub fn healthcheck(app: &str) -> Self {
        Self::new(HEALTHCHECK_EXCHANGE, format!("health.{}", app))
    }

    /// Route for alerts relayed by `app`
    pub fn notifications(app: &str) -> Self {
        Self::new(NOTIFICATIONS_EXCHANGE, format!("notification.{}", app))
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Options for a single publish
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Deduplication id, stable across retries of the same logical message
    pub msg_id: Option<String>,
}

/// A message received from a subscription
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub route: Route,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

/// Core trait for broker backends
///
/// Implementations must be safe to publish on from many tasks at once:
/// the heartbeat emitter and the alert dispatcher share one instance.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload on a route
    async fn publish(&self, route: &Route, payload: Bytes, opts: &PublishOptions) -> Result<()>;

    /// Subscribe to one route through a named queue.
    ///
    /// Queues with the same name share deliveries; a durable backend keeps
    /// the queue's position across reconnects.
    async fn subscribe(&self, route: &Route, queue: &str) -> Result<Box<dyn Subscription>>;

    /// Backend name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check: true if the backend is connected and operational
    async fn health(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Async subscription handle
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next message (acknowledged on receipt).
    ///
    /// Returns `Ok(None)` once the subscription is closed.
    async fn next(&mut self) -> Result<Option<BrokerMessage>>;
}
