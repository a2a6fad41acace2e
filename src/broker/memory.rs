//! In-memory broker
//!
//! Exchanges, routing keys and queues without a server. Each queue bound to
//! a route receives its own copy of every message published on that route;
//! subscriptions sharing a queue name compete for its messages. Messages
//! published to a route with no bound queue are dropped, as an AMQP
//! exchange would do. A bounded publish log is kept for inspection.

use super::{Broker, BrokerMessage, PublishOptions, Route, Subscription};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex};

/// Configuration for the in-memory broker
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum entries kept in the publish log
    pub max_log: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { max_log: 10_000 }
    }
}

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<BrokerMessage>>>;

struct Queue {
    sender: mpsc::UnboundedSender<BrokerMessage>,
    receiver: SharedReceiver,
}

/// In-process broker backed by tokio channels
#[derive(Default)]
pub struct MemoryBroker {
    config: MemoryConfig,
    queues: RwLock<HashMap<Route, HashMap<String, Queue>>>,
    log: RwLock<Vec<(Route, Bytes)>>,
}

impl MemoryBroker {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            queues: RwLock::new(HashMap::new()),
            log: RwLock::new(Vec::new()),
        }
    }

    /// Everything published so far, oldest first
    pub fn published(&self) -> Vec<(Route, Bytes)> {
        self.log.read().map(|l| l.clone()).unwrap_or_default()
    }

    /// Payloads published on one route, oldest first
    pub fn published_on(&self, route: &Route) -> Vec<Bytes> {
        self.published()
            .into_iter()
            .filter(|(r, _)| r == route)
            .map(|(_, p)| p)
            .collect()
    }
}

fn lock_error<E: std::fmt::Display>(e: E) -> RelayError {
    RelayError::Connection(format!("memory broker lock poisoned: {}", e))
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, route: &Route, payload: Bytes, _opts: &PublishOptions) -> Result<()> {
        {
            let mut log = self.log.write().map_err(lock_error)?;
            log.push((route.clone(), payload.clone()));
            if self.config.max_log > 0 && log.len() > self.config.max_log {
                let drain = log.len() - self.config.max_log;
                log.drain(..drain);
            }
        }

        let queues = self.queues.read().map_err(lock_error)?;
        let Some(bound) = queues.get(route) else {
            tracing::debug!(route = %route, "No queue bound, message dropped");
            return Ok(());
        };

        for (name, queue) in bound {
            let msg = BrokerMessage {
                route: route.clone(),
                payload: payload.clone(),
                received_at: Utc::now(),
            };
            if queue.sender.send(msg).is_err() {
                tracing::debug!(queue = %name, "Queue receiver dropped");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, route: &Route, queue: &str) -> Result<Box<dyn Subscription>> {
        let mut queues = self.queues.write().map_err(lock_error)?;
        let receiver = queues
            .entry(route.clone())
            .or_default()
            .entry(queue.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::unbounded_channel();
                Queue {
                    sender,
                    receiver: Arc::new(Mutex::new(receiver)),
                }
            })
            .receiver
            .clone();

        tracing::debug!(route = %route, queue, "Memory subscription created");
        Ok(Box::new(MemorySubscription { receiver }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription handle for [`MemoryBroker`]
pub struct MemorySubscription {
    receiver: SharedReceiver,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<BrokerMessage>> {
        Ok(self.receiver.lock().await.recv().await)
    }
}
