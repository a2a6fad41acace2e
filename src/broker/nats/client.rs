//! NATS JetStream client: stream setup, publishing and durable consumers

use super::config::{NatsConfig, StorageType};
use super::subscriber::NatsSubscription;
use crate::broker::{PublishOptions, Route};
use crate::error::{RelayError, Result};
use async_nats::jetstream;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// NATS JetStream client
///
/// Owns the connection and lazily creates one stream per exchange.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// JetStream context
    jetstream: jetstream::Context,

    /// Streams already ensured, keyed by exchange
    streams: Mutex<HashMap<String, jetstream::stream::Stream>>,

    /// Configuration
    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| RelayError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            streams: Mutex::new(HashMap::new()),
            config: Arc::new(config),
        })
    }

    /// Make sure the stream backing `exchange` exists
    pub async fn ensure_exchange(&self, exchange: &str) -> Result<()> {
        let mut streams = self.streams.lock().await;
        if !streams.contains_key(exchange) {
            let stream = ensure_stream(&self.jetstream, &self.config, exchange).await?;
            streams.insert(exchange.to_string(), stream);
        }
        Ok(())
    }

    /// Publish a payload and wait for the JetStream ack
    pub async fn publish(
        &self,
        route: &Route,
        payload: Bytes,
        opts: &PublishOptions,
    ) -> Result<u64> {
        self.ensure_exchange(&route.exchange).await?;
        let subject = self.config.subject(route);

        let ack_fut = match &opts.msg_id {
            Some(msg_id) => {
                let mut headers = async_nats::HeaderMap::new();
                headers.insert("Nats-Msg-Id", msg_id.as_str());
                self.jetstream
                    .publish_with_headers(subject.clone(), headers, payload)
                    .await
            }
            None => self.jetstream.publish(subject.clone(), payload).await,
        }
        .map_err(|e| RelayError::Publish {
            subject: subject.clone(),
            reason: e.to_string(),
        })?;

        let ack = tokio::time::timeout(
            Duration::from_secs(self.config.request_timeout_secs),
            ack_fut,
        )
        .await
        .map_err(|_| {
            RelayError::Timeout(format!(
                "Publish ack timed out after {}s for subject '{}'",
                self.config.request_timeout_secs, subject
            ))
        })?
        .map_err(|e| RelayError::Publish {
            subject: subject.clone(),
            reason: format!("ack failed: {}", e),
        })?;

        tracing::debug!(
            subject = %subject,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            msg_id = ?opts.msg_id,
            "Message published"
        );

        Ok(ack.sequence)
    }

    /// Create (or resume) a durable pull consumer for one route.
    ///
    /// A new consumer starts with messages published after its creation,
    /// so a first-time subscriber is not fed stale history.
    pub async fn subscribe_durable(&self, route: &Route, queue: &str) -> Result<NatsSubscription> {
        self.ensure_exchange(&route.exchange).await?;
        let filter_subject = self.config.subject(route);

        let consumer = {
            let streams = self.streams.lock().await;
            let stream = streams.get(&route.exchange).ok_or_else(|| {
                RelayError::Stream(format!("Stream for '{}' not initialised", route.exchange))
            })?;
            stream
                .get_or_create_consumer(
                    queue,
                    jetstream::consumer::pull::Config {
                        durable_name: Some(queue.to_string()),
                        filter_subject: filter_subject.clone(),
                        ack_policy: jetstream::consumer::AckPolicy::Explicit,
                        deliver_policy: jetstream::consumer::DeliverPolicy::New,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| {
                    RelayError::Consumer(format!(
                        "Failed to create durable consumer '{}': {}",
                        queue, e
                    ))
                })?
        };

        let messages = consumer.messages().await.map_err(|e| RelayError::Subscribe {
            subject: filter_subject.clone(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            consumer = queue,
            filter = %filter_subject,
            "Durable subscription created"
        );

        Ok(NatsSubscription::new(messages, route.exchange.clone()))
    }

    /// Whether the underlying connection is up
    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the JetStream stream for an exchange exists
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
    exchange: &str,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let name = config.stream_name(exchange);
    let stream_config = jetstream::stream::Config {
        name: name.clone(),
        subjects: config.stream_subjects(exchange),
        storage,
        max_messages: config.max_messages,
        max_age: Duration::from_secs(config.max_age_secs),
        max_bytes: config.max_bytes,
        duplicate_window: Duration::from_secs(config.duplicate_window_secs),
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| {
            RelayError::Stream(format!("Failed to create/get stream '{}': {}", name, e))
        })?;

    tracing::info!(
        stream = %name,
        subjects = ?config.stream_subjects(exchange),
        "JetStream stream ready"
    );

    Ok(stream)
}
