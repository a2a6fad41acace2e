//! Relay runtime
//!
//! Wires the serial read loop, the dispatcher and the heartbeat emitter
//! together and runs them until shutdown.

use crate::broker::Broker;
use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::error::{RelayError, Result};
use crate::heartbeat::HeartbeatEmitter;
use crate::serial::{ReadLoop, ReadLoopStats, SerialOpener};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Messages buffered between the read loop and the dispatcher
const CHANNEL_CAPACITY: usize = 64;

pub struct Relay {
    config: RelayConfig,
    opener: Arc<dyn SerialOpener>,
    broker: Option<Arc<dyn Broker>>,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        opener: Arc<dyn SerialOpener>,
        broker: Option<Arc<dyn Broker>>,
    ) -> Self {
        Self {
            config,
            opener,
            broker,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run until `shutdown` fires or the read loop stops.
    ///
    /// In-flight deliveries are awaited before returning; their backoff
    /// sleeps are cut short by the cancellation.
    pub async fn run(self, shutdown: CancellationToken) -> Result<ReadLoopStats> {
        let cancel = shutdown.child_token();
        let targets = self.config.build_targets(self.broker.clone())?;
        for target in &targets {
            tracing::info!(
                target_id = %target.id(),
                kind = %target.kind(),
                endpoint = %target.endpoint(),
                "Delivery target"
            );
        }
        let dispatcher = Arc::new(Dispatcher::new(targets, cancel.clone()));

        let heartbeat = match (&self.broker, self.config.heartbeat.enabled) {
            (Some(broker), true) => {
                let emitter =
                    HeartbeatEmitter::new(broker.clone(), self.config.heartbeat_config());
                Some(tokio::spawn(emitter.run(cancel.clone())))
            }
            _ => {
                tracing::info!("Heartbeat disabled");
                None
            }
        };

        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let read_loop = ReadLoop::new(
            self.config.port.clone(),
            self.opener.clone(),
            self.config.extractor(),
            self.config.normalizer(),
            self.config.serial.reconnect.clone(),
            tx,
            cancel.clone(),
        );
        let reader = tokio::task::spawn_blocking(move || read_loop.run());

        let mut in_flight = FuturesUnordered::new();
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(message) => {
                        tracing::info!(
                            port = %message.source_port(),
                            chars = message.body().chars().count(),
                            "Alert received"
                        );
                        in_flight.push(dispatcher.spawn(Arc::new(message)));
                    }
                    None => break,
                },
                Some(joined) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Dispatch task failed");
                    }
                }
            }
        }

        // The read loop has stopped; stop the heartbeat and drain deliveries
        cancel.cancel();
        while let Some(joined) = in_flight.next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Dispatch task failed");
            }
        }
        if let Some(handle) = heartbeat {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Heartbeat task failed");
            }
        }

        let stats = reader.await.map_err(|e| {
            RelayError::serial(&self.config.port, format!("read loop panicked: {e}"))
        })??;
        tracing::info!(
            messages = stats.messages,
            reconnects = stats.disconnects,
            "Relay stopped"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::Route;
    use crate::heartbeat::HeartbeatRecord;
    use crate::sink::AlertEnvelope;
    use std::io::{Cursor, Read};

    struct OnceOpener {
        bytes: std::sync::Mutex<Option<Vec<u8>>>,
    }

    impl SerialOpener for OnceOpener {
        fn open(&self, port: &str) -> Result<Box<dyn Read + Send>> {
            match self.bytes.lock().unwrap().take() {
                Some(bytes) => Ok(Box::new(Cursor::new(bytes))),
                None => Err(RelayError::serial(port, "unplugged")),
            }
        }
    }

    #[tokio::test]
    async fn test_relays_to_broker_and_sends_heartbeat() {
        let broker = Arc::new(MemoryBroker::default());
        let mut config = RelayConfig::default();
        config.broker.enabled = true;
        config.normalize.quiet = true;
        config.serial.reconnect.base_delay_ms = 1;
        config.serial.reconnect.max_delay_ms = 1;

        let opener = Arc::new(OnceOpener {
            bytes: std::sync::Mutex::new(Some(
                b"x<ENDECSTART>TEXT\nZCZC-EAS-RWT-031195+0030-2451620-KABC/FM-\n<ENDECEND>".to_vec(),
            )),
        });
        let relay = Relay::new(config, opener, Some(broker.clone()));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(relay.run(shutdown.clone()));

        let alerts = Route::notifications("wbor-endec");
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while broker.published_on(&alerts).is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.messages, 1);

        let published = broker.published_on(&alerts);
        assert_eq!(published.len(), 1);
        let envelope: AlertEnvelope = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(envelope.message, "ZCZC-EAS-RWT-031195+0030-2451620-KABC/FM-");

        let heartbeats = broker.published_on(&Route::healthcheck("wbor-endec"));
        assert!(!heartbeats.is_empty());
        let record: HeartbeatRecord = serde_json::from_slice(&heartbeats[0]).unwrap();
        assert_eq!(record.serial_port, "/dev/ttyUSB0");
    }

    #[tokio::test]
    async fn test_unopenable_port_is_fatal() {
        let config = RelayConfig {
            groupme_bot_ids: vec!["bot".into()],
            ..Default::default()
        };
        let opener = Arc::new(OnceOpener {
            bytes: std::sync::Mutex::new(None),
        });
        let relay = Relay::new(config, opener, None);
        let err = relay.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::SerialIo { .. }));
    }
}
