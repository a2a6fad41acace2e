//! Periodic liveness records
//!
//! The relay publishes one [`HeartbeatRecord`] on `healthcheck` /
//! `health.<app>` at startup and then on every interval tick, independent of
//! alert traffic. Ticks missed while a publish is retrying are skipped.

use crate::broker::{Broker, PublishOptions, Route};
use crate::error::Result;
use crate::retry::{with_retry, RetryPolicy};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    HealthCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Alive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub listening_port: String,
    pub application: String,
    pub version: String,
}

/// Wire format of a heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub source_application: String,
    pub event_type: EventType,
    pub timestamp_utc: DateTime<Utc>,
    pub status: HeartbeatStatus,
    pub serial_port: String,
    pub system_info: SystemInfo,
}

impl HeartbeatRecord {
    pub fn new(application: &str, serial_port: &str, at: DateTime<Utc>) -> Self {
        Self {
            source_application: application.to_string(),
            event_type: EventType::HealthCheck,
            timestamp_utc: at,
            status: HeartbeatStatus::Alive,
            serial_port: serial_port.to_string(),
            system_info: SystemInfo {
                listening_port: serial_port.to_string(),
                application: application.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub application: String,
    pub serial_port: String,
    pub interval: Duration,
    pub retry: RetryPolicy,
}

pub struct HeartbeatEmitter {
    broker: Arc<dyn Broker>,
    route: Route,
    config: HeartbeatConfig,
}

impl HeartbeatEmitter {
    pub fn new(broker: Arc<dyn Broker>, config: HeartbeatConfig) -> Self {
        Self {
            route: Route::healthcheck(&config.application),
            broker,
            config,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Build and publish one heartbeat, retrying per the policy
    pub async fn emit_once(&self, cancel: &CancellationToken) -> Result<()> {
        let record = HeartbeatRecord::new(
            &self.config.application,
            &self.config.serial_port,
            Utc::now(),
        );
        let payload = Bytes::from(serde_json::to_vec(&record)?);
        let opts = PublishOptions {
            msg_id: Some(format!("health-{}", Uuid::new_v4())),
        };

        let report = with_retry(&self.config.retry, cancel, "heartbeat", |_| {
            let payload = payload.clone();
            let opts = opts.clone();
            let broker = self.broker.clone();
            let route = self.route.clone();
            async move { broker.publish(&route, payload, &opts).await }
        })
        .await;

        match &report.result {
            Ok(()) => tracing::info!(route = %self.route, "Heartbeat published"),
            Err(e) => tracing::error!(
                route = %self.route,
                attempts = report.attempts,
                error = %e,
                "Heartbeat publish failed"
            ),
        }
        report.result
    }

    /// Emit now and then on every interval tick until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.config.interval.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            route = %self.route,
            interval_secs = interval.as_secs(),
            "Heartbeat emitter started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // Failures are logged in emit_once; the next tick tries again
                    let _ = self.emit_once(&cancel).await;
                }
            }
        }
        tracing::info!("Heartbeat emitter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::Subscription;
    use crate::error::RelayError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(interval_secs: u64) -> HeartbeatConfig {
        HeartbeatConfig {
            application: "wbor-endec".to_string(),
            serial_port: "/dev/ttyUSB0".to_string(),
            interval: Duration::from_secs(interval_secs),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 100,
                max_delay_ms: 100,
                jitter: 0.0,
                attempt_timeout_ms: Some(1_000),
            },
        }
    }

    #[test]
    fn test_record_wire_format() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let record = HeartbeatRecord::new("wbor-endec", "/dev/ttyUSB0", at);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "source_application": "wbor-endec",
                "event_type": "health_check",
                "timestamp_utc": "2024-05-01T12:30:00Z",
                "status": "alive",
                "serial_port": "/dev/ttyUSB0",
                "system_info": {
                    "listening_port": "/dev/ttyUSB0",
                    "application": "wbor-endec",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            })
        );

        let back: HeartbeatRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_at_startup_and_each_interval() {
        let broker = Arc::new(MemoryBroker::default());
        let route = Route::healthcheck("wbor-endec");
        let mut sub = broker.subscribe(&route, "health_checks").await.unwrap();

        let emitter = HeartbeatEmitter::new(broker.clone(), config(3600));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(emitter.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(7201)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(broker.published_on(&route).len(), 3);
        let first = sub.next().await.unwrap().unwrap();
        let record: HeartbeatRecord = serde_json::from_slice(&first.payload).unwrap();
        assert_eq!(record.status, HeartbeatStatus::Alive);
        assert!(broker.published_on(&Route::notifications("wbor-endec")).is_empty());
    }

    struct DownBroker {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Broker for DownBroker {
        async fn publish(
            &self,
            route: &Route,
            _payload: Bytes,
            _opts: &PublishOptions,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::Publish {
                subject: route.to_string(),
                reason: "no route to host".to_string(),
            })
        }

        async fn subscribe(&self, _route: &Route, _queue: &str) -> Result<Box<dyn Subscription>> {
            Err(RelayError::Connection("down".to_string()))
        }

        fn name(&self) -> &str {
            "down"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_is_retried_and_survived() {
        let broker = Arc::new(DownBroker {
            calls: AtomicU32::new(0),
        });
        let emitter = HeartbeatEmitter::new(broker.clone(), config(60));
        let cancel = CancellationToken::new();

        assert!(emitter.emit_once(&cancel).await.is_err());
        assert_eq!(broker.calls.load(Ordering::SeqCst), 2);

        let task = tokio::spawn(emitter.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(61)).await;
        cancel.cancel();
        task.await.unwrap();

        // Startup and the 60s tick, two attempts each
        assert_eq!(broker.calls.load(Ordering::SeqCst), 6);
    }
}
