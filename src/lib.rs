//! # endec-relay
//!
//! Relays emergency-alert text frames from an ENDEC serial feed to webhooks,
//! chat bots, Discord and a message broker, and watches the relay's
//! heartbeats for loss of liveness.
//!
//! ## Pipeline
//!
//! ```text
//! serial bytes -> FrameExtractor -> Normalizer -> Dispatcher -> sinks
//!                                                    |
//!                   HeartbeatEmitter -> broker  <----+ (notifications)
//! ```
//!
//! The watchdog runs as a separate process subscribed to the broker's
//! `healthcheck` exchange.
//!
//! ## Quick Start
//!
//! ```rust
//! use endec_relay::frame::FrameExtractor;
//! use endec_relay::message::{normalize, NormalizeOptions};
//!
//! let mut extractor = FrameExtractor::new();
//! let frames =
//!     extractor.feed(b"noise<ENDECSTART>ZCZC-EAS-RWT-031195+0030-2451620-KABC/FM-<ENDECEND>");
//!
//! let options = NormalizeOptions { trim_to_alert_line: true, ..Default::default() };
//! let message = normalize(&frames[0], options, "/dev/ttyUSB0");
//! assert_eq!(message.body(), "ZCZC-EAS-RWT-031195+0030-2451620-KABC/FM-");
//! ```
//!
//! ## Brokers
//!
//! - **memory**: in-process broker for tests and single-process use
//! - **nats**: NATS JetStream, one stream per exchange

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod logging;
pub mod message;
pub mod relay;
pub mod retry;
pub mod serial;
pub mod sink;
pub mod watchdog;

// Re-export core types
pub use broker::{Broker, BrokerMessage, PublishOptions, Route, Subscription};
pub use config::{RelayConfig, Secrets};
pub use dispatch::{AttemptOutcome, DeliveryAttempt, DeliveryReport, DeliveryTarget, Dispatcher};
pub use error::{RelayError, Result};
pub use frame::{FrameExtractor, NestedStartPolicy, RawFrame};
pub use heartbeat::{HeartbeatEmitter, HeartbeatRecord};
pub use message::{Message, NormalizeOptions, Normalizer};
pub use relay::Relay;
pub use retry::{with_retry, RetryPolicy};
pub use sink::{Sink, TargetKind};
pub use watchdog::{AlertState, Notifier, PollOutcome, Watchdog, WatchdogConfig, WatchdogNotice};

// Re-export brokers for convenience
pub use broker::memory::{MemoryBroker, MemoryConfig};
pub use broker::nats::{NatsBroker, NatsConfig, StorageType};
