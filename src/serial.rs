//! Serial ingestion
//!
//! A blocking read loop owns the frame extractor and normalizer. It runs on
//! a dedicated blocking thread and hands each [`Message`] to the async side
//! over a bounded channel, so it never waits for delivery. On disconnect
//! the partial frame is dropped and the port is reopened after a backoff.

use crate::error::{RelayError, Result};
use crate::frame::FrameExtractor;
use crate::message::{Message, Normalizer};
use crate::retry::RetryPolicy;
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Opens the byte source for a port name
pub trait SerialOpener: Send + Sync {
    fn open(&self, port: &str) -> Result<Box<dyn Read + Send>>;
}

/// Opens a real serial device, 8N1 with no flow control
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    baud_rate: u32,
    read_timeout: Duration,
}

#[cfg(feature = "serial")]
impl SerialPortOpener {
    pub fn new(baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            baud_rate,
            read_timeout,
        }
    }
}

#[cfg(feature = "serial")]
impl SerialOpener for SerialPortOpener {
    fn open(&self, port: &str) -> Result<Box<dyn Read + Send>> {
        let handle = serialport::new(port, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| RelayError::serial(port, e))?;
        Ok(Box::new(handle))
    }
}

/// Counters reported when the read loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadLoopStats {
    pub connects: u64,
    pub disconnects: u64,
    pub bytes: u64,
    pub messages: u64,
}

pub struct ReadLoop {
    port: String,
    opener: Arc<dyn SerialOpener>,
    extractor: FrameExtractor,
    normalizer: Normalizer,
    reconnect: RetryPolicy,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    stats: ReadLoopStats,
}

impl ReadLoop {
    pub fn new(
        port: impl Into<String>,
        opener: Arc<dyn SerialOpener>,
        extractor: FrameExtractor,
        normalizer: Normalizer,
        reconnect: RetryPolicy,
        tx: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port: port.into(),
            opener,
            extractor,
            normalizer,
            reconnect,
            tx,
            cancel,
            stats: ReadLoopStats::default(),
        }
    }

    /// Read until cancelled or the receiver is dropped.
    ///
    /// Failing to open the port on the first try is returned as an error;
    /// later failures only delay the next reconnect.
    pub fn run(mut self) -> Result<ReadLoopStats> {
        let mut failures = 0u32;
        let mut buf = [0u8; 1024];

        while !self.cancel.is_cancelled() {
            let mut reader = match self.opener.open(&self.port) {
                Ok(reader) => reader,
                Err(e) if self.stats.connects == 0 => return Err(e),
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::error!(port = %self.port, error = %e, "Reconnect failed");
                    self.pause(failures);
                    continue;
                }
            };
            self.stats.connects += 1;
            failures = 0;
            tracing::info!(port = %self.port, "Connected to serial port");

            match self.pump(reader.as_mut(), &mut buf) {
                Pump::Cancelled | Pump::ReceiverClosed => break,
                Pump::Disconnected(e) => {
                    tracing::error!(error = %e, "Serial read failed");
                }
            }

            drop(reader);
            self.stats.disconnects += 1;
            self.extractor.reset();
            tracing::info!(port = %self.port, "Closed serial port, reconnecting");
            failures = failures.saturating_add(1);
            self.pause(failures);
        }

        tracing::info!(
            port = %self.port,
            messages = self.stats.messages,
            discarded = self.extractor.stats().discarded(),
            "Serial read loop stopped"
        );
        Ok(self.stats)
    }

    fn pump(&mut self, reader: &mut (dyn Read + Send), buf: &mut [u8]) -> Pump {
        loop {
            if self.cancel.is_cancelled() {
                return Pump::Cancelled;
            }
            let n = match reader.read(buf) {
                Ok(0) => {
                    return Pump::Disconnected(RelayError::serial(&self.port, "end of stream"));
                }
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Pump::Disconnected(RelayError::serial(&self.port, e)),
            };
            self.stats.bytes += n as u64;

            for frame in self.extractor.feed(&buf[..n]) {
                let message = self.normalizer.normalize(&frame);
                tracing::debug!(body = %message.body(), "Frame normalized");
                if self.tx.blocking_send(message).is_err() {
                    return Pump::ReceiverClosed;
                }
                self.stats.messages += 1;
            }
        }
    }

    /// Sleep before reconnect attempt, waking early on cancellation
    fn pause(&self, failures: u32) {
        let delay = self
            .reconnect
            .delay_for_attempt(failures, &mut rand::thread_rng());
        let deadline = std::time::Instant::now() + delay;
        while !self.cancel.is_cancelled() {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }
}

enum Pump {
    Cancelled,
    ReceiverClosed,
    Disconnected(RelayError),
}
