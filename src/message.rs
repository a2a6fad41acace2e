//! Message normalization
//!
//! Turns a raw frame into the immutable [`Message`] handed to every sink.
//! Frame text is split into lines, each line trimmed and blank lines
//! dropped. By convention the final line of an ENDEC frame is the
//! machine-readable `ZCZC-ORG-EEE-PSSCCC+TTTT-JJJHHMM-LLLLLLLL-` code line.

use crate::frame::RawFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of the EAS header code line
pub const ALERT_LINE_PREFIX: &str = "ZCZC-";

/// A normalized alert, never mutated after creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    body: String,
    header_line: Option<String>,
    received_at: DateTime<Utc>,
    source_port: String,
}

impl Message {
    pub fn new(
        body: impl Into<String>,
        header_line: Option<String>,
        received_at: DateTime<Utc>,
        source_port: impl Into<String>,
    ) -> Self {
        Self {
            body: body.into(),
            header_line,
            received_at,
            source_port: source_port.into(),
        }
    }

    /// Text delivered as the main message content
    pub fn body(&self) -> &str {
        &self.body
    }

    /// The alert code line, when the normalization mode split it out
    pub fn header_line(&self) -> Option<&str> {
        self.header_line.as_deref()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Serial port the frame was read from
    pub fn source_port(&self) -> &str {
        &self.source_port
    }

    /// Header line to send separately, if it is not already the body
    pub fn separate_header(&self) -> Option<&str> {
        self.header_line().filter(|h| *h != self.body)
    }
}

/// Normalization switches, resolved once at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    /// Keep only the final (alert code) line
    pub trim_to_alert_line: bool,
    /// Drop all human-readable text, keep only the trimmed alert line
    pub quiet: bool,
    /// Keep the human-readable text as body and split the alert line out
    pub fork: bool,
}

/// Applies [`NormalizeOptions`] to frames from one serial port
#[derive(Debug, Clone)]
pub struct Normalizer {
    options: NormalizeOptions,
    source_port: String,
}

impl Normalizer {
    pub fn new(options: NormalizeOptions, source_port: impl Into<String>) -> Self {
        Self {
            options,
            source_port: source_port.into(),
        }
    }

    pub fn options(&self) -> NormalizeOptions {
        self.options
    }

    pub fn normalize(&self, frame: &RawFrame) -> Message {
        normalize(frame, self.options, &self.source_port)
    }
}

/// Normalize one raw frame
pub fn normalize(frame: &RawFrame, options: NormalizeOptions, source_port: &str) -> Message {
    let text = String::from_utf8_lossy(&frame.content);
    let mut lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let (body, header_line) = if options.quiet || options.trim_to_alert_line {
        let alert = lines.last().map(|l| l.to_string());
        (alert.clone().unwrap_or_default(), alert)
    } else if options.fork {
        let alert = lines.pop().map(str::to_string);
        (lines.join(" "), alert)
    } else {
        (lines.join(" "), None)
    };

    if let Some(line) = &header_line {
        if !line.starts_with(ALERT_LINE_PREFIX) {
            tracing::debug!(line = %line, "Final frame line does not look like an alert code");
        }
    }

    Message::new(body, header_line, frame.received_at, source_port)
}
