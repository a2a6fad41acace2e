//! Frame extraction from the ENDEC serial stream
//!
//! The ENDEC writes alert text wrapped in literal markers:
//! `<ENDECSTART> ... <ENDECEND>`. Reads from the serial port arrive in
//! arbitrary chunks, so a marker or a whole frame may be split across
//! many calls to [`FrameExtractor::feed`].
//!
//! State machine:
//! - `Idle`: looking for a start marker, everything else is noise
//! - `InFrame`: accumulating bytes until the end marker
//!
//! # Example
//!
//! ```
//! use endec_relay::frame::FrameExtractor;
//!
//! let mut extractor = FrameExtractor::new();
//! assert!(extractor.feed(b"noise<ENDECSTART>ZCZC-").is_empty());
//!
//! let frames = extractor.feed(b"EAS-RWT-<ENDECEND>more");
//! assert_eq!(frames.len(), 1);
//! assert_eq!(&frames[0].content[..], b"ZCZC-EAS-RWT-");
//! ```

use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Literal marker opening a frame
pub const START_MARKER: &[u8] = b"<ENDECSTART>";

/// Literal marker closing a frame
pub const END_MARKER: &[u8] = b"<ENDECEND>";

/// Default upper bound on the size of one frame's content
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Bytes retained between reads so a split marker is still recognised
const MARKER_TAIL: usize = max_marker_len() - 1;

const fn max_marker_len() -> usize {
    if START_MARKER.len() > END_MARKER.len() {
        START_MARKER.len()
    } else {
        END_MARKER.len()
    }
}

/// What to do with a start marker seen while a frame is already open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestedStartPolicy {
    /// Drop the partial frame and start a new one at the marker
    #[default]
    Restart,
    /// Keep the embedded marker as ordinary frame content
    Ignore,
}

/// Why bytes were dropped without producing a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// End marker with no open frame
    OrphanEnd,
    /// Open frame abandoned because a new start marker arrived
    Restarted,
    /// Open frame grew past the size limit
    Oversized,
    /// Open frame abandoned because the source disconnected
    Reset,
}

/// One complete frame: the bytes strictly between the markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub content: Bytes,
    pub received_at: DateTime<Utc>,
}

/// Running totals kept by the extractor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractorStats {
    pub frames: u64,
    pub orphan_ends: u64,
    pub restarted: u64,
    pub oversized: u64,
    pub resets: u64,
}

impl ExtractorStats {
    /// Total frames or fragments dropped for any reason
    pub fn discarded(&self) -> u64 {
        self.orphan_ends + self.restarted + self.oversized + self.resets
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    /// `scan_from` skips bytes already searched for markers
    InFrame { scan_from: usize },
}

/// Reassembles marker-delimited frames from a chunked byte stream
pub struct FrameExtractor {
    pending: BytesMut,
    state: State,
    policy: NestedStartPolicy,
    max_frame_bytes: usize,
    stats: ExtractorStats,
}

impl FrameExtractor {
    /// Create an extractor with the default policy and size limit
    pub fn new() -> Self {
        Self::with_policy(NestedStartPolicy::default(), DEFAULT_MAX_FRAME_BYTES)
    }

    /// Create an extractor with an explicit nested-start policy and size limit
    pub fn with_policy(policy: NestedStartPolicy, max_frame_bytes: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(4 * 1024),
            state: State::Idle,
            policy,
            max_frame_bytes,
            stats: ExtractorStats::default(),
        }
    }

    /// Push a chunk and return every frame it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.feed_at(chunk, Utc::now())
    }

    /// Like [`feed`](Self::feed), stamping completed frames with `now`
    pub fn feed_at(&mut self, chunk: &[u8], now: DateTime<Utc>) -> Vec<RawFrame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(step) = self.step() {
            if let Some(content) = step {
                self.stats.frames += 1;
                frames.push(RawFrame {
                    content,
                    received_at: now,
                });
            }
        }
        frames
    }

    /// Drop any partially accumulated frame and return to `Idle`
    pub fn reset(&mut self) {
        if self.in_frame() {
            self.discard(DiscardReason::Reset, self.pending.len());
        }
        self.pending.clear();
        self.state = State::Idle;
    }

    /// Whether a frame is currently open
    pub fn in_frame(&self) -> bool {
        matches!(self.state, State::InFrame { .. })
    }

    /// Bytes currently buffered (frame content or retained noise tail)
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ExtractorStats {
        self.stats
    }

    pub fn policy(&self) -> NestedStartPolicy {
        self.policy
    }

    /// Advance the state machine once.
    ///
    /// - `None`: more input is needed
    /// - `Some(None)`: state changed, call again
    /// - `Some(Some(frame))`: a frame completed
    fn step(&mut self) -> Option<Option<Bytes>> {
        match self.state {
            State::Idle => {
                let start = find(&self.pending, START_MARKER, 0);
                let end = find(&self.pending, END_MARKER, 0);
                match (start, end) {
                    (Some(s), e) if e.map_or(true, |e| s < e) => {
                        self.pending.advance(s + START_MARKER.len());
                        self.state = State::InFrame { scan_from: 0 };
                        Some(None)
                    }
                    (_, Some(e)) => {
                        self.discard(DiscardReason::OrphanEnd, 0);
                        self.pending.advance(e + END_MARKER.len());
                        Some(None)
                    }
                    _ => {
                        let noise = self.pending.len().saturating_sub(MARKER_TAIL);
                        self.pending.advance(noise);
                        None
                    }
                }
            }
            State::InFrame { scan_from } => {
                let end = find(&self.pending, END_MARKER, scan_from);
                let nested = match self.policy {
                    NestedStartPolicy::Restart => find(&self.pending, START_MARKER, scan_from),
                    NestedStartPolicy::Ignore => None,
                };
                match (nested, end) {
                    (Some(s), e) if e.map_or(true, |e| s < e) => {
                        self.discard(DiscardReason::Restarted, s);
                        self.pending.advance(s + START_MARKER.len());
                        self.state = State::InFrame { scan_from: 0 };
                        Some(None)
                    }
                    (_, Some(e)) => {
                        let content = self.pending.split_to(e).freeze();
                        self.pending.advance(END_MARKER.len());
                        self.state = State::Idle;
                        if content.len() > self.max_frame_bytes {
                            self.discard(DiscardReason::Oversized, content.len());
                            return Some(None);
                        }
                        Some(Some(content))
                    }
                    _ => {
                        // The tail may be the first half of a marker, only the rest is content
                        let confirmed = self.pending.len().saturating_sub(MARKER_TAIL);
                        if confirmed > self.max_frame_bytes {
                            self.discard(DiscardReason::Oversized, confirmed);
                            self.pending.advance(confirmed);
                            self.state = State::Idle;
                        } else {
                            self.state = State::InFrame {
                                scan_from: self.pending.len().saturating_sub(MARKER_TAIL),
                            };
                        }
                        None
                    }
                }
            }
        }
    }

    fn discard(&mut self, reason: DiscardReason, dropped_bytes: usize) {
        match reason {
            DiscardReason::OrphanEnd => self.stats.orphan_ends += 1,
            DiscardReason::Restarted => self.stats.restarted += 1,
            DiscardReason::Oversized => self.stats.oversized += 1,
            DiscardReason::Reset => self.stats.resets += 1,
        }
        tracing::warn!(reason = ?reason, dropped_bytes, "Frame discarded");
    }
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
