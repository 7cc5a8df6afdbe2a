//! # Transcript Assembly
//!
//! Rebuilds the final transcript from the stream of partial results.
//!
//! ## State Machine:
//! ```text
//! Listening ──error event──▶ Failed
//!     │
//!     └────final event────▶ Done
//! ```
//! Events that arrive after `Done` or `Failed` are ignored; the connection is
//! being torn down by then.
//!
//! ## Merge Rules:
//! - **Replace** (`pgs = "rpl"`): the upstream revised its hypothesis, so the text and
//!   the set of seen segments are cleared before the event is applied.
//! - **Append** (`pgs = "apd"` or absent): the event's segments extend the text.
//! - A segment whose `(begin, end, text)` was already applied is skipped. The upstream
//!   may retransmit the same window verbatim and it must not be counted twice.

use std::collections::HashSet;
use tracing::debug;

/// How an event's segments combine with the text accumulated so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Append,
    Replace,
}

/// One recognized window of audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptSegment {
    pub begin_ms: i64,
    pub end_ms: i64,
    pub text: String,
}

/// Identity of a segment for deduplication.
pub type SegmentId = (i64, i64, String);

impl TranscriptSegment {
    pub fn id(&self) -> SegmentId {
        (self.begin_ms, self.end_ms, self.text.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Listening,
    Done,
    Failed { code: i64, message: String },
}

/// Request-scoped transcript state.
#[derive(Debug)]
pub struct TranscriptAssembler {
    text: String,
    seen: HashSet<SegmentId>,
    phase: Phase,
}

impl Default for TranscriptAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            seen: HashSet::new(),
            phase: Phase::Listening,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_listening(&self) -> bool {
        self.phase == Phase::Listening
    }

    /// Record an upstream error. Moves to `Failed`.
    pub fn fail(&mut self, code: i64, message: impl Into<String>) {
        if self.is_listening() {
            self.phase = Phase::Failed {
                code,
                message: message.into(),
            };
        }
    }

    /// Apply one batch of segments. Moves to `Done` when `is_final` is set.
    pub fn apply(&mut self, segments: &[TranscriptSegment], mode: MergeMode, is_final: bool) {
        if !self.is_listening() {
            debug!("ignoring result after transcript was closed");
            return;
        }

        if mode == MergeMode::Replace {
            self.text.clear();
            self.seen.clear();
        }

        for segment in segments {
            if self.seen.insert(segment.id()) {
                self.text.push_str(&segment.text);
            }
        }

        if is_final {
            self.phase = Phase::Done;
        }
    }

    /// Close the transcript with whatever was accumulated (receive timeout).
    pub fn finish(&mut self) {
        if self.is_listening() {
            self.phase = Phase::Done;
        }
    }
}
