//! Rolling transcript window for the presentation layer.
//!
//! This is a live ticker, not a durable log: only the most recent fragments
//! are retained.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default number of fragments kept in the window.
pub const DEFAULT_WINDOW: usize = 6;

/// Who produced a transcript fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

/// One transcript fragment with its arrival sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub sequence: u64,
}

/// Bounded ring of transcript fragments, shared between the session
/// supervisor (writer) and the presentation layer (reader).
pub struct TranscriptFeed {
    inner: Mutex<Ring>,
}

struct Ring {
    entries: VecDeque<TranscriptEntry>,
    capacity: usize,
    next_sequence: u64,
}

impl TranscriptFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                next_sequence: 0,
            }),
        }
    }

    /// Append a fragment, evicting the oldest once the window is full.
    pub fn push(&self, speaker: Speaker, text: &str) {
        let mut ring = self.inner.lock().unwrap();
        let sequence = ring.next_sequence;
        ring.next_sequence += 1;
        ring.entries.push_back(TranscriptEntry {
            speaker,
            text: text.to_string(),
            sequence,
        });
        while ring.entries.len() > ring.capacity {
            ring.entries.pop_front();
        }
    }

    /// Current window contents, oldest first.
    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.inner.lock().unwrap().entries.iter().cloned().collect()
    }
}

impl Default for TranscriptFeed {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
