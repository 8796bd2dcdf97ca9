use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-channel position of a message. Starts at 1 and is never reused.
pub type SequenceId = i64;

/// Row of the `messages` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    pub sequence_id: SequenceId,
    pub payload: Vec<u8>,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Retention bookkeeping for a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelWatermark {
    /// Highest sequence id handed out so far (0 when nothing was published)
    pub last_sequence_id: SequenceId,
    /// Every message at or below this id may have been pruned
    pub pruned_through: SequenceId,
}

impl ChannelWatermark {
    /// A cursor below `pruned_through` would skip pruned messages.
    pub fn cursor_lags(&self, cursor: SequenceId) -> bool {
        cursor < self.pruned_through
    }
}
