//! Pending acknowledgments written out on the next flush

use crate::protocol::{SeqNum, Timestamp};

/// Ordered list of (serial number, echoed timestamp) pairs to acknowledge.
///
/// No deduplication: Ack processing on the remote side is idempotent per
/// serial number, so a repeated entry only costs one extra segment.
#[derive(Debug, Default)]
pub struct AckList {
    entries: Vec<(SeqNum, Timestamp)>,
}

impl AckList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, serial_number: SeqNum, timestamp: Timestamp) {
        self.entries.push((serial_number, timestamp));
    }

    pub fn try_get_at(&self, index: usize) -> Option<(SeqNum, Timestamp)> {
        self.entries.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SeqNum, Timestamp)> + '_ {
        self.entries.iter().copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
