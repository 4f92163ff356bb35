//! Fixed-capacity output ring for one channel.

use crate::log::{Channel, LogEntry};
use chrono::Utc;
use std::collections::VecDeque;

pub const DEFAULT_RING_CAPACITY: usize = 1000;

/// Append-only store that evicts the oldest entry once `capacity` is reached.
///
/// Sequences start at 1 and increase by one per push, so the retained entries always form a
/// contiguous run `first_sequence()..=last_sequence()`.
#[derive(Debug, Clone)]
pub struct LogRing {
    channel: Channel,
    entries: VecDeque<LogEntry>,
    capacity: usize,
    last_sequence: u64,
}

impl LogRing {
    pub fn new(channel: Channel, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            channel,
            entries: VecDeque::with_capacity(capacity),
            capacity,
            last_sequence: 0,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence of the newest entry ever pushed, 0 before the first push.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Sequence of the oldest retained entry.
    pub fn first_sequence(&self) -> Option<u64> {
        self.entries.front().map(|entry| entry.sequence)
    }

    /// Append a line, evicting exactly one entry when full, and return the stored entry.
    pub fn push(&mut self, text: impl Into<String>, error: bool) -> LogEntry {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.last_sequence += 1;
        let entry = LogEntry {
            channel: self.channel,
            sequence: self.last_sequence,
            timestamp: Utc::now(),
            text: text.into(),
            error,
        };
        self.entries.push_back(entry.clone());
        entry
    }

    /// Copy of every retained entry with `sequence > after` (all of them when `after` is None).
    pub fn after(&self, after: Option<u64>) -> Vec<LogEntry> {
        let Some(after) = after else {
            return self.entries.iter().cloned().collect();
        };
        let start = self.entries.partition_point(|entry| entry.sequence <= after);
        self.entries.range(start..).cloned().collect()
    }

    /// Like `after`, keeping only the newest `limit` entries.
    pub fn tail_after(&self, after: Option<u64>, limit: usize) -> Vec<LogEntry> {
        let mut entries = self.after(after);
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}
