//! Recognition log.
//!
//! Keeps the most recent recognition entries in memory. Nothing is written
//! to disk; the oldest entry is evicted once the log is full.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::Name;

/// Maximum number of retained entries.
pub const MAX_LOG_ENTRIES: usize = 1000;

/// One identified face, as logged and published in `recognition` events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RecognitionEntry {
    pub timestamp_ms: u64,
    pub name: Name,
    pub confidence: f32,
    pub is_authorized: bool,
    /// True when this recognition opened the door.
    pub door_unlocked: bool,
}

pub struct RecognitionLog {
    entries: Mutex<VecDeque<RecognitionEntry>>,
    max_entries: usize,
}

impl RecognitionLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_LOG_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_entries.min(MAX_LOG_ENTRIES))),
            max_entries: max_entries.max(1),
        }
    }

    /// Append an entry, evicting the oldest at capacity.
    pub fn record(&self, entry: RecognitionEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// The last `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<RecognitionEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecognitionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: u64) -> RecognitionEntry {
        RecognitionEntry {
            timestamp_ms: i,
            name: format!("user{}", i),
            confidence: 0.9,
            is_authorized: true,
            door_unlocked: false,
        }
    }

    #[test]
    fn log_enforces_capacity() {
        let log = RecognitionLog::new();
        for i in 0..(MAX_LOG_ENTRIES as u64 + 10) {
            log.record(entry(i));
        }
        assert_eq!(log.len(), MAX_LOG_ENTRIES);
        let all = log.recent(usize::MAX);
        assert_eq!(all.first().map(|e| e.timestamp_ms), Some(10));
    }

    #[test]
    fn recent_returns_tail_in_order() {
        let log = RecognitionLog::with_capacity(5);
        for i in 0..4 {
            log.record(entry(i));
        }
        let tail: Vec<u64> = log.recent(2).iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(tail, vec![2, 3]);
        assert!(RecognitionLog::new().recent(10).is_empty());
    }
}
