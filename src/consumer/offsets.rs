//! Per-partition offset bookkeeping
//!
//! Two watermarks per partition: `resolved` tracks the highest offset whose
//! batch slot finished (successfully or not), `committable` tracks the
//! highest offset whose commit callback actually ran. Only the latter is
//! ever committed to the broker.

use parking_lot::Mutex;
use std::collections::HashMap;

type PartitionKey = (String, i32);

/// Monotonic offset watermarks, shared between the batch path and the
/// commit step.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    resolved: Mutex<HashMap<PartitionKey, i64>>,
    committable: Mutex<HashMap<PartitionKey, i64>>,
}

impl OffsetTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a message as handled within its batch.
    pub fn resolve(&self, topic: &str, partition: i32, offset: i64) {
        Self::raise(&mut self.resolved.lock(), topic, partition, offset);
    }

    /// Marks a message's offset as eligible for the next broker commit.
    pub fn mark_committable(&self, topic: &str, partition: i32, offset: i64) {
        Self::raise(&mut self.committable.lock(), topic, partition, offset);
    }

    /// Highest resolved offset for a partition, if any.
    pub fn resolved_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.resolved.lock().get(&(topic.to_string(), partition)).copied()
    }

    /// Whether any offset is waiting to be committed.
    pub fn has_committable(&self) -> bool {
        !self.committable.lock().is_empty()
    }

    /// Drains every committable offset, leaving the tracker ready for the
    /// next batch.
    pub fn take_committable(&self) -> Vec<(String, i32, i64)> {
        self.committable
            .lock()
            .drain()
            .map(|((topic, partition), offset)| (topic, partition, offset))
            .collect()
    }

    fn raise(map: &mut HashMap<PartitionKey, i64>, topic: &str, partition: i32, offset: i64) {
        let entry = map.entry((topic.to_string(), partition)).or_insert(offset);
        if *entry < offset {
            *entry = offset;
        }
    }
}
