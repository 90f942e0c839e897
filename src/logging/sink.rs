// SPDX-License-Identifier: Apache-2.0 OR MIT
// Log sinks: bounded in-memory ring and stderr JSON

use super::entry::LogEntry;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Destination for log entries
pub trait LogSink: Send + Sync {
    fn write(&self, entry: LogEntry);
}

/// Bounded lock-free ring of log entries.
///
/// When the ring is full the oldest entry is overwritten and counted in
/// [`RingBufferSink::overwritten`]. Consumers call [`RingBufferSink::drain`].
pub struct RingBufferSink {
    queue: ArrayQueue<LogEntry>,
    overwritten: AtomicU64,
}

impl RingBufferSink {
    /// Create a ring holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overwritten: AtomicU64::new(0),
        }
    }

    /// Remove and return every buffered entry, oldest first
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut entries = Vec::with_capacity(self.queue.len());
        while let Some(entry) = self.queue.pop() {
            entries.push(entry);
        }
        entries
    }

    /// Number of buffered entries
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Entries lost to overwrite since creation
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl LogSink for RingBufferSink {
    fn write(&self, entry: LogEntry) {
        if self.queue.force_push(entry).is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Simple stderr JSON logger (no buffering, one object per line)
pub struct StderrJsonSink;

impl LogSink for StderrJsonSink {
    fn write(&self, entry: LogEntry) {
        let mut log_msg = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "level": entry.severity.as_str(),
            "facility": entry.facility.as_str(),
            "message": entry.get_message(),
        });
        for kv in entry.get_kvs() {
            log_msg[kv.key()] = serde_json::Value::String(kv.value().to_string());
        }
        eprintln!("{}", log_msg);
    }
}
