// SPDX-License-Identifier: Apache-2.0 OR MIT
// Log entry structure

use super::{Facility, Severity};
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum message length kept in an entry
pub const MAX_MESSAGE_LEN: usize = 160;

/// Maximum number of key-value pairs per entry
pub const MAX_KVS: usize = 2;

/// Key-value pair for structured logging
#[derive(Clone, PartialEq, Eq)]
pub struct KeyValue {
    key: String,
    value: String,
}

impl KeyValue {
    /// Create new key-value pair
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    /// Get key as string slice
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get value as string slice
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// One log record
#[derive(Clone)]
pub struct LogEntry {
    pub severity: Severity,
    pub facility: Facility,
    pub timestamp_ns: u64,
    pub sequence: u64,
    message: String,
    kvs: Vec<KeyValue>,
}

impl LogEntry {
    /// Create a new log entry, truncating the message at a char boundary
    pub fn new(severity: Severity, facility: Facility, message: &str) -> Self {
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);

        let mut end = message.len().min(MAX_MESSAGE_LEN);
        while !message.is_char_boundary(end) {
            end -= 1;
        }

        Self {
            severity,
            facility,
            timestamp_ns: monotonic_nanos(),
            sequence: SEQUENCE.fetch_add(1, Ordering::Relaxed),
            message: message[..end].to_string(),
            kvs: Vec::new(),
        }
    }

    /// Get message as string slice
    pub fn get_message(&self) -> &str {
        &self.message
    }

    /// Add a key-value pair (max 2 pairs)
    pub fn add_kv(&mut self, key: &str, value: &str) {
        if self.kvs.len() < MAX_KVS {
            self.kvs.push(KeyValue::new(key, value));
        }
    }

    /// Get key-value pairs
    pub fn get_kvs(&self) -> &[KeyValue] {
        &self.kvs
    }
}

impl std::fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("LogEntry");
        debug
            .field("severity", &self.severity)
            .field("facility", &self.facility)
            .field("message", &self.get_message());

        if !self.kvs.is_empty() {
            debug.field("kvs", &self.get_kvs());
        }

        debug.finish()
    }
}

/// Get monotonic nanoseconds since an arbitrary point
fn monotonic_nanos() -> u64 {
    use std::time::Instant;
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}
