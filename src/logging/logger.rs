// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logger handle with global and per-facility severity filtering

use super::entry::LogEntry;
use super::sink::{LogSink, RingBufferSink, StderrJsonSink};
use super::{Facility, Severity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Logger handle for writing log entries
///
/// This is a lightweight handle that can be cloned and passed around.
/// The sink and the level filters are shared via Arc, so a level change made
/// through one clone applies to all of them.
pub struct Logger {
    sink: Arc<dyn LogSink>,
    /// Global minimum log level (default: Info)
    global_min_level: Arc<AtomicU8>,
    /// Per-facility minimum log levels
    facility_min_levels: Arc<RwLock<HashMap<Facility, Severity>>>,
}

impl Logger {
    /// Create a logger writing to `sink` at the default Info level
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            global_min_level: Arc::new(AtomicU8::new(Severity::Info as u8)),
            facility_min_levels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a logger that writes JSON directly to stderr
    pub fn stderr_json() -> Self {
        Self::new(Arc::new(StderrJsonSink))
    }

    /// Create a logger backed by an in-memory ring, returning the ring so the
    /// caller can drain it
    pub fn in_memory(capacity: usize) -> (Self, Arc<RingBufferSink>) {
        let ring = Arc::new(RingBufferSink::new(capacity));
        let logger = Self::new(Arc::clone(&ring) as Arc<dyn LogSink>);
        (logger, ring)
    }

    /// Check if a log message should be written based on severity filtering
    #[inline]
    fn should_log(&self, severity: Severity, facility: Facility) -> bool {
        // Facility-specific level overrides global
        let levels = self
            .facility_min_levels
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(&min_level) = levels.get(&facility) {
            return severity <= min_level;
        }
        drop(levels);

        let global_min = self.global_min_level.load(Ordering::Relaxed);
        (severity as u8) <= global_min
    }

    /// Write a log entry
    #[inline]
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if !self.should_log(severity, facility) {
            return;
        }

        self.sink.write(LogEntry::new(severity, facility, message));
    }

    /// Write a log entry with key-value pairs
    #[inline]
    pub fn log_kv(
        &self,
        severity: Severity,
        facility: Facility,
        message: &str,
        kvs: &[(&str, &str)],
    ) {
        if !self.should_log(severity, facility) {
            return;
        }

        let mut entry = LogEntry::new(severity, facility, message);
        for (key, value) in kvs.iter() {
            entry.add_kv(key, value);
        }
        self.sink.write(entry);
    }

    /// Log with error severity
    #[inline]
    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    /// Log with warning severity
    #[inline]
    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    /// Log with notice severity
    #[inline]
    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    /// Log with info severity
    #[inline]
    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    /// Log with debug severity
    #[inline]
    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }

    /// Set the global minimum log level
    pub fn set_global_level(&self, level: Severity) {
        self.global_min_level.store(level as u8, Ordering::Relaxed);
    }

    /// Get the global minimum log level
    pub fn global_level(&self) -> Severity {
        Severity::from_u8(self.global_min_level.load(Ordering::Relaxed)).unwrap_or(Severity::Info)
    }

    /// Set the minimum log level for a specific facility
    pub fn set_facility_level(&self, facility: Facility, level: Severity) {
        self.facility_min_levels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(facility, level);
    }

    /// Clear the facility-specific log level (fall back to global)
    pub fn clear_facility_level(&self, facility: Facility) {
        self.facility_min_levels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&facility);
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            global_min_level: Arc::clone(&self.global_min_level),
            facility_min_levels: Arc::clone(&self.facility_min_levels),
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("global_level", &self.global_level())
            .finish()
    }
}
