// SPDX-License-Identifier: Apache-2.0 OR MIT
// Structured logging for the PIM engine
//
// Every engine component logs through a cloned Logger handle with its own
// Facility. Entries go to a LogSink: a bounded in-memory ring for embedders
// and tests, or JSON lines on stderr.

mod entry;
mod facility;
mod logger;
#[macro_use]
mod macros;
mod severity;
mod sink;

// Public exports
pub use entry::{KeyValue, LogEntry};
pub use facility::Facility;
pub use logger::Logger;
pub use severity::Severity;
pub use sink::{LogSink, RingBufferSink, StderrJsonSink};
