// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging facilities (engine component identifiers)

use serde::{Deserialize, Serialize};

/// Logging facility - identifies which engine component generated the message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facility {
    // === Neighbor discovery ===
    /// Hello exchange, neighbor liveness, DR election
    Hello = 0,

    // === Tree maintenance ===
    /// Upstream and downstream Join/Prune state machines
    JoinPrune = 1,
    /// Assert forwarder election
    Assert = 2,
    /// Tree Information Base lifecycle
    Tib = 3,

    // === Rendezvous ===
    /// Register / Register-Stop handling
    Register = 4,
    /// BSR election and Candidate-RP advertisement
    Bootstrap = 5,
    /// RP-set maintenance and RP(G) selection
    RpMapping = 6,

    // === Data path ===
    /// Per-packet forwarding decision
    Forwarding = 7,

    // === Runtime ===
    /// Timer scheduling and expiry
    Timer = 8,
    /// Async driver task
    Driver = 9,
    /// Configuration loading and validation
    Config = 10,

    // === Testing and Utilities ===
    /// Test harness and fixtures
    Test = 11,

    /// Fallback for uncategorized messages
    Unknown = 255,
}

impl Facility {
    /// Get facility code as u8
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Get facility name as static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Hello => "Hello",
            Facility::JoinPrune => "JoinPrune",
            Facility::Assert => "Assert",
            Facility::Tib => "Tib",
            Facility::Register => "Register",
            Facility::Bootstrap => "Bootstrap",
            Facility::RpMapping => "RpMapping",
            Facility::Forwarding => "Forwarding",
            Facility::Timer => "Timer",
            Facility::Driver => "Driver",
            Facility::Config => "Config",
            Facility::Test => "Test",
            Facility::Unknown => "Unknown",
        }
    }

    /// Create from u8 value (returns Unknown if invalid)
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Facility::Hello,
            1 => Facility::JoinPrune,
            2 => Facility::Assert,
            3 => Facility::Tib,
            4 => Facility::Register,
            5 => Facility::Bootstrap,
            6 => Facility::RpMapping,
            7 => Facility::Forwarding,
            8 => Facility::Timer,
            9 => Facility::Driver,
            10 => Facility::Config,
            11 => Facility::Test,
            _ => Facility::Unknown,
        }
    }

    /// Check if this facility logs per data packet
    pub const fn is_high_frequency(self) -> bool {
        matches!(self, Facility::Forwarding | Facility::Timer)
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
