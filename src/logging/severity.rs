// SPDX-License-Identifier: Apache-2.0 OR MIT
// Severity levels (RFC 5424 numbering)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Log severity, lower is more severe
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Engine cannot continue (strict-mode invariant violation)
    Error = 3,
    /// Recoverable anomaly (invariant violation in tolerance mode, missing RP)
    Warning = 4,
    /// Significant protocol event (DR change, BSR elected, neighbor lost)
    Notice = 5,
    /// State machine transitions
    Info = 6,
    /// Per-packet traces and dropped malformed packets
    Debug = 7,
}

const ALL: [Severity; 5] = [
    Severity::Error,
    Severity::Warning,
    Severity::Notice,
    Severity::Info,
    Severity::Debug,
];

impl Severity {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        ALL.into_iter().find(|s| s.as_u8() == value)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
            Severity::Info => "info",
            Severity::Debug => "debug",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    /// Case-insensitive level name; "warn" is accepted for warning
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower == "warn" {
            return Ok(Severity::Warning);
        }
        ALL.into_iter()
            .find(|level| level.as_str() == lower)
            .ok_or_else(|| format!("unknown log level '{}'", s))
    }
}
