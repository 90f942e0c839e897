// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Router configuration types and parsing.
//!
//! JSON5 configuration format supporting:
//! - PIM-enabled interfaces with DR priority and Candidate-BSR/RP roles
//! - Static RP mappings
//! - Protocol timers in (fractional) seconds, defaulting to RFC 4601/5059 values
//! - Comments and trailing commas
//!
//! ```json5
//! {
//!     interfaces: [
//!         { index: 1, address: "10.0.1.1", prefix_len: 24 },
//!         { index: 2, address: "10.0.2.1", prefix_len: 24, candidate_bsr_priority: 64 },
//!     ],
//!     static_rp: [{ rp: "10.0.0.5", group: { prefix: "224.0.0.0", mask_len: 4 } }],
//!     timers: { join_prune_period: 60 },
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::logging::Severity;
use crate::{GroupRange, IfIndex, ALL_MULTICAST, DEFAULT_SSM_RANGE};

// Default timer values (RFC 4601 section 4.11, RFC 5059 section 5)
pub const DEFAULT_HELLO_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_HELLO_HOLDTIME: Duration = Duration::from_secs(105); // 3.5 * Hello Period
pub const DEFAULT_TRIGGERED_HELLO_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_JOIN_PRUNE_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_JOIN_PRUNE_HOLDTIME: Duration = Duration::from_secs(210); // 3.5 * JP Period
pub const DEFAULT_JOIN_SUPPRESSION: Duration = Duration::from_secs(75); // 1.25 * JP Period
pub const DEFAULT_OVERRIDE_INTERVAL: Duration = Duration::from_millis(2500);
pub const DEFAULT_PROPAGATION_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(210);
pub const DEFAULT_REGISTER_SUPPRESSION: Duration = Duration::from_secs(60);
pub const DEFAULT_REGISTER_PROBE: Duration = Duration::from_secs(5);
pub const DEFAULT_ASSERT_TIME: Duration = Duration::from_secs(180);
pub const DEFAULT_ASSERT_OVERRIDE: Duration = Duration::from_secs(3);
pub const DEFAULT_BOOTSTRAP_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(130); // 2 * period + 10
pub const DEFAULT_CRP_ADV_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_CRP_HOLDTIME: Duration = Duration::from_secs(150); // 2.5 * adv period
pub const DEFAULT_CRP_BACKOFF: Duration = Duration::from_secs(3);
pub const DEFAULT_CRP_BACKOFF_ROUNDS: u8 = 3;

pub const DEFAULT_DR_PRIORITY: u32 = 1;
pub const DEFAULT_CANDIDATE_BSR_PRIORITY: u8 = 64;
pub const DEFAULT_CANDIDATE_RP_PRIORITY: u8 = 192;
pub const DEFAULT_HASH_MASK_LEN: u8 = 30;

/// Startup configuration of one router (JSON5 file format)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PimConfig {
    /// PIM-enabled interfaces
    pub interfaces: Vec<InterfaceConfig>,

    /// Static RP mappings; never expire and survive BSM reconciliation
    pub static_rp: Vec<StaticRpConfig>,

    /// Group ranges advertised when this router is a Candidate-RP.
    /// Empty means the whole multicast range.
    pub candidate_rp_groups: Vec<GroupRange>,

    /// Protocol timers
    pub timers: TimerConfig,

    /// When a last-hop router switches from the shared tree to the SPT
    pub spt_threshold: SptThreshold,

    /// Groups with no RP and no shared tree
    pub ssm_range: GroupRange,

    /// Hash mask length used for RP selection until a BSR announces one
    pub hash_mask_len: u8,

    /// Return protocol invariant violations as errors instead of logging them
    pub strict_invariants: bool,

    /// Seed for generation IDs and randomized delays; random when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,

    /// Minimum severity for the router's logger; the logger keeps its own
    /// level when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<Severity>,
}

impl Default for PimConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            static_rp: Vec::new(),
            candidate_rp_groups: Vec::new(),
            timers: TimerConfig::default(),
            spt_threshold: SptThreshold::default(),
            ssm_range: DEFAULT_SSM_RANGE,
            hash_mask_len: DEFAULT_HASH_MASK_LEN,
            strict_invariants: false,
            random_seed: None,
            log_level: None,
        }
    }
}

/// Per-interface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceConfig {
    /// Interface index as known to the embedding system
    pub index: IfIndex,

    /// Primary address of this router on the interface
    pub address: Ipv4Addr,

    /// Subnet prefix length, used to recognize directly-connected sources
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// DR priority advertised in Hello
    #[serde(default = "default_dr_priority")]
    pub dr_priority: u32,

    /// Run the Candidate-BSR machine on this interface with this priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_bsr_priority: Option<u8>,

    /// Advertise this interface address as a Candidate-RP with this priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_rp_priority: Option<u8>,
}

fn default_prefix_len() -> u8 {
    24
}

fn default_dr_priority() -> u32 {
    DEFAULT_DR_PRIORITY
}

impl InterfaceConfig {
    /// Interface with default priority and no BSR/RP role
    pub fn new(index: u32, address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            index: IfIndex(index),
            address,
            prefix_len,
            dr_priority: DEFAULT_DR_PRIORITY,
            candidate_bsr_priority: None,
            candidate_rp_priority: None,
        }
    }
}

/// Static group-to-RP mapping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticRpConfig {
    pub rp: Ipv4Addr,
    #[serde(default = "default_group_range")]
    pub group: GroupRange,
    #[serde(default)]
    pub priority: u8,
}

fn default_group_range() -> GroupRange {
    ALL_MULTICAST
}

/// SPT switchover policy at last-hop routers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SptThreshold {
    /// Switch once this many packets of an (S,G) arrived over the shared tree
    Packets(u64),
    /// Never switch
    #[default]
    Infinity,
}

/// Protocol timers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimerConfig {
    #[serde(with = "secs")]
    pub hello_period: Duration,
    #[serde(with = "secs")]
    pub hello_holdtime: Duration,
    #[serde(with = "secs")]
    pub triggered_hello_delay: Duration,
    #[serde(with = "secs")]
    pub join_prune_period: Duration,
    #[serde(with = "secs")]
    pub join_prune_holdtime: Duration,
    #[serde(with = "secs")]
    pub join_suppression: Duration,
    #[serde(with = "secs")]
    pub override_interval: Duration,
    #[serde(with = "secs")]
    pub propagation_delay: Duration,
    #[serde(with = "secs")]
    pub keepalive_period: Duration,
    #[serde(with = "secs")]
    pub register_suppression: Duration,
    #[serde(with = "secs")]
    pub register_probe: Duration,
    #[serde(with = "secs")]
    pub assert_time: Duration,
    #[serde(with = "secs")]
    pub assert_override: Duration,
    #[serde(with = "secs")]
    pub bootstrap_period: Duration,
    #[serde(with = "secs")]
    pub bootstrap_timeout: Duration,
    #[serde(with = "secs")]
    pub crp_adv_period: Duration,
    #[serde(with = "secs")]
    pub crp_holdtime: Duration,
    #[serde(with = "secs")]
    pub crp_backoff: Duration,
    pub crp_backoff_rounds: u8,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            hello_period: DEFAULT_HELLO_PERIOD,
            hello_holdtime: DEFAULT_HELLO_HOLDTIME,
            triggered_hello_delay: DEFAULT_TRIGGERED_HELLO_DELAY,
            join_prune_period: DEFAULT_JOIN_PRUNE_PERIOD,
            join_prune_holdtime: DEFAULT_JOIN_PRUNE_HOLDTIME,
            join_suppression: DEFAULT_JOIN_SUPPRESSION,
            override_interval: DEFAULT_OVERRIDE_INTERVAL,
            propagation_delay: DEFAULT_PROPAGATION_DELAY,
            keepalive_period: DEFAULT_KEEPALIVE_PERIOD,
            register_suppression: DEFAULT_REGISTER_SUPPRESSION,
            register_probe: DEFAULT_REGISTER_PROBE,
            assert_time: DEFAULT_ASSERT_TIME,
            assert_override: DEFAULT_ASSERT_OVERRIDE,
            bootstrap_period: DEFAULT_BOOTSTRAP_PERIOD,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            crp_adv_period: DEFAULT_CRP_ADV_PERIOD,
            crp_holdtime: DEFAULT_CRP_HOLDTIME,
            crp_backoff: DEFAULT_CRP_BACKOFF,
            crp_backoff_rounds: DEFAULT_CRP_BACKOFF_ROUNDS,
        }
    }
}

impl TimerConfig {
    /// Keepalive the RP applies when it answers a Register with Register-Stop
    pub fn rp_keepalive_period(&self) -> Duration {
        self.keepalive_period
            .max(self.register_suppression * 3 + self.register_probe)
    }

    /// Delay before a PrunePending interface prunes, given its neighbor count
    pub fn prune_pending_delay(&self, neighbors: usize) -> Duration {
        if neighbors <= 1 {
            Duration::ZERO
        } else {
            self.override_interval + self.propagation_delay
        }
    }
}

/// Durations as (fractional) seconds
mod secs {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(D::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {}",
                secs
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

impl PimConfig {
    /// Load configuration from a JSON5 file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize configuration to a JSON5-compatible string
    pub fn to_json5(&self) -> String {
        // json5 has no pretty printer; JSON output is valid JSON5 input
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_indices = HashSet::new();
        let mut seen_addresses = HashSet::new();
        for iface in &self.interfaces {
            if !seen_indices.insert(iface.index) {
                return Err(ConfigError::DuplicateInterface { index: iface.index });
            }
            if !seen_addresses.insert(iface.address) {
                return Err(ConfigError::DuplicateAddress {
                    address: iface.address,
                });
            }
            if iface.prefix_len > 32 {
                return Err(ConfigError::InvalidMaskLength {
                    mask_len: iface.prefix_len,
                    context: format!("interface {}", iface.index),
                });
            }
            if iface.address.is_multicast() || iface.address.is_unspecified() {
                return Err(ConfigError::InvalidUnicastAddress {
                    address: iface.address,
                    context: format!("interface {}", iface.index),
                });
            }
        }

        for (idx, mapping) in self.static_rp.iter().enumerate() {
            validate_group_range(&mapping.group, &format!("static_rp {}", idx))?;
            if mapping.rp.is_multicast() || mapping.rp.is_unspecified() {
                return Err(ConfigError::InvalidUnicastAddress {
                    address: mapping.rp,
                    context: format!("static_rp {}", idx),
                });
            }
        }

        for (idx, range) in self.candidate_rp_groups.iter().enumerate() {
            validate_group_range(range, &format!("candidate_rp_groups {}", idx))?;
        }
        validate_group_range(&self.ssm_range, "ssm_range")?;

        if self.hash_mask_len > 32 {
            return Err(ConfigError::InvalidMaskLength {
                mask_len: self.hash_mask_len,
                context: "hash_mask_len".to_string(),
            });
        }

        let timers = &self.timers;
        if timers.hello_period.is_zero() {
            return Err(ConfigError::InvalidTimer {
                name: "hello_period",
                reason: "must be non-zero".to_string(),
            });
        }
        if timers.join_prune_period.is_zero() {
            return Err(ConfigError::InvalidTimer {
                name: "join_prune_period",
                reason: "must be non-zero".to_string(),
            });
        }
        if timers.hello_holdtime < timers.hello_period {
            return Err(ConfigError::InvalidTimer {
                name: "hello_holdtime",
                reason: "shorter than hello_period".to_string(),
            });
        }
        if timers.join_prune_holdtime < timers.join_prune_period {
            return Err(ConfigError::InvalidTimer {
                name: "join_prune_holdtime",
                reason: "shorter than join_prune_period".to_string(),
            });
        }
        if timers.assert_time <= timers.assert_override {
            return Err(ConfigError::InvalidTimer {
                name: "assert_time",
                reason: "must exceed assert_override".to_string(),
            });
        }
        for (name, value) in [
            ("hello_holdtime", timers.hello_holdtime),
            ("join_prune_holdtime", timers.join_prune_holdtime),
            ("crp_holdtime", timers.crp_holdtime),
        ] {
            if value.as_secs() > u64::from(u16::MAX) {
                return Err(ConfigError::InvalidTimer {
                    name,
                    reason: "does not fit the 16-bit holdtime field".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Configuration of one interface
    pub fn interface(&self, index: IfIndex) -> Option<&InterfaceConfig> {
        self.interfaces.iter().find(|i| i.index == index)
    }
}

fn validate_group_range(range: &GroupRange, context: &str) -> Result<(), ConfigError> {
    if range.mask_len > 32 {
        return Err(ConfigError::InvalidMaskLength {
            mask_len: range.mask_len,
            context: context.to_string(),
        });
    }
    if !range.prefix.is_multicast() || range.mask_len < 4 {
        return Err(ConfigError::InvalidGroupRange {
            range: *range,
            context: context.to_string(),
        });
    }
    Ok(())
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    IoError(std::path::PathBuf, String),
    ParseError(String),
    DuplicateInterface {
        index: IfIndex,
    },
    DuplicateAddress {
        address: Ipv4Addr,
    },
    InvalidMaskLength {
        mask_len: u8,
        context: String,
    },
    InvalidGroupRange {
        range: GroupRange,
        context: String,
    },
    InvalidUnicastAddress {
        address: Ipv4Addr,
        context: String,
    },
    InvalidTimer {
        name: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, msg) => {
                write!(
                    f,
                    "failed to read config file '{}': {}",
                    path.display(),
                    msg
                )
            }
            ConfigError::ParseError(msg) => write!(f, "failed to parse config: {}", msg),
            ConfigError::DuplicateInterface { index } => {
                write!(f, "interface {} configured more than once", index)
            }
            ConfigError::DuplicateAddress { address } => {
                write!(f, "address {} used on more than one interface", address)
            }
            ConfigError::InvalidMaskLength { mask_len, context } => {
                write!(f, "invalid mask length {} in {}", mask_len, context)
            }
            ConfigError::InvalidGroupRange { range, context } => {
                write!(f, "invalid multicast group range {} in {}", range, context)
            }
            ConfigError::InvalidUnicastAddress { address, context } => {
                write!(f, "invalid unicast address {} in {}", address, context)
            }
            ConfigError::InvalidTimer { name, reason } => {
                write!(f, "invalid timer {}: {}", name, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
