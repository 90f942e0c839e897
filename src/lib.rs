// SPDX-License-Identifier: Apache-2.0 OR MIT
//! PIM Sparse-Mode control-plane engine (RFC 4601) with Bootstrap Router
//! support (RFC 5059).
//!
//! The crate is organised the way a router runs the protocol:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`packet`] | Wire codecs for every PIM message type |
//! | [`router`] | The per-router engine: TIB, state machines, forwarding decision |
//! | [`env`] | Injected RPF resolver and local-membership oracle |
//! | [`timer`] | Epoch-stamped timer requests |
//! | [`driver`] | Tokio task that owns one router and fires its timers |
//! | [`config`] | JSON5 configuration |
//! | [`logging`] | Facility/severity structured logging |
//!
//! The engine itself never blocks and never touches a socket. Every entry point
//! takes the current time, mutates router state, and leaves packets, forwarded
//! copies and timer requests in a [`router::RouterOutput`] for the caller to
//! act on.

pub mod logging;

pub mod config;
pub mod driver;
pub mod env;
pub mod error;
pub mod packet;
pub mod router;
pub mod timer;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

pub use config::PimConfig;
pub use env::{Environment, MembershipOracle, RpfResolver, RpfRoute, StaticEnvironment};
pub use error::PimError;
pub use packet::{DataPacket, PimMessage};
pub use router::{MembershipChange, Router, RouterOutput};

/// Index of a PIM-enabled interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IfIndex(pub u32);

impl fmt::Display for IfIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// The whole IPv4 multicast space (224.0.0.0/4).
pub const ALL_MULTICAST: GroupRange = GroupRange {
    prefix: Ipv4Addr::new(224, 0, 0, 0),
    mask_len: 4,
};

/// Default source-specific multicast range (232.0.0.0/8).
pub const DEFAULT_SSM_RANGE: GroupRange = GroupRange {
    prefix: Ipv4Addr::new(232, 0, 0, 0),
    mask_len: 8,
};

/// A multicast group prefix, as carried in RP mappings and Encoded-Group
/// addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupRange {
    pub prefix: Ipv4Addr,
    pub mask_len: u8,
}

impl GroupRange {
    /// Create a range, normalising the prefix to its mask.
    pub fn new(prefix: Ipv4Addr, mask_len: u8) -> Self {
        let mask_len = mask_len.min(32);
        Self {
            prefix: Ipv4Addr::from(u32::from(prefix) & prefix_mask(mask_len)),
            mask_len,
        }
    }

    /// True if `address` falls inside this range.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        prefix_contains(self.prefix, self.mask_len, address)
    }
}

impl fmt::Display for GroupRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, self.mask_len)
    }
}

/// Netmask for a prefix length, as a host-order u32.
pub fn prefix_mask(len: u8) -> u32 {
    match len {
        0 => 0,
        l if l >= 32 => u32::MAX,
        l => u32::MAX << (32 - u32::from(l)),
    }
}

/// True if `address` is inside `prefix/len`.
pub fn prefix_contains(prefix: Ipv4Addr, len: u8, address: Ipv4Addr) -> bool {
    let mask = prefix_mask(len);
    u32::from(prefix) & mask == u32::from(address) & mask
}
