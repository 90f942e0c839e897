// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Collaborators the engine consults but does not own: the unicast routing
//! table (for RPF) and local receiver membership (IGMP).

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::{prefix_contains, IfIndex};

/// Result of an RPF lookup toward an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpfRoute {
    pub interface: IfIndex,
    /// Unspecified when the address is on-link
    pub next_hop: Ipv4Addr,
    /// Admin distance of the route, used in assert metrics
    pub preference: u32,
    pub metric: u32,
}

impl RpfRoute {
    /// Route to an on-link address
    pub fn connected(interface: IfIndex) -> Self {
        Self {
            interface,
            next_hop: Ipv4Addr::UNSPECIFIED,
            preference: 0,
            metric: 0,
        }
    }

    pub fn via(interface: IfIndex, next_hop: Ipv4Addr) -> Self {
        Self {
            interface,
            next_hop,
            preference: 1,
            metric: 1,
        }
    }

    pub fn with_metric(mut self, preference: u32, metric: u32) -> Self {
        self.preference = preference;
        self.metric = metric;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.next_hop.is_unspecified()
    }

    /// The upstream neighbor this route points at, if any
    pub fn neighbor(&self) -> Option<Ipv4Addr> {
        (!self.is_connected()).then_some(self.next_hop)
    }
}

/// Next-hop resolution toward sources and RPs
pub trait RpfResolver {
    /// Best route toward `address`, or None when unreachable
    fn resolve(&self, address: Ipv4Addr) -> Option<RpfRoute>;
}

/// Local receiver interest, as learned by IGMP
pub trait MembershipOracle {
    /// Receivers on `interface` want `group` (from `source`, when given)
    fn includes(&self, group: Ipv4Addr, source: Option<Ipv4Addr>, interface: IfIndex) -> bool;

    /// Receivers on `interface` want `group` but not from `source`
    fn excludes(&self, _group: Ipv4Addr, _source: Ipv4Addr, _interface: IfIndex) -> bool {
        false
    }
}

/// Everything a router needs from its host
pub trait Environment: RpfResolver + MembershipOracle {}

impl<T: RpfResolver + MembershipOracle> Environment for T {}

#[derive(Debug, Clone)]
struct StaticRoute {
    prefix: Ipv4Addr,
    prefix_len: u8,
    route: RpfRoute,
}

/// In-memory routing table and membership set
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment {
    routes: Vec<StaticRoute>,
    members: BTreeSet<(Ipv4Addr, Option<Ipv4Addr>, IfIndex)>,
    excluded: BTreeSet<(Ipv4Addr, Ipv4Addr, IfIndex)>,
}

impl StaticEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the route for `prefix/prefix_len`
    pub fn add_route(&mut self, prefix: Ipv4Addr, prefix_len: u8, route: RpfRoute) {
        self.remove_route(prefix, prefix_len);
        self.routes.push(StaticRoute {
            prefix,
            prefix_len,
            route,
        });
    }

    /// Add an on-link subnet
    pub fn add_connected(&mut self, prefix: Ipv4Addr, prefix_len: u8, interface: IfIndex) {
        self.add_route(prefix, prefix_len, RpfRoute::connected(interface));
    }

    pub fn remove_route(&mut self, prefix: Ipv4Addr, prefix_len: u8) {
        self.routes
            .retain(|r| !(r.prefix == prefix && r.prefix_len == prefix_len));
    }

    /// Record receivers for `group` (or `(source, group)`) on `interface`
    pub fn join(&mut self, group: Ipv4Addr, source: Option<Ipv4Addr>, interface: IfIndex) {
        self.members.insert((group, source, interface));
    }

    pub fn leave(&mut self, group: Ipv4Addr, source: Option<Ipv4Addr>, interface: IfIndex) {
        self.members.remove(&(group, source, interface));
    }

    /// Record an IGMPv3 EXCLUDE for `source`
    pub fn exclude(&mut self, group: Ipv4Addr, source: Ipv4Addr, interface: IfIndex) {
        self.excluded.insert((group, source, interface));
    }
}

impl RpfResolver for StaticEnvironment {
    fn resolve(&self, address: Ipv4Addr) -> Option<RpfRoute> {
        self.routes
            .iter()
            .filter(|r| prefix_contains(r.prefix, r.prefix_len, address))
            .max_by_key(|r| r.prefix_len)
            .map(|r| r.route)
    }
}

impl MembershipOracle for StaticEnvironment {
    fn includes(&self, group: Ipv4Addr, source: Option<Ipv4Addr>, interface: IfIndex) -> bool {
        self.members.contains(&(group, source, interface))
    }

    fn excludes(&self, group: Ipv4Addr, source: Ipv4Addr, interface: IfIndex) -> bool {
        self.excluded.contains(&(group, source, interface))
    }
}
