// SPDX-License-Identifier: Apache-2.0 OR MIT
//! PIM-SM router engine (RFC 4601) with BSR (RFC 5059)
//!
//! A [`Router`] owns all protocol state of one router: interfaces and
//! neighbors, the TIB, the RP-set and the bootstrap machines. It is a plain
//! synchronous state object. Every entry point takes the current time,
//! mutates state, and leaves its side effects in a [`RouterOutput`]:
//!
//! | Output | Meaning |
//! |--------|---------|
//! | `packets` | PIM control messages to transmit |
//! | `forwarded` | Data packet copies to send out an interface |
//! | `timers` | Epoch-stamped timer requests to hand back on expiry |
//!
//! ## Evaluation cycle
//!
//! State machines react to events (received messages, timer expiry,
//! membership and route changes) by updating TIB entries. Each event is then
//! followed by one evaluation pass over the affected group: upstream
//! JoinDesired/PruneDesired, register and assert tracking predicates are
//! recomputed in TIB key order ((*,G) before (S,G) before (S,G,rpt)), the
//! resulting upstream transitions send their Join/Prune messages, and entries
//! left without state are collected.

mod assert;
mod bootstrap;
mod downstream;
mod forward;
mod interface;
mod join_prune;
mod olist;
mod register;
mod rp;
mod rp_change;
mod stats;
mod tib;
mod upstream;

pub use assert::{AssertClass, AssertMetric, AssertState};
pub use bootstrap::{BootstrapState, BsrInfo, BsrMachine, CandidateBsrState, NonCandidateBsrState};
pub use forward::{ForwardingRow, ForwardingTable};
pub use interface::{Neighbor, PimInterface};
pub use olist::OifList;
pub use rp::{rp_hash, GroupHashEntry, RpListEntry, RpOrigin, RpSet};
pub use stats::{MessageCounters, PimStats};
pub use tib::{
    DownstreamState, InterfaceState, RegisterState, Tib, TreeEntry, TreeKey, TreeType,
    UpstreamState,
};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::config::PimConfig;
use crate::env::Environment;
use crate::error::PimError;
use crate::logging::{Facility, Logger};
use crate::{log_debug, log_info, log_notice, log_warning};
use crate::packet::{DataPacket, PimMessage, ALL_PIM_ROUTERS};
use crate::timer::{EntryTimer, InterfaceTimer, Scheduler, TimerKind, TimerRequest};
use crate::IfIndex;

/// Local receiver change reported by IGMP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Join,
    Leave,
}

/// A PIM control message to transmit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket {
    /// Interface to send on; None for unicast routed via the unicast table
    pub interface: Option<IfIndex>,
    pub destination: Ipv4Addr,
    pub message: PimMessage,
}

/// A data packet copy to send out an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedPacket {
    pub interface: IfIndex,
    pub packet: DataPacket,
}

/// Side effects produced since the last [`Router::take_output`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterOutput {
    pub packets: Vec<OutgoingPacket>,
    pub forwarded: Vec<ForwardedPacket>,
    pub timers: Vec<TimerRequest>,
}

impl RouterOutput {
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty() && self.forwarded.is_empty() && self.timers.is_empty()
    }
}

/// One PIM-SM router
pub struct Router<E: Environment> {
    config: PimConfig,
    env: E,
    logger: Logger,
    rng: StdRng,
    scheduler: Scheduler,
    interfaces: BTreeMap<IfIndex, PimInterface>,
    tib: Tib,
    rp_set: RpSet,
    bootstrap: BootstrapState,
    forwarding: ForwardingTable,
    /// Local receivers as reported through `local_membership_changed`
    local_members: BTreeSet<(Ipv4Addr, Option<Ipv4Addr>, IfIndex)>,
    stats: PimStats,
    packets: Vec<OutgoingPacket>,
    forwarded: Vec<ForwardedPacket>,
}

impl<E: Environment> Router<E> {
    /// Build a router from a validated configuration. Interfaces start
    /// silent until [`Router::start`].
    pub fn new(config: PimConfig, env: E, logger: Logger) -> Result<Self, PimError> {
        config.validate()?;
        if let Some(level) = config.log_level {
            logger.set_global_level(level);
            log_notice!(logger, Facility::Config, &format!("PIM: log level set to {}", level));
        }

        let mut rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let interfaces = config
            .interfaces
            .iter()
            .map(|iface| (iface.index, PimInterface::new(iface, rng.gen())))
            .collect();

        let mut rp_set = RpSet::new();
        for mapping in &config.static_rp {
            rp_set.insert_static(mapping.rp, mapping.group, mapping.priority);
        }

        let bootstrap = BootstrapState::new(config.hash_mask_len, rng.gen());

        Ok(Self {
            config,
            env,
            logger,
            rng,
            scheduler: Scheduler::default(),
            interfaces,
            tib: Tib::new(),
            rp_set,
            bootstrap,
            forwarding: ForwardingTable::default(),
            local_members: BTreeSet::new(),
            stats: PimStats::default(),
            packets: Vec::new(),
            forwarded: Vec::new(),
        })
    }

    /// Enable every interface: send the first Hello and start the bootstrap
    /// and Candidate-RP machines
    pub fn start(&mut self, now: Instant) -> Result<(), PimError> {
        let indices: Vec<IfIndex> = self.interfaces.keys().copied().collect();
        for index in indices {
            self.start_interface(now, index)?;
        }
        log_info!(
            self.logger,
            Facility::Hello,
            &format!("PIM: started on {} interfaces", self.interfaces.len())
        );
        Ok(())
    }

    /// Drain packets, forwarded copies and timer requests
    pub fn take_output(&mut self) -> RouterOutput {
        RouterOutput {
            packets: std::mem::take(&mut self.packets),
            forwarded: std::mem::take(&mut self.forwarded),
            timers: self.scheduler.take(),
        }
    }

    /// Decode and dispatch a PIM message received on `interface` from `source`
    pub fn receive_control_packet(
        &mut self,
        now: Instant,
        interface: IfIndex,
        source: Ipv4Addr,
        data: &[u8],
    ) -> Result<(), PimError> {
        self.check_interface(interface)?;
        match PimMessage::decode(data) {
            Ok(message) => self.handle_message(now, interface, source, message),
            Err(e) => {
                self.stats.malformed += 1;
                log_debug!(
                    self.logger,
                    Facility::Forwarding,
                    &format!("PIM: dropped malformed packet from {} on {}: {}", source, interface, e)
                );
                Ok(())
            }
        }
    }

    /// Dispatch an already decoded PIM message
    pub fn handle_message(
        &mut self,
        now: Instant,
        interface: IfIndex,
        source: Ipv4Addr,
        message: PimMessage,
    ) -> Result<(), PimError> {
        self.check_interface(interface)?;
        self.stats.received.count(message.msg_type());
        match message {
            PimMessage::Hello(hello) => self.receive_hello(now, interface, source, &hello),
            PimMessage::JoinPrune(jp) => self.receive_join_prune(now, interface, source, &jp),
            PimMessage::Assert(assert) => self.receive_assert(now, interface, source, &assert),
            PimMessage::Register(register) => self.receive_register(now, source, &register),
            PimMessage::RegisterStop(stop) => self.receive_register_stop(now, &stop),
            PimMessage::Bootstrap(bsm) => self.receive_bootstrap(now, interface, source, bsm),
            PimMessage::CandidateRp(adv) => self.receive_candidate_rp(now, &adv),
        }
    }

    /// Fire a timer previously requested through [`RouterOutput::timers`].
    /// Stale firings are ignored.
    pub fn timer_expired(&mut self, now: Instant, kind: TimerKind) -> Result<(), PimError> {
        match kind {
            TimerKind::Hello { interface, epoch } => {
                let Some(iface) = self.interfaces.get_mut(&interface) else {
                    return Ok(());
                };
                if !iface.hello_timer.is_current(epoch) {
                    return self.stale(kind);
                }
                iface.hello_timer.stop();
                self.hello_timer_expired(now, interface);
                Ok(())
            }
            TimerKind::NeighborLiveness {
                interface,
                neighbor,
                epoch,
            } => {
                let current = self
                    .interfaces
                    .get(&interface)
                    .and_then(|i| i.neighbors.get(&neighbor))
                    .is_some_and(|n| n.liveness.is_current(epoch));
                if !current {
                    return self.stale(kind);
                }
                self.neighbor_lost(now, interface, neighbor)
            }
            TimerKind::Entry { key, slot, epoch } => {
                let current = match self.tib.lookup_mut(&key) {
                    Some(entry) => {
                        if entry.timer(slot).is_current(epoch) {
                            entry.timer(slot).stop();
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                };
                if !current {
                    return self.stale(kind);
                }
                match slot {
                    EntryTimer::Join => self.join_timer_expired(now, key)?,
                    EntryTimer::Override => self.override_timer_expired(now, key)?,
                    EntryTimer::Keepalive => self.keepalive_expired(now, key),
                    EntryTimer::RegisterStop => self.register_stop_timer_expired(now, key),
                }
                self.evaluate_group(now, key.group)
            }
            TimerKind::Downstream {
                key,
                interface,
                slot,
                epoch,
            } => {
                let current = match self
                    .tib
                    .lookup_mut(&key)
                    .and_then(|e| e.interfaces.get_mut(&interface))
                {
                    Some(state) => {
                        if state.timer(slot).is_current(epoch) {
                            state.timer(slot).stop();
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                };
                if !current {
                    return self.stale(kind);
                }
                match slot {
                    InterfaceTimer::Expiry => self.expiry_timer_expired(now, key, interface),
                    InterfaceTimer::PrunePending => {
                        self.prune_pending_expired(now, key, interface)
                    }
                    InterfaceTimer::Assert => self.assert_timer_expired(now, key, interface)?,
                }
                if key.tree == TreeType::Rp {
                    self.evaluate_all(now)
                } else {
                    self.evaluate_group(now, key.group)
                }
            }
            TimerKind::Bootstrap { interface, epoch } => {
                let current = self
                    .interfaces
                    .get_mut(&interface)
                    .is_some_and(|i| i.bsr_timer.is_current(epoch));
                if !current {
                    return self.stale(kind);
                }
                if let Some(iface) = self.interfaces.get_mut(&interface) {
                    iface.bsr_timer.stop();
                }
                self.bootstrap_timer_expired(now, interface)
            }
            TimerKind::CandidateRp { interface, epoch } => {
                let current = self
                    .interfaces
                    .get(&interface)
                    .is_some_and(|i| i.crp_timer.is_current(epoch));
                if !current {
                    return self.stale(kind);
                }
                if let Some(iface) = self.interfaces.get_mut(&interface) {
                    iface.crp_timer.stop();
                }
                self.candidate_rp_timer_expired(now, interface)
            }
            TimerKind::RpMapping { rp, range, epoch } => {
                let current = self
                    .rp_set
                    .get(range, rp)
                    .is_some_and(|e| e.expiry.is_current(epoch));
                if !current {
                    return self.stale(kind);
                }
                self.rp_mapping_expired(now, rp, range)
            }
        }
    }

    /// Re-snapshot RPF for every entry after a unicast routing change
    pub fn unicast_route_changed(&mut self, now: Instant) -> Result<(), PimError> {
        for key in self.tib.keys() {
            let Some(entry) = self.tib.lookup(&key) else {
                continue;
            };
            let rp = entry.rp;
            let old_rpf = entry.rpf;
            let new_rpf = self.resolve_entry_rpf(key, rp);
            if new_rpf != old_rpf {
                log_info!(
                    self.logger,
                    Facility::JoinPrune,
                    &format!("PIM: RPF of {} changed {:?} -> {:?}", key, old_rpf, new_rpf)
                );
                self.rpf_route_changed(now, key, new_rpf)?;
            }
        }
        self.evaluate_all(now)
    }

    fn stale(&self, kind: TimerKind) -> Result<(), PimError> {
        log_debug!(
            self.logger,
            Facility::Timer,
            &format!("PIM: ignored stale timer {:?}", kind)
        );
        Ok(())
    }

    // --- Accessors ---

    pub fn config(&self) -> &PimConfig {
        &self.config
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn tib(&self) -> &Tib {
        &self.tib
    }

    pub fn entry(&self, key: &TreeKey) -> Option<&TreeEntry> {
        self.tib.lookup(key)
    }

    pub fn rp_set(&self) -> &RpSet {
        &self.rp_set
    }

    pub fn bootstrap(&self) -> &BootstrapState {
        &self.bootstrap
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &PimInterface> {
        self.interfaces.values()
    }

    pub fn interface(&self, index: IfIndex) -> Option<&PimInterface> {
        self.interfaces.get(&index)
    }

    pub fn forwarding_table(&self) -> &ForwardingTable {
        &self.forwarding
    }

    pub fn stats(&self) -> &PimStats {
        &self.stats
    }

    // --- Helpers shared by the state machines ---

    fn check_interface(&self, interface: IfIndex) -> Result<(), PimError> {
        if self.interfaces.contains_key(&interface) {
            Ok(())
        } else {
            Err(PimError::UnknownInterface(interface))
        }
    }

    /// Report a protocol invariant violation: an error in strict mode, a
    /// warning otherwise
    pub(crate) fn invariant(&self, message: String) -> Result<(), PimError> {
        if self.config.strict_invariants {
            return Err(PimError::InvariantViolation(message));
        }
        log_warning!(
            self.logger,
            Facility::Tib,
            &format!("PIM: invariant violated: {}", message)
        );
        Ok(())
    }

    pub(crate) fn is_local_address(&self, address: Ipv4Addr) -> bool {
        self.interfaces.values().any(|i| i.address == address)
    }

    pub(crate) fn interface_address(&self, interface: IfIndex) -> Option<Ipv4Addr> {
        self.interfaces.get(&interface).map(|i| i.address)
    }

    pub(crate) fn is_dr(&self, interface: IfIndex) -> bool {
        self.interfaces.get(&interface).is_some_and(|i| i.is_dr())
    }

    pub(crate) fn neighbor_count(&self, interface: IfIndex) -> usize {
        self.interfaces
            .get(&interface)
            .map_or(0, |i| i.neighbors.len())
    }

    /// Interface whose subnet holds `address`
    pub(crate) fn directly_connected_interface(&self, address: Ipv4Addr) -> Option<IfIndex> {
        self.interfaces
            .values()
            .find(|i| i.is_directly_connected(address))
            .map(|i| i.index)
    }

    /// Uniform delay in [0, max)
    pub(crate) fn random_delay(&mut self, max: Duration) -> Duration {
        max.mul_f64(self.rng.gen_range(0.0..1.0))
    }

    /// Randomized override delay (t_override)
    pub(crate) fn override_delay(&mut self) -> Duration {
        self.random_delay(self.config.timers.override_interval)
    }

    pub(crate) fn random_range(&mut self, low: f64, high: f64) -> f64 {
        self.rng.gen_range(low..high)
    }

    fn queue(&mut self, interface: Option<IfIndex>, destination: Ipv4Addr, message: PimMessage) {
        self.stats.sent.count(message.msg_type());
        self.packets.push(OutgoingPacket {
            interface,
            destination,
            message,
        });
    }

    /// Multicast to ALL-PIM-ROUTERS on `interface`
    pub(crate) fn send_multicast(&mut self, interface: IfIndex, message: PimMessage) {
        self.queue(Some(interface), ALL_PIM_ROUTERS, message);
    }

    /// Unicast to `destination`, out `interface` when known
    pub(crate) fn send_unicast(
        &mut self,
        interface: Option<IfIndex>,
        destination: Ipv4Addr,
        message: PimMessage,
    ) {
        self.queue(interface, destination, message);
    }

    pub(crate) fn emit_data(&mut self, interface: IfIndex, packet: DataPacket) {
        self.forwarded.push(ForwardedPacket { interface, packet });
    }

    pub(crate) fn arm_entry_timer(
        &mut self,
        now: Instant,
        key: TreeKey,
        slot: EntryTimer,
        delay: Duration,
    ) {
        if let Some(entry) = self.tib.lookup_mut(&key) {
            self.scheduler
                .arm(entry.timer(slot), now, delay, |epoch| TimerKind::Entry {
                    key,
                    slot,
                    epoch,
                });
        }
    }

    pub(crate) fn stop_entry_timer(&mut self, key: TreeKey, slot: EntryTimer) {
        if let Some(entry) = self.tib.lookup_mut(&key) {
            entry.timer(slot).stop();
        }
    }

    pub(crate) fn arm_iface_timer(
        &mut self,
        now: Instant,
        key: TreeKey,
        interface: IfIndex,
        slot: InterfaceTimer,
        delay: Duration,
    ) {
        if let Some(entry) = self.tib.lookup_mut(&key) {
            let timer = entry.interface_mut(interface).timer(slot);
            self.scheduler
                .arm(timer, now, delay, |epoch| TimerKind::Downstream {
                    key,
                    interface,
                    slot,
                    epoch,
                });
        }
    }

    pub(crate) fn stop_iface_timer(&mut self, key: TreeKey, interface: IfIndex, slot: InterfaceTimer) {
        if let Some(state) = self
            .tib
            .lookup_mut(&key)
            .and_then(|e| e.interfaces.get_mut(&interface))
        {
            state.timer(slot).stop();
        }
    }

    // --- Evaluation ---

    /// One evaluation pass over every entry of `group`
    pub(crate) fn evaluate_group(&mut self, now: Instant, group: Ipv4Addr) -> Result<(), PimError> {
        for key in self.tib.group_keys(group) {
            if !self.tib.contains(&key) {
                continue;
            }
            match key.tree {
                TreeType::G => {
                    self.update_assert_tracking(now, key)?;
                    let desired = self.join_desired(key);
                    self.update_upstream(now, key, desired)?;
                }
                TreeType::Sg => {
                    self.update_assert_tracking(now, key)?;
                    self.update_register(now, key);
                    let desired = self.join_desired(key);
                    self.update_upstream(now, key, desired)?;
                    // Source tree established: (S,G,rpt) state to prune S off the shared tree
                    let rpt = key.with_tree(TreeType::SgRpt);
                    if !self.tib.contains(&rpt) && self.prune_desired_sg_rpt(key.source, key.group) {
                        self.ensure_entry(rpt);
                        self.update_rpt_upstream(now, rpt)?;
                    }
                }
                TreeType::SgRpt => self.update_rpt_upstream(now, key)?,
                TreeType::Rp => {}
            }
            self.refresh_olist_cache(key);
        }
        self.collect_garbage(Some(group));
        Ok(())
    }

    /// Evaluate (*,*,RP) entries and then every group
    pub(crate) fn evaluate_all(&mut self, now: Instant) -> Result<(), PimError> {
        for key in self.tib.keys() {
            if key.tree == TreeType::Rp && self.tib.contains(&key) {
                let desired = self.join_desired(key);
                self.update_upstream(now, key, desired)?;
                self.refresh_olist_cache(key);
            }
        }
        for group in self.tib.groups() {
            self.evaluate_group(now, group)?;
        }
        self.collect_garbage(None);
        Ok(())
    }
}

impl<E: Environment> std::fmt::Debug for Router<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("interfaces", &self.interfaces.len())
            .field("entries", &self.tib.len())
            .field("rp_set", &self.rp_set.len())
            .finish()
    }
}
