// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Bootstrap Router mechanism (RFC 5059)
//!
//! Every interface carries one bootstrap machine. The best Candidate-BSR
//! interface of the router runs the candidate machine, every other interface
//! the non-candidate one. Each received Bootstrap message is offered to all
//! machines; when a candidate machine exists its verdict decides whether the
//! message is accepted.
//!
//! Candidate machine:
//!
//! | State | Preferred BSM | Non-preferred BSM | Timer |
//! |-------|---------------|-------------------|-------|
//! | Candidate | accept | from current BSR: Pending | Pending |
//! | Pending | accept, Candidate | ignore | Elected, originate |
//! | Elected | accept, Candidate | originate | originate |
//!
//! Non-candidate machine:
//!
//! | State | Any BSM | Timer |
//! |-------|---------|-------|
//! | NoInfo, AcceptAny | accept, AcceptPreferred | |
//! | AcceptPreferred | accept if preferred | AcceptAny |
//!
//! Accepting a message forwards it unchanged, records its BSR and reconciles
//! the bootstrap part of the RP-set against it.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use rand::Rng;

use super::rp::RpOrigin;
use super::Router;
use crate::env::Environment;
use crate::error::PimError;
use crate::logging::Facility;
use crate::packet::{
    Bootstrap, BootstrapGroup, BootstrapRp, CandidateRpAdvertisement, EncodedGroup, PimMessage,
    MAX_BSM_RPS,
};
use crate::timer::TimerKind;
use crate::{log_debug, log_info};
use crate::{GroupRange, IfIndex, ALL_MULTICAST};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateBsrState {
    Candidate,
    Pending,
    Elected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonCandidateBsrState {
    NoInfo,
    AcceptAny,
    AcceptPreferred,
}

/// Bootstrap machine of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BsrMachine {
    Candidate { priority: u8, state: CandidateBsrState },
    NonCandidate(NonCandidateBsrState),
}

impl BsrMachine {
    pub fn new(candidate_priority: Option<u8>) -> Self {
        match candidate_priority {
            Some(priority) => BsrMachine::Candidate {
                priority,
                state: CandidateBsrState::Pending,
            },
            None => BsrMachine::NonCandidate(NonCandidateBsrState::NoInfo),
        }
    }

    pub fn is_elected(&self) -> bool {
        matches!(
            self,
            BsrMachine::Candidate {
                state: CandidateBsrState::Elected,
                ..
            }
        )
    }
}

/// A BSR as identified in Bootstrap messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BsrInfo {
    pub address: Ipv4Addr,
    pub priority: u8,
}

impl BsrInfo {
    /// Higher priority wins, ties go to the higher address
    fn rank(&self) -> (u8, Ipv4Addr) {
        (self.priority, self.address)
    }

    pub fn is_preferred_to(&self, other: &BsrInfo) -> bool {
        self.rank() > other.rank()
    }
}

/// Router-wide bootstrap state
#[derive(Debug, Clone)]
pub struct BootstrapState {
    /// The BSR whose messages are currently accepted
    pub current: Option<BsrInfo>,
    /// Last accepted or originated message, replayed to new neighbors
    pub stored_bsm: Option<Bootstrap>,
    /// Hash mask length used for RP(G)
    pub hash_mask_len: u8,
    fragment_tag: u16,
}

impl BootstrapState {
    pub fn new(hash_mask_len: u8, fragment_tag: u16) -> Self {
        Self {
            current: None,
            stored_bsm: None,
            hash_mask_len,
            fragment_tag,
        }
    }

    pub fn fragment_tag(&self) -> u16 {
        self.fragment_tag
    }

    /// `bsr` is the current BSR or preferred to it
    fn accepts(&self, bsr: &BsrInfo) -> bool {
        match &self.current {
            Some(current) => current.address == bsr.address || bsr.is_preferred_to(current),
            None => true,
        }
    }
}

/// Pending-BSR backoff: 5 s plus a priority term plus an address term.
/// `best` is the most preferred BSR known besides `me`.
pub fn rand_override(me: BsrInfo, best: Option<BsrInfo>) -> Duration {
    let best = best.filter(|b| b.is_preferred_to(&me)).unwrap_or(me);
    let priority_delay = 2.0 * (1.0 + f64::from(best.priority - me.priority)).log2();
    let address_delay = if best.priority == me.priority {
        let diff = u32::from(best.address) - u32::from(me.address);
        (1.0 + f64::from(diff)).log2()
    } else {
        2.0 - f64::from(u32::from(me.address)) / f64::from(1u32 << 31)
    };
    Duration::from_secs_f64(5.0 + priority_delay + address_delay)
}

/// What one machine decided about a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accept,
    Ignore,
    /// Elected BSR heard a worse BSR: reassert itself
    Originate,
}

impl<E: Environment> Router<E> {
    fn arm_bsr_timer(&mut self, now: Instant, interface: IfIndex, delay: Duration) {
        if let Some(iface) = self.interfaces.get_mut(&interface) {
            self.scheduler
                .arm(&mut iface.bsr_timer, now, delay, |epoch| TimerKind::Bootstrap {
                    interface,
                    epoch,
                });
        }
    }

    fn set_bsr_machine(&mut self, interface: IfIndex, machine: BsrMachine) {
        if let Some(iface) = self.interfaces.get_mut(&interface) {
            if iface.bsr != machine {
                log_debug!(
                    self.logger,
                    Facility::Bootstrap,
                    &format!("BSR: {} {:?} -> {:?}", interface, iface.bsr, machine)
                );
                iface.bsr = machine;
            }
        }
    }

    /// This router's identity as Candidate-BSR on `interface`
    fn candidate_info(&self, interface: IfIndex) -> Option<BsrInfo> {
        let iface = self.interfaces.get(&interface)?;
        match iface.bsr {
            BsrMachine::Candidate { priority, .. } => Some(BsrInfo {
                address: iface.address,
                priority,
            }),
            BsrMachine::NonCandidate(_) => None,
        }
    }

    /// The interface running the candidate machine, if any
    fn candidate_interface(&self) -> Option<IfIndex> {
        self.interfaces
            .values()
            .find(|i| matches!(i.bsr, BsrMachine::Candidate { .. }))
            .map(|i| i.index)
    }

    pub(crate) fn is_elected_bsr(&self) -> bool {
        self.interfaces.values().any(|i| i.bsr.is_elected())
    }

    /// Start the bootstrap machine of `interface`. Only the best configured
    /// Candidate-BSR interface keeps the candidate machine.
    pub(crate) fn start_bootstrap(&mut self, now: Instant, interface: IfIndex) {
        let Some(me) = self.candidate_info(interface) else {
            self.set_bsr_machine(interface, BsrMachine::NonCandidate(NonCandidateBsrState::AcceptAny));
            return;
        };
        let outranked = self
            .config
            .interfaces
            .iter()
            .filter_map(|c| {
                c.candidate_bsr_priority.map(|priority| BsrInfo {
                    address: c.address,
                    priority,
                })
            })
            .any(|other| other.is_preferred_to(&me));
        if outranked {
            self.set_bsr_machine(interface, BsrMachine::NonCandidate(NonCandidateBsrState::AcceptAny));
            return;
        }
        self.set_bsr_machine(
            interface,
            BsrMachine::Candidate {
                priority: me.priority,
                state: CandidateBsrState::Pending,
            },
        );
        let delay = rand_override(me, self.bootstrap.current);
        self.arm_bsr_timer(now, interface, delay);
        log_info!(
            self.logger,
            Facility::Bootstrap,
            &format!("BSR: candidate {} priority {}, pending for {:?}", me.address, me.priority, delay)
        );
    }

    pub(crate) fn receive_bootstrap(
        &mut self,
        now: Instant,
        interface: IfIndex,
        sender: Ipv4Addr,
        bsm: Bootstrap,
    ) -> Result<(), PimError> {
        if self.is_local_address(bsm.bsr_address) {
            return Ok(());
        }
        if bsm.hash_mask_len > 32 {
            self.stats.malformed += 1;
            return Ok(());
        }
        let from_neighbor = self
            .interfaces
            .get(&interface)
            .is_some_and(|i| i.neighbors.contains_key(&sender));
        let rpf_interface = self.env.resolve(bsm.bsr_address).map(|r| r.interface);
        if !from_neighbor || rpf_interface != Some(interface) {
            self.stats.ignored += 1;
            log_debug!(
                self.logger,
                Facility::Bootstrap,
                &format!(
                    "BSR: dropped BSM of {} from {} on {} (neighbor {}, RPF {:?})",
                    bsm.bsr_address, sender, interface, from_neighbor, rpf_interface
                )
            );
            return Ok(());
        }

        let bsr = BsrInfo {
            address: bsm.bsr_address,
            priority: bsm.bsr_priority,
        };
        let timeout = self.config.timers.bootstrap_timeout;
        let mut candidate_verdict = None;
        let mut non_candidate_verdict = Verdict::Ignore;

        let indices: Vec<IfIndex> = self.interfaces.keys().copied().collect();
        for index in indices {
            let Some(machine) = self.interfaces.get(&index).map(|i| i.bsr) else {
                continue;
            };
            match machine {
                BsrMachine::Candidate { priority, state } => {
                    let Some(me) = self.candidate_info(index) else {
                        continue;
                    };
                    let preferred = !me.is_preferred_to(&bsr);
                    let from_current = self.bootstrap.current.is_some_and(|c| c.address == bsr.address);
                    let (next, verdict) = match state {
                        CandidateBsrState::Candidate if preferred && self.bootstrap.accepts(&bsr) => {
                            (CandidateBsrState::Candidate, Verdict::Accept)
                        }
                        CandidateBsrState::Candidate if from_current => {
                            let delay = rand_override(me, None);
                            self.arm_bsr_timer(now, index, delay);
                            (CandidateBsrState::Pending, Verdict::Ignore)
                        }
                        CandidateBsrState::Pending | CandidateBsrState::Elected if preferred => {
                            (CandidateBsrState::Candidate, Verdict::Accept)
                        }
                        CandidateBsrState::Elected => (CandidateBsrState::Elected, Verdict::Originate),
                        other => (other, Verdict::Ignore),
                    };
                    match verdict {
                        Verdict::Accept => self.arm_bsr_timer(now, index, timeout),
                        Verdict::Originate => {
                            let period = self.config.timers.bootstrap_period;
                            self.arm_bsr_timer(now, index, period);
                        }
                        Verdict::Ignore => {}
                    }
                    self.set_bsr_machine(index, BsrMachine::Candidate { priority, state: next });
                    candidate_verdict = Some(verdict);
                }
                BsrMachine::NonCandidate(state) => {
                    let accept = match state {
                        NonCandidateBsrState::NoInfo | NonCandidateBsrState::AcceptAny => true,
                        NonCandidateBsrState::AcceptPreferred => self.bootstrap.accepts(&bsr),
                    };
                    if accept {
                        self.arm_bsr_timer(now, index, timeout);
                        self.set_bsr_machine(
                            index,
                            BsrMachine::NonCandidate(NonCandidateBsrState::AcceptPreferred),
                        );
                        non_candidate_verdict = Verdict::Accept;
                    }
                }
            }
        }

        match candidate_verdict.unwrap_or(non_candidate_verdict) {
            Verdict::Accept => self.accept_bsm(now, interface, bsm),
            Verdict::Originate => self.originate_bsm(now),
            Verdict::Ignore => {
                log_debug!(
                    self.logger,
                    Facility::Bootstrap,
                    &format!("BSR: ignored BSM of non-preferred BSR {}", bsr.address)
                );
                Ok(())
            }
        }
    }

    /// Forward `bsm`, adopt its BSR and reconcile the RP-set against it
    fn accept_bsm(&mut self, now: Instant, arrival: IfIndex, bsm: Bootstrap) -> Result<(), PimError> {
        let forward_to: Vec<IfIndex> = self
            .interfaces
            .values()
            .filter(|i| i.index != arrival && !i.neighbors.is_empty())
            .map(|i| i.index)
            .collect();
        for interface in forward_to {
            self.send_multicast(interface, PimMessage::Bootstrap(bsm.clone()));
        }

        let bsr = BsrInfo {
            address: bsm.bsr_address,
            priority: bsm.bsr_priority,
        };
        if self.bootstrap.current != Some(bsr) {
            log_info!(
                self.logger,
                Facility::Bootstrap,
                &format!("BSR: now following {} (priority {})", bsr.address, bsr.priority)
            );
        }
        self.bootstrap.current = Some(bsr);
        let mut changed = self.bootstrap.hash_mask_len != bsm.hash_mask_len;
        self.bootstrap.hash_mask_len = bsm.hash_mask_len;

        let mut advertised = BTreeSet::new();
        for block in &bsm.groups {
            let range = GroupRange::new(block.group.address, block.group.mask_len);
            if !range.prefix.is_multicast() || range.mask_len < ALL_MULTICAST.mask_len {
                continue;
            }
            for rp in &block.rps {
                if rp.holdtime == 0 {
                    continue;
                }
                advertised.insert((range, rp.address));
                changed |= self.set_rp_mapping(now, rp.address, range, rp.priority, rp.holdtime, RpOrigin::Bootstrap);
            }
        }
        let mut stale = self.rp_set.keys_of(RpOrigin::Bootstrap);
        stale.extend(self.rp_set.keys_of(RpOrigin::Candidate));
        for (range, rp) in stale {
            if !advertised.contains(&(range, rp)) {
                changed |= self.remove_rp_mapping(range, rp);
            }
        }
        self.bootstrap.stored_bsm = Some(bsm);

        if changed {
            self.rp_set_changed(now)?;
        }
        Ok(())
    }

    /// Build and flood a BSM from the Candidate-RP set held as elected BSR
    fn originate_bsm(&mut self, now: Instant) -> Result<(), PimError> {
        let Some(me) = self.candidate_interface().and_then(|i| self.candidate_info(i)) else {
            return Ok(());
        };
        let groups = self
            .rp_set
            .group_hash_entries(RpOrigin::Candidate)
            .into_iter()
            .map(|mut entry| {
                // One block carries at most 255 RPs; keep the most preferred
                entry
                    .rps
                    .sort_by(|a, b| a.priority.cmp(&b.priority).then(b.rp.cmp(&a.rp)));
                entry.rps.truncate(MAX_BSM_RPS);
                entry
            })
            .map(|entry| BootstrapGroup {
                group: EncodedGroup::new(entry.range.prefix, entry.range.mask_len),
                rp_count: u8::try_from(entry.rps.len()).unwrap_or(u8::MAX),
                rps: entry
                    .rps
                    .iter()
                    .map(|rp| BootstrapRp {
                        address: rp.rp,
                        holdtime: rp
                            .expiry
                            .remaining(now)
                            .map_or(rp.holdtime, |r| u16::try_from(r.as_secs()).unwrap_or(rp.holdtime)),
                        priority: rp.priority,
                    })
                    .collect(),
            })
            .collect();
        self.bootstrap.fragment_tag = self.rng.gen();
        let bsm = Bootstrap {
            fragment_tag: self.bootstrap.fragment_tag,
            hash_mask_len: self.config.hash_mask_len,
            bsr_priority: me.priority,
            bsr_address: me.address,
            groups,
        };

        let targets: Vec<IfIndex> = self
            .interfaces
            .values()
            .filter(|i| !i.neighbors.is_empty())
            .map(|i| i.index)
            .collect();
        log_debug!(
            self.logger,
            Facility::Bootstrap,
            &format!("BSR: originating BSM with {} ranges on {} interfaces", bsm.groups.len(), targets.len())
        );
        for interface in targets {
            self.send_multicast(interface, PimMessage::Bootstrap(bsm.clone()));
        }
        self.bootstrap.current = Some(me);
        self.bootstrap.stored_bsm = Some(bsm);
        Ok(())
    }

    /// Pending candidate won: take over the RP-set and start originating
    fn become_elected(&mut self, now: Instant, interface: IfIndex) -> Result<(), PimError> {
        let Some(me) = self.candidate_info(interface) else {
            return Ok(());
        };
        log_info!(
            self.logger,
            Facility::Bootstrap,
            &format!("BSR: {} elected (priority {})", me.address, me.priority)
        );
        // Mappings learned from the previous BSR stay until their holdtime
        // runs out and are advertised as our own meanwhile
        for (range, rp) in self.rp_set.keys_of(RpOrigin::Bootstrap) {
            if let Some(entry) = self.rp_set.get_mut(range, rp) {
                entry.origin = RpOrigin::Candidate;
            }
        }
        self.bootstrap.current = Some(me);
        let hash_changed = self.bootstrap.hash_mask_len != self.config.hash_mask_len;
        self.bootstrap.hash_mask_len = self.config.hash_mask_len;

        let mut changed = hash_changed;
        for adv in self.local_candidate_advertisements() {
            changed |= self.learn_candidate_rp(now, &adv);
        }
        self.originate_bsm(now)?;
        self.arm_bsr_timer(now, interface, self.config.timers.bootstrap_period);
        if changed {
            self.rp_set_changed(now)?;
        }
        Ok(())
    }

    pub(crate) fn bootstrap_timer_expired(&mut self, now: Instant, interface: IfIndex) -> Result<(), PimError> {
        let Some(machine) = self.interfaces.get(&interface).map(|i| i.bsr) else {
            return Ok(());
        };
        match machine {
            BsrMachine::Candidate { priority, state } => match state {
                CandidateBsrState::Candidate => {
                    log_info!(
                        self.logger,
                        Facility::Bootstrap,
                        &format!("BSR: lost BSR {:?}", self.bootstrap.current.map(|c| c.address))
                    );
                    self.bootstrap.current = None;
                    self.set_bsr_machine(
                        interface,
                        BsrMachine::Candidate {
                            priority,
                            state: CandidateBsrState::Pending,
                        },
                    );
                    if let Some(me) = self.candidate_info(interface) {
                        let delay = rand_override(me, None);
                        self.arm_bsr_timer(now, interface, delay);
                    }
                    Ok(())
                }
                CandidateBsrState::Pending => {
                    self.set_bsr_machine(
                        interface,
                        BsrMachine::Candidate {
                            priority,
                            state: CandidateBsrState::Elected,
                        },
                    );
                    self.become_elected(now, interface)
                }
                CandidateBsrState::Elected => {
                    self.originate_bsm(now)?;
                    self.arm_bsr_timer(now, interface, self.config.timers.bootstrap_period);
                    Ok(())
                }
            },
            BsrMachine::NonCandidate(NonCandidateBsrState::AcceptPreferred) => {
                self.set_bsr_machine(interface, BsrMachine::NonCandidate(NonCandidateBsrState::AcceptAny));
                if self.candidate_interface().is_none() {
                    self.bootstrap.current = None;
                }
                Ok(())
            }
            BsrMachine::NonCandidate(_) => Ok(()),
        }
    }

    /// Replay the stored BSM to a neighbor that just appeared
    pub(crate) fn send_stored_bsm(&mut self, interface: IfIndex, neighbor: Ipv4Addr) {
        if let Some(bsm) = self.bootstrap.stored_bsm.clone() {
            log_debug!(
                self.logger,
                Facility::Bootstrap,
                &format!("BSR: sending stored BSM to new neighbor {} on {}", neighbor, interface)
            );
            self.send_unicast(Some(interface), neighbor, PimMessage::Bootstrap(bsm));
        }
    }

    /// Store the mappings of one advertisement; true when the RP-set changed
    fn learn_candidate_rp(&mut self, now: Instant, adv: &CandidateRpAdvertisement) -> bool {
        let ranges: Vec<GroupRange> = if adv.groups.is_empty() {
            vec![ALL_MULTICAST]
        } else {
            adv.groups
                .iter()
                .map(|g| GroupRange::new(g.address, g.mask_len))
                .filter(|r| r.prefix.is_multicast() && r.mask_len >= ALL_MULTICAST.mask_len)
                .collect()
        };
        let mut changed = false;
        for range in ranges {
            changed |= self.set_rp_mapping(now, adv.rp, range, adv.priority, adv.holdtime, RpOrigin::Candidate);
        }
        changed
    }

    pub(crate) fn receive_candidate_rp(
        &mut self,
        now: Instant,
        adv: &CandidateRpAdvertisement,
    ) -> Result<(), PimError> {
        if !self.is_elected_bsr() {
            self.stats.ignored += 1;
            log_debug!(
                self.logger,
                Facility::Bootstrap,
                &format!("BSR: C-RP advertisement from {} but not the BSR", adv.rp)
            );
            return Ok(());
        }
        if self.learn_candidate_rp(now, adv) {
            self.originate_bsm(now)?;
            self.rp_set_changed(now)?;
        }
        Ok(())
    }

    fn local_candidate_advertisements(&self) -> Vec<CandidateRpAdvertisement> {
        let holdtime = u16::try_from(self.config.timers.crp_holdtime.as_secs()).unwrap_or(u16::MAX);
        let groups: Vec<EncodedGroup> = self
            .config
            .candidate_rp_groups
            .iter()
            .map(|r| EncodedGroup::new(r.prefix, r.mask_len))
            .collect();
        self.interfaces
            .values()
            .filter_map(|i| {
                i.candidate_rp_priority.map(|priority| CandidateRpAdvertisement {
                    priority,
                    holdtime,
                    rp: i.address,
                    groups: groups.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn start_candidate_rp(&mut self, now: Instant, interface: IfIndex) {
        let rounds = self.config.timers.crp_backoff_rounds;
        let Some(iface) = self.interfaces.get_mut(&interface) else {
            return;
        };
        if iface.candidate_rp_priority.is_none() {
            return;
        }
        iface.crp_backoff_rounds = rounds;
        let delay = self.random_delay(self.config.timers.crp_backoff);
        if let Some(iface) = self.interfaces.get_mut(&interface) {
            self.scheduler
                .arm(&mut iface.crp_timer, now, delay, |epoch| TimerKind::CandidateRp {
                    interface,
                    epoch,
                });
        }
    }

    pub(crate) fn candidate_rp_timer_expired(&mut self, now: Instant, interface: IfIndex) -> Result<(), PimError> {
        let Some(iface) = self.interfaces.get(&interface) else {
            return Ok(());
        };
        let address = iface.address;
        let Some(adv) = self
            .local_candidate_advertisements()
            .into_iter()
            .find(|a| a.rp == address)
        else {
            return Ok(());
        };

        match self.bootstrap.current {
            Some(bsr) if self.is_local_address(bsr.address) => {
                if self.learn_candidate_rp(now, &adv) {
                    self.rp_set_changed(now)?;
                }
            }
            Some(bsr) => {
                log_debug!(
                    self.logger,
                    Facility::Bootstrap,
                    &format!("BSR: advertising C-RP {} to {}", adv.rp, bsr.address)
                );
                self.send_unicast(None, bsr.address, PimMessage::CandidateRp(adv));
            }
            None => log_debug!(
                self.logger,
                Facility::Bootstrap,
                "BSR: no BSR known, C-RP advertisement deferred"
            ),
        }

        let fast = self
            .interfaces
            .get_mut(&interface)
            .is_some_and(|i| {
                let fast = i.crp_backoff_rounds > 0;
                i.crp_backoff_rounds = i.crp_backoff_rounds.saturating_sub(1);
                fast
            });
        let delay = if fast {
            self.random_delay(self.config.timers.crp_backoff)
        } else {
            self.config.timers.crp_adv_period
        };
        if let Some(iface) = self.interfaces.get_mut(&interface) {
            self.scheduler
                .arm(&mut iface.crp_timer, now, delay, |epoch| TimerKind::CandidateRp {
                    interface,
                    epoch,
                });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::PimConfig;
    use crate::router::RouterOutput;

    fn bsr(address: &str, priority: u8) -> BsrInfo {
        BsrInfo {
            address: addr(address),
            priority,
        }
    }

    fn bsm(bsr_address: &str, priority: u8, rps: &[(&str, &str, u8)]) -> Bootstrap {
        Bootstrap {
            fragment_tag: 1,
            hash_mask_len: 30,
            bsr_priority: priority,
            bsr_address: addr(bsr_address),
            groups: rps
                .iter()
                .map(|(group, rp, len)| BootstrapGroup {
                    group: EncodedGroup::new(addr(group), *len),
                    rp_count: 1,
                    rps: vec![BootstrapRp {
                        address: addr(rp),
                        holdtime: 150,
                        priority: 0,
                    }],
                })
                .collect(),
        }
    }

    fn candidate_config() -> PimConfig {
        let mut config = config();
        config.static_rp.clear();
        config.interfaces[1].candidate_bsr_priority = Some(64);
        config
    }

    fn bootstrap_timer(output: &RouterOutput) -> (TimerKind, Duration) {
        output
            .timers
            .iter()
            .rev()
            .find(|t| matches!(t.kind, TimerKind::Bootstrap { .. }))
            .map(|t| (t.kind, t.delay))
            .unwrap()
    }

    fn bsms(output: &RouterOutput) -> Vec<(Option<IfIndex>, Bootstrap)> {
        output
            .packets
            .iter()
            .filter_map(|p| match &p.message {
                PimMessage::Bootstrap(b) => Some((p.interface, b.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_rand_override() {
        let me = bsr("10.0.0.1", 64);
        assert_eq!(rand_override(me, None), Duration::from_secs(5));
        // Equal priority, best address 3 above: 5 + log2(4)
        assert_eq!(
            rand_override(me, Some(bsr("10.0.0.4", 64))),
            Duration::from_secs(7)
        );
        // A worse BSR does not delay us
        assert_eq!(rand_override(me, Some(bsr("10.0.0.9", 1))), Duration::from_secs(5));
        // Higher priority: 5 + 2*log2(1+1) + (2 - addr/2^31)
        let delay = rand_override(me, Some(bsr("10.0.0.9", 65))).as_secs_f64();
        assert!(delay > 8.8 && delay < 9.0);
    }

    #[test]
    fn test_lone_candidate_gets_elected() {
        let now = Instant::now();
        let (logger, _ring) = crate::logging::Logger::in_memory(64);
        let mut router = Router::new(candidate_config(), env(), logger).unwrap();
        router.start(now).unwrap();
        assert_eq!(
            router.interface(IF2).unwrap().bsr,
            BsrMachine::Candidate {
                priority: 64,
                state: CandidateBsrState::Pending
            }
        );
        assert_eq!(
            router.interface(IF1).unwrap().bsr,
            BsrMachine::NonCandidate(NonCandidateBsrState::AcceptAny)
        );

        let output = router.take_output();
        let (kind, delay) = bootstrap_timer(&output);
        assert_eq!(delay, Duration::from_secs(5));

        hello_from(&mut router, now, IF1, "10.0.1.2");
        router.take_output();
        router.timer_expired(now, kind).unwrap();

        assert!(router.is_elected_bsr());
        assert_eq!(router.bootstrap().current, Some(bsr("10.0.2.1", 64)));
        let output = router.take_output();
        let sent = bsms(&output);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Some(IF1));
        assert_eq!(sent[0].1.bsr_address, addr("10.0.2.1"));
        let (_, delay) = bootstrap_timer(&output);
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn test_preferred_bsm_demotes_elected() {
        let now = Instant::now();
        let (logger, _ring) = crate::logging::Logger::in_memory(64);
        let mut router = Router::new(candidate_config(), env(), logger).unwrap();
        router.start(now).unwrap();
        let (kind, _) = bootstrap_timer(&router.take_output());
        router.timer_expired(now, kind).unwrap();
        assert!(router.is_elected_bsr());

        hello_from(&mut router, now, IF2, "10.0.2.2");
        router.take_output();
        let better = bsm("10.0.0.5", 100, &[("239.0.0.0", "10.0.0.7", 8)]);
        router
            .handle_message(now, IF2, addr("10.0.2.2"), PimMessage::Bootstrap(better))
            .unwrap();

        assert_eq!(
            router.interface(IF2).unwrap().bsr,
            BsrMachine::Candidate {
                priority: 64,
                state: CandidateBsrState::Candidate
            }
        );
        assert_eq!(router.bootstrap().current, Some(bsr("10.0.0.5", 100)));
        assert_eq!(router.rp_for_group(addr("239.1.1.1")), Some(addr("10.0.0.7")));
    }

    #[test]
    fn test_elected_bsr_reasserts_against_worse_bsm() {
        let now = Instant::now();
        let (logger, _ring) = crate::logging::Logger::in_memory(64);
        let mut router = Router::new(candidate_config(), env(), logger).unwrap();
        router.start(now).unwrap();
        let (kind, _) = bootstrap_timer(&router.take_output());
        hello_from(&mut router, now, IF2, "10.0.2.2");
        router.timer_expired(now, kind).unwrap();
        router.take_output();

        let worse = bsm("10.0.0.5", 1, &[]);
        router
            .handle_message(now, IF2, addr("10.0.2.2"), PimMessage::Bootstrap(worse))
            .unwrap();
        assert!(router.is_elected_bsr());
        let output = router.take_output();
        let sent = bsms(&output);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.bsr_address, addr("10.0.2.1"));
        // Next periodic origination counts from the reassertion
        let (_, delay) = bootstrap_timer(&output);
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn test_originated_bsm_caps_rps_per_range() {
        let now = Instant::now();
        let (logger, _ring) = crate::logging::Logger::in_memory(64);
        let mut router = Router::new(candidate_config(), env(), logger).unwrap();
        router.start(now).unwrap();
        let (kind, _) = bootstrap_timer(&router.take_output());
        hello_from(&mut router, now, IF1, "10.0.1.2");
        router.timer_expired(now, kind).unwrap();
        router.take_output();

        for n in 0..300u32 {
            let adv = CandidateRpAdvertisement {
                priority: if n < 10 { 1 } else { 100 },
                holdtime: 150,
                rp: Ipv4Addr::from(0x0A05_0000 + n),
                groups: vec![],
            };
            router
                .handle_message(now, IF1, addr("10.0.1.2"), PimMessage::CandidateRp(adv))
                .unwrap();
        }
        let output = router.take_output();
        let (_, last) = bsms(&output).pop().unwrap();
        let block = &last.groups[0];
        assert_eq!(block.rps.len(), MAX_BSM_RPS);
        assert_eq!(usize::from(block.rp_count), MAX_BSM_RPS);
        // The most preferred RPs are the ones kept
        assert!(block.rps[..10].iter().all(|rp| rp.priority == 1));

        let wire = PimMessage::Bootstrap(last.clone()).encode();
        assert_eq!(PimMessage::decode(&wire).unwrap(), PimMessage::Bootstrap(last));
    }

    #[test]
    fn test_bsm_reconciles_rp_set_and_keeps_static() {
        let mut router = router();
        let now = Instant::now();
        hello_from(&mut router, now, IF2, "10.0.2.2");
        hello_from(&mut router, now, IF3, "10.0.3.2");
        router.take_output();

        let first = bsm(
            "10.0.0.5",
            64,
            &[("239.0.0.0", "10.0.0.7", 8), ("238.0.0.0", "10.0.0.8", 8)],
        );
        router
            .handle_message(now, IF2, addr("10.0.2.2"), PimMessage::Bootstrap(first))
            .unwrap();
        assert_eq!(router.rp_set().len(), 3);
        assert_eq!(router.rp_for_group(addr("238.1.1.1")), Some(addr("10.0.0.8")));

        // Forwarded unchanged out the other interface with neighbors
        let sent = bsms(&router.take_output());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Some(IF3));

        let second = bsm("10.0.0.5", 64, &[("239.0.0.0", "10.0.0.7", 8)]);
        router
            .handle_message(now, IF2, addr("10.0.2.2"), PimMessage::Bootstrap(second))
            .unwrap();
        assert_eq!(router.rp_set().len(), 2);
        assert_eq!(router.rp_for_group(addr("238.1.1.1")), Some(addr("10.0.0.5")));
        assert_eq!(
            router.rp_set().get(ALL_MULTICAST, addr("10.0.0.5")).unwrap().origin,
            RpOrigin::Static
        );
    }

    #[test]
    fn test_bsm_from_non_neighbor_or_wrong_interface_dropped() {
        let mut router = router();
        let now = Instant::now();
        router
            .handle_message(now, IF2, addr("10.0.2.2"), PimMessage::Bootstrap(bsm("10.0.0.5", 64, &[])))
            .unwrap();
        assert_eq!(router.stats().ignored, 1);

        hello_from(&mut router, now, IF3, "10.0.3.2");
        router
            .handle_message(now, IF3, addr("10.0.3.2"), PimMessage::Bootstrap(bsm("10.0.0.5", 64, &[])))
            .unwrap();
        assert_eq!(router.stats().ignored, 2);
        assert_eq!(router.bootstrap().current, None);
    }

    #[test]
    fn test_non_rpf_neighbor_on_rpf_interface_accepted() {
        let mut router = router();
        let now = Instant::now();
        hello_from(&mut router, now, IF2, "10.0.2.9");
        router
            .handle_message(now, IF2, addr("10.0.2.9"), PimMessage::Bootstrap(bsm("10.0.0.5", 64, &[])))
            .unwrap();
        assert_eq!(router.bootstrap().current, Some(bsr("10.0.0.5", 64)));
    }

    #[test]
    fn test_new_neighbor_receives_stored_bsm() {
        let mut router = router();
        let now = Instant::now();
        hello_from(&mut router, now, IF2, "10.0.2.2");
        router
            .handle_message(now, IF2, addr("10.0.2.2"), PimMessage::Bootstrap(bsm("10.0.0.5", 64, &[])))
            .unwrap();
        router.take_output();

        hello_from(&mut router, now, IF1, "10.0.1.2");
        let output = router.take_output();
        let unicast = output
            .packets
            .iter()
            .find(|p| matches!(p.message, PimMessage::Bootstrap(_)))
            .unwrap();
        assert_eq!(unicast.destination, addr("10.0.1.2"));
        assert_eq!(unicast.interface, Some(IF1));
    }

    #[test]
    fn test_candidate_rp_advertisement_at_bsr() {
        let now = Instant::now();
        let (logger, _ring) = crate::logging::Logger::in_memory(64);
        let mut router = Router::new(candidate_config(), env(), logger).unwrap();
        router.start(now).unwrap();
        let (kind, _) = bootstrap_timer(&router.take_output());
        hello_from(&mut router, now, IF1, "10.0.1.2");
        router.timer_expired(now, kind).unwrap();
        router.take_output();

        let adv = CandidateRpAdvertisement {
            priority: 10,
            holdtime: 150,
            rp: addr("10.0.1.2"),
            groups: vec![],
        };
        router
            .handle_message(now, IF1, addr("10.0.1.2"), PimMessage::CandidateRp(adv))
            .unwrap();
        assert_eq!(router.rp_for_group(addr("239.1.1.1")), Some(addr("10.0.1.2")));
        let sent = bsms(&router.take_output());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.groups.len(), 1);
        assert_eq!(sent[0].1.groups[0].rps[0].address, addr("10.0.1.2"));
    }

    #[test]
    fn test_candidate_rp_ignored_when_not_bsr() {
        let mut router = router();
        let adv = CandidateRpAdvertisement {
            priority: 10,
            holdtime: 150,
            rp: addr("10.0.1.2"),
            groups: vec![],
        };
        router
            .handle_message(Instant::now(), IF1, addr("10.0.1.2"), PimMessage::CandidateRp(adv))
            .unwrap();
        assert_eq!(router.stats().ignored, 1);
        assert_eq!(router.rp_set().len(), 1);
    }

    #[test]
    fn test_candidate_rp_advertises_to_known_bsr() {
        let mut config = config();
        config.interfaces[0].candidate_rp_priority = Some(192);
        let now = Instant::now();
        let (logger, _ring) = crate::logging::Logger::in_memory(64);
        let mut router = Router::new(config, env(), logger).unwrap();
        router.start(now).unwrap();
        let crp = router
            .take_output()
            .timers
            .into_iter()
            .find(|t| matches!(t.kind, TimerKind::CandidateRp { .. }))
            .unwrap();
        assert!(crp.delay < Duration::from_secs(3));

        hello_from(&mut router, now, IF2, "10.0.2.2");
        router
            .handle_message(now, IF2, addr("10.0.2.2"), PimMessage::Bootstrap(bsm("10.0.0.5", 64, &[])))
            .unwrap();
        router.take_output();

        router.timer_expired(now, crp.kind).unwrap();
        let output = router.take_output();
        let adv = output
            .packets
            .iter()
            .find(|p| matches!(p.message, PimMessage::CandidateRp(_)))
            .unwrap();
        assert_eq!(adv.destination, addr("10.0.0.5"));
        match &adv.message {
            PimMessage::CandidateRp(a) => {
                assert_eq!(a.rp, addr("10.0.1.1"));
                assert_eq!(a.holdtime, 150);
            }
            _ => unreachable!(),
        }
        let next = output
            .timers
            .iter()
            .find(|t| matches!(t.kind, TimerKind::CandidateRp { .. }))
            .unwrap();
        assert!(next.delay < Duration::from_secs(3));
    }
}
