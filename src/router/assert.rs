// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Assert state machines, RFC 4601 section 4.6
//!
//! Two per-interface machines run side by side: (S,G) asserts on the (S,G)
//! entry and (*,G) asserts on the (*,G) entry. Asserts with the RPT bit clear
//! always belong to the (S,G) machine. Asserts with the RPT bit set go to the
//! (S,G) machine only while it already holds assert state, otherwise to the
//! (*,G) machine.
//!
//! Actions:
//!
//! | Action | Effect |
//! |--------|--------|
//! | A1 | Send Assert, become winner, AT = Assert_Time - Assert_Override |
//! | A2 | Store winner, become loser, AT = Assert_Time |
//! | A3 | Resend Assert, AT = Assert_Time - Assert_Override |
//! | A4 | Send AssertCancel, clear state |
//! | A5 | Clear state |
//! | A6 | A2, and set the SPT bit when on the RPF interface toward S |

use std::cmp::Ordering;
use std::net::Ipv4Addr;
use std::time::Instant;

use super::tib::{TreeKey, TreeType};
use super::upstream::RpfChange;
use super::Router;
use crate::env::Environment;
use crate::error::PimError;
use crate::logging::Facility;
use crate::packet::{Assert, EncodedGroup, PimMessage};
use crate::timer::InterfaceTimer;
use crate::{log_debug, log_info};
use crate::IfIndex;

pub const ASSERT_INFINITE_PREFERENCE: u32 = 0x7FFF_FFFF;
pub const ASSERT_INFINITE_METRIC: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertState {
    NoInfo,
    /// I am assert winner
    Winner,
    /// I am assert loser
    Loser,
}

/// Assert metric; ordering puts the better metric last
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssertMetric {
    pub rpt_bit: bool,
    pub preference: u32,
    pub metric: u32,
    pub address: Ipv4Addr,
}

impl AssertMetric {
    /// The worst possible metric, also used by AssertCancel
    pub fn infinite(address: Ipv4Addr) -> Self {
        Self {
            rpt_bit: true,
            preference: ASSERT_INFINITE_PREFERENCE,
            metric: ASSERT_INFINITE_METRIC,
            address,
        }
    }

    pub fn is_cancel(&self) -> bool {
        self.rpt_bit
            && self.preference == ASSERT_INFINITE_PREFERENCE
            && self.metric == ASSERT_INFINITE_METRIC
    }

    pub fn from_message(assert: &Assert, sender: Ipv4Addr) -> Self {
        Self {
            rpt_bit: assert.rpt_bit,
            preference: assert.preference,
            metric: assert.metric,
            address: sender,
        }
    }
}

impl Ord for AssertMetric {
    fn cmp(&self, other: &Self) -> Ordering {
        // RPT bit clear beats set, then lower preference, then lower metric,
        // then higher address
        other
            .rpt_bit
            .cmp(&self.rpt_bit)
            .then(other.preference.cmp(&self.preference))
            .then(other.metric.cmp(&self.metric))
            .then(self.address.cmp(&other.address))
    }
}

impl PartialOrd for AssertMetric {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// How a received assert compares to local state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertClass {
    /// Better than my metric and than the stored winner
    Preferred,
    /// Worse than my metric, or a cancel
    Inferior,
    /// Better than my metric but not than the stored winner
    Ordinary,
}

pub fn classify(
    received: &AssertMetric,
    mine: &AssertMetric,
    winner: Option<&AssertMetric>,
) -> AssertClass {
    if received.is_cancel() || received < mine {
        AssertClass::Inferior
    } else if winner.map_or(true, |w| received > w) {
        AssertClass::Preferred
    } else {
        AssertClass::Ordinary
    }
}

impl<E: Environment> Router<E> {
    fn my_metric(&self, rpt_bit: bool, target: Option<Ipv4Addr>, interface: IfIndex) -> AssertMetric {
        let address = self
            .interface_address(interface)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let Some(target) = target else {
            return AssertMetric::infinite(address);
        };
        if self.is_local_address(target) {
            return AssertMetric {
                rpt_bit,
                preference: 0,
                metric: 0,
                address,
            };
        }
        match self.env.resolve(target) {
            Some(route) => AssertMetric {
                rpt_bit,
                preference: route.preference,
                metric: route.metric,
                address,
            },
            None => AssertMetric::infinite(address),
        }
    }

    /// my_assert_metric(S,G,I) or my_assert_metric(*,G,I)
    pub(crate) fn my_assert_metric(&self, key: TreeKey, interface: IfIndex) -> AssertMetric {
        let spt = key.tree == TreeType::Sg && self.could_assert_sg(key.source, key.group, interface);
        if spt {
            return self.my_metric(false, Some(key.source), interface);
        }
        if self.could_assert_star_g(key.group, interface) {
            return self.my_metric(true, self.group_rp(key.group), interface);
        }
        let address = self
            .interface_address(interface)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        AssertMetric::infinite(address)
    }

    fn could_assert(&self, key: TreeKey, interface: IfIndex) -> bool {
        match key.tree {
            TreeType::Sg => self.could_assert_sg(key.source, key.group, interface),
            _ => self.could_assert_star_g(key.group, interface),
        }
    }

    fn assert_tracking_desired(&self, key: TreeKey, interface: IfIndex) -> bool {
        match key.tree {
            TreeType::Sg => self.assert_tracking_desired_sg(key.source, key.group, interface),
            _ => self.assert_tracking_desired_star_g(key.group, interface),
        }
    }

    pub(crate) fn receive_assert(
        &mut self,
        now: Instant,
        interface: IfIndex,
        sender: Ipv4Addr,
        assert: &Assert,
    ) -> Result<(), PimError> {
        if self.is_local_address(sender) {
            return Ok(());
        }
        let group = assert.group.address;
        let source = assert.source;
        let received = AssertMetric::from_message(assert, sender);

        let sg = TreeKey::sg(source, group);
        let sg_has_state = self
            .tib
            .lookup(&sg)
            .is_some_and(|e| e.assert_state(interface) != AssertState::NoInfo);

        let key = if !assert.rpt_bit || (!source.is_unspecified() && sg_has_state) {
            sg
        } else {
            TreeKey::star_g(group)
        };
        self.assert_event(now, key, interface, received, source)?;
        self.evaluate_group(now, group)
    }

    /// Run one received assert through the machine of `key`
    fn assert_event(
        &mut self,
        now: Instant,
        key: TreeKey,
        interface: IfIndex,
        received: AssertMetric,
        packet_source: Ipv4Addr,
    ) -> Result<(), PimError> {
        let mine = self.my_assert_metric(key, interface);
        let (state, winner) = self
            .tib
            .lookup(&key)
            .and_then(|e| e.interface(interface))
            .map_or((AssertState::NoInfo, None), |s| (s.assert, s.assert_winner));
        let stored = match state {
            AssertState::Loser => winner,
            _ => None,
        };
        let class = classify(&received, &mine, stored.as_ref());
        let from_winner = stored.is_some_and(|w| w.address == received.address);

        log_debug!(
            self.logger,
            Facility::Assert,
            &format!(
                "PIM: assert {} on {} from {} is {:?} in {:?}",
                key, interface, received.address, class, state
            )
        );

        match (state, class) {
            (AssertState::NoInfo, AssertClass::Inferior) => {
                if self.could_assert(key, interface) {
                    self.assert_win(now, key, interface, packet_source)?;
                }
            }
            (AssertState::NoInfo, _) => {
                let acceptable = key.tree == TreeType::G || !received.rpt_bit;
                if acceptable && self.assert_tracking_desired(key, interface) {
                    self.assert_lose(now, key, interface, received)?;
                }
            }
            (AssertState::Winner, AssertClass::Inferior) => {
                self.assert_resend(now, key, interface, packet_source)?;
            }
            (AssertState::Winner, _) => {
                self.assert_lose(now, key, interface, received)?;
            }
            (AssertState::Loser, AssertClass::Preferred) => {
                self.assert_lose(now, key, interface, received)?;
            }
            (AssertState::Loser, AssertClass::Ordinary) if from_winner => {
                self.assert_lose(now, key, interface, received)?;
            }
            (AssertState::Loser, AssertClass::Inferior) if from_winner => {
                self.assert_clear(now, key, interface)?;
            }
            (AssertState::Loser, _) => {}
        }
        Ok(())
    }

    /// Data arrived on `interface`, which is in our olist
    pub(crate) fn data_triggered_assert(
        &mut self,
        now: Instant,
        source: Ipv4Addr,
        group: Ipv4Addr,
        interface: IfIndex,
    ) -> Result<(), PimError> {
        let sg = TreeKey::sg(source, group);
        let sg_state = self
            .tib
            .lookup(&sg)
            .map_or(AssertState::NoInfo, |e| e.assert_state(interface));
        if sg_state == AssertState::NoInfo && self.could_assert_sg(source, group, interface) {
            return self.assert_win(now, sg, interface, source);
        }
        let star_g = TreeKey::star_g(group);
        let star_state = self
            .tib
            .lookup(&star_g)
            .map_or(AssertState::NoInfo, |e| e.assert_state(interface));
        if sg_state == AssertState::NoInfo
            && star_state == AssertState::NoInfo
            && self.could_assert_star_g(group, interface)
        {
            return self.assert_win(now, star_g, interface, source);
        }
        Ok(())
    }

    pub(crate) fn assert_timer_expired(
        &mut self,
        now: Instant,
        key: TreeKey,
        interface: IfIndex,
    ) -> Result<(), PimError> {
        let state = self
            .tib
            .lookup(&key)
            .map_or(AssertState::NoInfo, |e| e.assert_state(interface));
        match state {
            AssertState::Winner => {
                let source = if key.tree == TreeType::Sg {
                    key.source
                } else {
                    Ipv4Addr::UNSPECIFIED
                };
                self.assert_resend(now, key, interface, source)
            }
            AssertState::Loser => self.assert_clear(now, key, interface),
            AssertState::NoInfo => Ok(()),
        }
    }

    /// Re-check CouldAssert and AssertTrackingDesired for every interface
    /// with assert state on `key`
    pub(crate) fn update_assert_tracking(&mut self, now: Instant, key: TreeKey) -> Result<(), PimError> {
        let Some(entry) = self.tib.lookup(&key) else {
            return Ok(());
        };
        let active: Vec<(IfIndex, AssertState, Option<AssertMetric>)> = entry
            .interfaces
            .iter()
            .filter(|(_, s)| s.assert != AssertState::NoInfo)
            .map(|(i, s)| (*i, s.assert, s.assert_winner))
            .collect();

        for (interface, state, winner) in active {
            match state {
                AssertState::Winner if !self.could_assert(key, interface) => {
                    self.assert_cancel(now, key, interface)?;
                }
                AssertState::Loser => {
                    let mine = self.my_assert_metric(key, interface);
                    let beaten = winner.is_some_and(|w| mine > w);
                    if beaten || !self.assert_tracking_desired(key, interface) {
                        self.assert_clear(now, key, interface)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// A5 on every entry whose winner on `interface` is `neighbor`
    pub(crate) fn assert_winner_gone(
        &mut self,
        now: Instant,
        interface: IfIndex,
        neighbor: Ipv4Addr,
    ) -> Result<(), PimError> {
        let keys: Vec<TreeKey> = self
            .tib
            .iter()
            .filter(|e| {
                e.interface(interface).is_some_and(|s| {
                    s.assert == AssertState::Loser
                        && s.assert_winner.is_some_and(|w| w.address == neighbor)
                })
            })
            .map(|e| e.key)
            .collect();
        for key in keys {
            self.assert_clear(now, key, interface)?;
        }
        Ok(())
    }

    /// Join received on an interface where this router lost the assert
    pub(crate) fn assert_reset_on_join(
        &mut self,
        now: Instant,
        key: TreeKey,
        interface: IfIndex,
    ) -> Result<(), PimError> {
        if self.i_am_assert_loser(key, interface) {
            self.assert_clear(now, key, interface)?;
        }
        Ok(())
    }

    fn send_assert(&mut self, key: TreeKey, interface: IfIndex, metric: AssertMetric, source: Ipv4Addr) {
        let source = match key.tree {
            TreeType::Sg => key.source,
            _ => source,
        };
        let message = Assert {
            group: EncodedGroup::host(key.group),
            source,
            rpt_bit: metric.rpt_bit,
            preference: metric.preference,
            metric: metric.metric,
        };
        self.send_multicast(interface, PimMessage::Assert(message));
    }

    /// A1
    fn assert_win(
        &mut self,
        now: Instant,
        key: TreeKey,
        interface: IfIndex,
        source: Ipv4Addr,
    ) -> Result<(), PimError> {
        let mine = self.my_assert_metric(key, interface);
        self.send_assert(key, interface, mine, source);
        let state = self.ensure_entry(key).interface_mut(interface);
        state.assert = AssertState::Winner;
        state.assert_winner = Some(mine);
        let delay = self
            .config
            .timers
            .assert_time
            .saturating_sub(self.config.timers.assert_override);
        self.arm_iface_timer(now, key, interface, InterfaceTimer::Assert, delay);
        self.stats.asserts_won += 1;
        log_info!(
            self.logger,
            Facility::Assert,
            &format!("PIM: won assert {} on {}", key, interface)
        );
        self.assert_changed(now, key, interface)
    }

    /// A3
    fn assert_resend(
        &mut self,
        now: Instant,
        key: TreeKey,
        interface: IfIndex,
        source: Ipv4Addr,
    ) -> Result<(), PimError> {
        let mine = self.my_assert_metric(key, interface);
        self.send_assert(key, interface, mine, source);
        if let Some(entry) = self.tib.lookup_mut(&key) {
            entry.interface_mut(interface).assert_winner = Some(mine);
        }
        let delay = self
            .config
            .timers
            .assert_time
            .saturating_sub(self.config.timers.assert_override);
        self.arm_iface_timer(now, key, interface, InterfaceTimer::Assert, delay);
        Ok(())
    }

    /// A2, plus the A6 SPT bit update for (S,G)
    fn assert_lose(
        &mut self,
        now: Instant,
        key: TreeKey,
        interface: IfIndex,
        winner: AssertMetric,
    ) -> Result<(), PimError> {
        let was_loser = self.i_am_assert_loser(key, interface);
        let state = self.ensure_entry(key).interface_mut(interface);
        state.assert = AssertState::Loser;
        state.assert_winner = Some(winner);
        self.arm_iface_timer(
            now,
            key,
            interface,
            InterfaceTimer::Assert,
            self.config.timers.assert_time,
        );

        if key.tree == TreeType::Sg && self.source_rpf_interface(key.source, key.group) == Some(interface) {
            if let Some(entry) = self.tib.lookup_mut(&key) {
                if entry.is_joined_upstream() {
                    entry.spt_bit = true;
                }
            }
        }
        if !was_loser {
            self.stats.asserts_lost += 1;
            log_info!(
                self.logger,
                Facility::Assert,
                &format!(
                    "PIM: lost assert {} on {} to {}",
                    key, interface, winner.address
                )
            );
        }
        self.assert_changed(now, key, interface)
    }

    /// A4
    fn assert_cancel(&mut self, now: Instant, key: TreeKey, interface: IfIndex) -> Result<(), PimError> {
        let address = self
            .interface_address(interface)
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        self.send_assert(
            key,
            interface,
            AssertMetric::infinite(address),
            Ipv4Addr::UNSPECIFIED,
        );
        self.assert_clear(now, key, interface)
    }

    /// A5
    fn assert_clear(&mut self, now: Instant, key: TreeKey, interface: IfIndex) -> Result<(), PimError> {
        if let Some(entry) = self.tib.lookup_mut(&key) {
            let state = entry.interface_mut(interface);
            state.assert = AssertState::NoInfo;
            state.assert_winner = None;
            state.assert_timer.stop();
        }
        log_debug!(
            self.logger,
            Facility::Assert,
            &format!("PIM: cleared assert {} on {}", key, interface)
        );
        self.assert_changed(now, key, interface)
    }

    /// Assert state on `interface` changed; RPF' of affected entries may
    /// move with it
    fn assert_changed(&mut self, now: Instant, key: TreeKey, interface: IfIndex) -> Result<(), PimError> {
        match key.tree {
            TreeType::Sg => {
                if self.source_rpf_interface(key.source, key.group) == Some(interface) {
                    self.refresh_rpf_prime(now, key, RpfChange::Assert)?;
                }
                if self.rp_rpf_interface(key.group) == Some(interface) {
                    let rpt = key.with_tree(TreeType::SgRpt);
                    if self.tib.contains(&rpt) {
                        self.refresh_rpf_prime(now, rpt, RpfChange::Assert)?;
                    }
                }
            }
            TreeType::G => {
                if self.rp_rpf_interface(key.group) == Some(interface) {
                    self.refresh_rpf_prime(now, key, RpfChange::Assert)?;
                    for rpt in self.tib.sources(key.group, TreeType::SgRpt) {
                        self.refresh_rpf_prime(now, rpt, RpfChange::Assert)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
