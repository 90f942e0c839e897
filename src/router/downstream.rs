// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Downstream per-interface Join/Prune state machines, RFC 4601 section
//! 4.5.1 to 4.5.4, and the mirroring of local membership into them.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::assert::AssertState;
use super::tib::{DownstreamState, TreeKey, TreeType};
use super::{MembershipChange, Router};
use crate::env::Environment;
use crate::error::PimError;
use crate::logging::Facility;
use crate::packet::{JoinPrune, PimMessage, HOLDTIME_INFINITE};
use crate::timer::InterfaceTimer;
use crate::IfIndex;
use crate::{log_debug, log_info, log_warning};

impl<E: Environment> Router<E> {
    /// IGMP reported a receiver change on `interface`
    pub fn local_membership_changed(
        &mut self,
        now: Instant,
        group: Ipv4Addr,
        source: Option<Ipv4Addr>,
        interface: IfIndex,
        change: MembershipChange,
    ) -> Result<(), PimError> {
        self.check_interface(interface)?;
        if !group.is_multicast() {
            log_warning!(
                self.logger,
                Facility::JoinPrune,
                &format!("PIM: ignoring membership for non-multicast {}", group)
            );
            return Ok(());
        }
        match change {
            MembershipChange::Join => self.local_members.insert((group, source, interface)),
            MembershipChange::Leave => self.local_members.remove(&(group, source, interface)),
        };
        if source.is_none() && self.is_ssm(group) {
            log_debug!(
                self.logger,
                Facility::JoinPrune,
                &format!("PIM: no shared tree for SSM group {}", group)
            );
            return Ok(());
        }
        log_info!(
            self.logger,
            Facility::JoinPrune,
            &format!(
                "PIM: local {:?} for ({},{}) on {}",
                change,
                source.map_or_else(|| "*".to_string(), |s| s.to_string()),
                group,
                interface
            )
        );
        self.mirror_local_membership(group, source, interface);
        self.evaluate_group(now, group)
    }

    /// Keep the local_join flag of one (entry, interface) in line with
    /// membership and DR role
    fn mirror_local_membership(&mut self, group: Ipv4Addr, source: Option<Ipv4Addr>, interface: IfIndex) {
        let key = source.map_or_else(|| TreeKey::star_g(group), |s| TreeKey::sg(s, group));
        let wanted = self.local_members.contains(&(group, source, interface)) && self.is_dr(interface);
        if wanted {
            let state = self.ensure_entry(key).interface_mut(interface);
            state.local_join = true;
            if matches!(
                state.join_prune,
                DownstreamState::NoInfo | DownstreamState::PrunePending
            ) {
                state.join_prune = DownstreamState::Join;
                state.prune_pending.stop();
            }
        } else if let Some(state) = self
            .tib
            .lookup_mut(&key)
            .and_then(|e| e.interfaces.get_mut(&interface))
        {
            if state.local_join {
                state.local_join = false;
                if state.join_prune == DownstreamState::Join && !state.expiry.is_running() {
                    state.join_prune = DownstreamState::NoInfo;
                }
            }
        }
    }

    /// DR role on `interface` moved: re-mirror its local members
    pub(crate) fn dr_changed(&mut self, now: Instant, interface: IfIndex) -> Result<(), PimError> {
        let members: Vec<(Ipv4Addr, Option<Ipv4Addr>)> = self
            .local_members
            .iter()
            .filter(|(_, _, i)| *i == interface)
            .map(|(g, s, _)| (*g, *s))
            .collect();
        for (group, source) in members {
            if source.is_none() && self.is_ssm(group) {
                continue;
            }
            self.mirror_local_membership(group, source, interface);
        }
        self.evaluate_all(now)
    }

    fn set_downstream(&mut self, key: TreeKey, interface: IfIndex, state: DownstreamState) {
        if let Some(entry) = self.tib.lookup_mut(&key) {
            let old = entry.downstream_state(interface);
            if old != state {
                entry.interface_mut(interface).join_prune = state;
                log_debug!(
                    self.logger,
                    Facility::JoinPrune,
                    &format!("PIM: {} on {} {:?} -> {:?}", key, interface, old, state)
                );
            }
        }
    }

    /// Leave Join/PrunePending: back to NoInfo, or to Join while local
    /// receivers are mirrored
    fn clear_downstream(&mut self, key: TreeKey, interface: IfIndex) {
        self.stop_iface_timer(key, interface, InterfaceTimer::Expiry);
        self.stop_iface_timer(key, interface, InterfaceTimer::PrunePending);
        let local = self
            .tib
            .lookup(&key)
            .and_then(|e| e.interface(interface))
            .is_some_and(|s| s.local_join);
        let state = if local {
            DownstreamState::Join
        } else {
            DownstreamState::NoInfo
        };
        self.set_downstream(key, interface, state);
    }

    /// ET = max(ET, holdtime); infinite holdtime stops it
    fn extend_expiry(&mut self, now: Instant, key: TreeKey, interface: IfIndex, holdtime: u16) {
        if holdtime == HOLDTIME_INFINITE {
            self.stop_iface_timer(key, interface, InterfaceTimer::Expiry);
            return;
        }
        let delay = Duration::from_secs(u64::from(holdtime));
        let remaining = self
            .tib
            .lookup_mut(&key)
            .and_then(|e| e.interfaces.get_mut(&interface))
            .and_then(|s| s.expiry.remaining(now));
        if remaining.map_or(true, |r| r < delay) {
            self.arm_iface_timer(now, key, interface, InterfaceTimer::Expiry, delay);
        }
    }

    fn start_prune_pending(&mut self, now: Instant, key: TreeKey, interface: IfIndex) {
        let delay = self
            .config
            .timers
            .prune_pending_delay(self.neighbor_count(interface));
        if delay.is_zero() {
            self.prune_pending_expired(now, key, interface);
        } else {
            self.arm_iface_timer(now, key, interface, InterfaceTimer::PrunePending, delay);
        }
    }

    /// Receive Join(*,*,RP), Join(*,G) or Join(S,G)
    pub(crate) fn receive_join(&mut self, now: Instant, key: TreeKey, interface: IfIndex, holdtime: u16) -> Result<(), PimError> {
        let lost = self.ensure_entry(key).assert_state(interface) == AssertState::Loser;
        let state = self.tib.lookup(&key).map_or(DownstreamState::NoInfo, |e| e.downstream_state(interface));
        match state {
            DownstreamState::NoInfo => {
                self.set_downstream(key, interface, DownstreamState::Join);
                self.stop_iface_timer(key, interface, InterfaceTimer::Expiry);
                self.extend_expiry(now, key, interface, holdtime);
            }
            DownstreamState::Join => self.extend_expiry(now, key, interface, holdtime),
            DownstreamState::PrunePending => {
                self.set_downstream(key, interface, DownstreamState::Join);
                self.stop_iface_timer(key, interface, InterfaceTimer::PrunePending);
                self.extend_expiry(now, key, interface, holdtime);
            }
            other => {
                return self.invariant(format!("{} on {} in {:?} got a Join", key, interface, other));
            }
        }
        // A downstream router joining on a lost-assert interface resets the
        // assert so forwarding can resume
        if lost && matches!(key.tree, TreeType::G | TreeType::Sg) {
            self.assert_reset_on_join(now, key, interface)?;
        }
        Ok(())
    }

    /// Receive Prune(*,*,RP), Prune(*,G) or Prune(S,G)
    pub(crate) fn receive_prune(&mut self, now: Instant, key: TreeKey, interface: IfIndex) {
        let state = self.tib.lookup(&key).map_or(DownstreamState::NoInfo, |e| e.downstream_state(interface));
        if state == DownstreamState::Join {
            self.set_downstream(key, interface, DownstreamState::PrunePending);
            self.start_prune_pending(now, key, interface);
        }
    }

    /// Receive Join(S,G,rpt)
    pub(crate) fn receive_rpt_join(&mut self, key: TreeKey, interface: IfIndex) {
        let state = self.tib.lookup(&key).map_or(DownstreamState::NoInfo, |e| e.downstream_state(interface));
        if state != DownstreamState::NoInfo {
            self.stop_iface_timer(key, interface, InterfaceTimer::Expiry);
            self.stop_iface_timer(key, interface, InterfaceTimer::PrunePending);
            self.set_downstream(key, interface, DownstreamState::NoInfo);
        }
    }

    /// Receive Prune(S,G,rpt)
    pub(crate) fn receive_rpt_prune(&mut self, now: Instant, key: TreeKey, interface: IfIndex, holdtime: u16) {
        let state = self.ensure_entry(key).downstream_state(interface);
        match state {
            DownstreamState::NoInfo => {
                self.set_downstream(key, interface, DownstreamState::PrunePending);
                self.stop_iface_timer(key, interface, InterfaceTimer::Expiry);
                self.extend_expiry(now, key, interface, holdtime);
                self.start_prune_pending(now, key, interface);
            }
            DownstreamState::Pruned | DownstreamState::PruneTmp => {
                self.set_downstream(key, interface, DownstreamState::Pruned);
                self.extend_expiry(now, key, interface, holdtime);
            }
            DownstreamState::PrunePendingTmp => {
                self.set_downstream(key, interface, DownstreamState::PrunePending);
                self.extend_expiry(now, key, interface, holdtime);
            }
            DownstreamState::PrunePending | DownstreamState::Join => {
                self.extend_expiry(now, key, interface, holdtime);
            }
        }
    }

    /// Join(*,G) in the same message: (S,G,rpt) prunes become tentative
    pub(crate) fn rpt_star_g_join(&mut self, group: Ipv4Addr, interface: IfIndex) {
        for key in self.tib.sources(group, TreeType::SgRpt) {
            let state = self.tib.lookup(&key).map_or(DownstreamState::NoInfo, |e| e.downstream_state(interface));
            match state {
                DownstreamState::Pruned => self.set_downstream(key, interface, DownstreamState::PruneTmp),
                DownstreamState::PrunePending => {
                    self.set_downstream(key, interface, DownstreamState::PrunePendingTmp)
                }
                _ => {}
            }
        }
    }

    /// End of one Join/Prune group block: tentative states that were not
    /// re-confirmed fall back to NoInfo
    pub(crate) fn rpt_end_of_message(&mut self, group: Ipv4Addr, interface: IfIndex) {
        for key in self.tib.sources(group, TreeType::SgRpt) {
            let state = self.tib.lookup(&key).map_or(DownstreamState::NoInfo, |e| e.downstream_state(interface));
            if matches!(state, DownstreamState::PruneTmp | DownstreamState::PrunePendingTmp) {
                self.stop_iface_timer(key, interface, InterfaceTimer::Expiry);
                self.stop_iface_timer(key, interface, InterfaceTimer::PrunePending);
                self.set_downstream(key, interface, DownstreamState::NoInfo);
            }
        }
    }

    pub(crate) fn expiry_timer_expired(&mut self, _now: Instant, key: TreeKey, interface: IfIndex) {
        log_debug!(
            self.logger,
            Facility::JoinPrune,
            &format!("PIM: downstream state {} on {} expired", key, interface)
        );
        if key.tree == TreeType::SgRpt {
            self.stop_iface_timer(key, interface, InterfaceTimer::PrunePending);
            self.set_downstream(key, interface, DownstreamState::NoInfo);
        } else {
            self.clear_downstream(key, interface);
        }
    }

    pub(crate) fn prune_pending_expired(&mut self, _now: Instant, key: TreeKey, interface: IfIndex) {
        let state = self.tib.lookup(&key).map_or(DownstreamState::NoInfo, |e| e.downstream_state(interface));
        if key.tree == TreeType::SgRpt {
            if state == DownstreamState::PrunePending {
                self.stop_iface_timer(key, interface, InterfaceTimer::PrunePending);
                self.set_downstream(key, interface, DownstreamState::Pruned);
            }
            return;
        }
        if state != DownstreamState::PrunePending {
            return;
        }
        self.clear_downstream(key, interface);
        if self.neighbor_count(interface) > 1 {
            self.send_prune_echo(key, interface);
        }
    }

    /// Prune addressed to ourselves so that routers that missed the
    /// original Prune get a chance to override it
    fn send_prune_echo(&mut self, key: TreeKey, interface: IfIndex) {
        let Some(address) = self.interface_address(interface) else {
            return;
        };
        let rp = self.tib.lookup(&key).and_then(|e| e.rp);
        let Some((group, source)) = self.join_prune_encoding(key, rp) else {
            return;
        };
        let mut message = JoinPrune::new(address, self.join_prune_holdtime());
        message.add_prune(group, source);
        log_debug!(
            self.logger,
            Facility::JoinPrune,
            &format!("PIM: PruneEcho {} on {}", key, interface)
        );
        self.send_multicast(interface, PimMessage::JoinPrune(message));
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::router::UpstreamState;
    use crate::timer::TimerKind;

    fn expiry_delay(router: &mut Router<crate::env::StaticEnvironment>) -> Option<Duration> {
        router
            .take_output()
            .timers
            .iter()
            .rev()
            .find(|t| matches!(t.kind, TimerKind::Downstream { slot: InterfaceTimer::Expiry, .. }))
            .map(|t| t.delay)
    }

    #[test]
    fn test_join_then_longer_join_extends_expiry() {
        let mut router = router();
        let now = Instant::now();
        let key = TreeKey::star_g(addr("239.1.1.1"));

        router.receive_join(now, key, IF1, 100).unwrap();
        assert_eq!(router.entry(&key).unwrap().downstream_state(IF1), DownstreamState::Join);
        assert_eq!(expiry_delay(&mut router), Some(Duration::from_secs(100)));

        router.receive_join(now, key, IF1, 50).unwrap();
        assert_eq!(expiry_delay(&mut router), None);

        router.receive_join(now, key, IF1, 210).unwrap();
        assert_eq!(expiry_delay(&mut router), Some(Duration::from_secs(210)));
    }

    #[test]
    fn test_prune_with_single_neighbor_is_immediate() {
        let mut router = router();
        let now = Instant::now();
        hello_from(&mut router, now, IF1, "10.0.1.2");
        let key = TreeKey::star_g(addr("239.1.1.1"));
        router.receive_join(now, key, IF1, 210).unwrap();
        router.receive_prune(now, key, IF1);
        assert_eq!(router.entry(&key).unwrap().downstream_state(IF1), DownstreamState::NoInfo);
    }

    #[test]
    fn test_prune_on_lan_waits_and_echoes() {
        let mut router = router();
        let now = Instant::now();
        hello_from(&mut router, now, IF1, "10.0.1.2");
        hello_from(&mut router, now, IF1, "10.0.1.3");
        router.take_output();
        let key = TreeKey::star_g(addr("239.1.1.1"));
        router.receive_join(now, key, IF1, 210).unwrap();
        router.receive_prune(now, key, IF1);
        assert_eq!(
            router.entry(&key).unwrap().downstream_state(IF1),
            DownstreamState::PrunePending
        );
        let pending = router
            .take_output()
            .timers
            .into_iter()
            .find(|t| matches!(t.kind, TimerKind::Downstream { slot: InterfaceTimer::PrunePending, .. }))
            .unwrap();
        assert_eq!(pending.delay, Duration::from_secs(3));

        router.timer_expired(now, pending.kind).unwrap();
        let output = router.take_output();
        let echo = join_prunes(&output)
            .into_iter()
            .find(|(iface, _)| *iface == Some(IF1))
            .unwrap();
        assert_eq!(echo.1.upstream_neighbor, addr("10.0.1.1"));
        assert_eq!(echo.1.groups[0].prunes.len(), 1);
    }

    #[test]
    fn test_prune_leaves_expiry_timer_alone() {
        let mut router = router();
        let now = Instant::now();
        hello_from(&mut router, now, IF1, "10.0.1.2");
        hello_from(&mut router, now, IF1, "10.0.1.3");
        let key = TreeKey::star_g(addr("239.1.1.1"));
        router.receive_join(now, key, IF1, 100).unwrap();
        router.take_output();

        router.receive_prune(now, key, IF1);
        assert_eq!(
            router.entry(&key).unwrap().downstream_state(IF1),
            DownstreamState::PrunePending
        );
        assert_eq!(expiry_delay(&mut router), None);
    }

    #[test]
    fn test_join_prune_join_within_holdtime_stays_joined() {
        let mut router = router();
        let now = Instant::now();
        hello_from(&mut router, now, IF1, "10.0.1.2");
        hello_from(&mut router, now, IF1, "10.0.1.3");
        let key = TreeKey::star_g(addr("239.1.1.1"));

        router.receive_join(now, key, IF1, 210).unwrap();
        router.receive_prune(now, key, IF1);
        let pending = router
            .take_output()
            .timers
            .into_iter()
            .find(|t| matches!(t.kind, TimerKind::Downstream { slot: InterfaceTimer::PrunePending, .. }))
            .unwrap();
        router.receive_join(now, key, IF1, 210).unwrap();
        assert_eq!(router.entry(&key).unwrap().downstream_state(IF1), DownstreamState::Join);

        // The overridden prune-pending timer no longer applies
        router.timer_expired(now + pending.delay, pending.kind).unwrap();
        assert_eq!(router.entry(&key).unwrap().downstream_state(IF1), DownstreamState::Join);
    }

    #[test]
    fn test_igmp_join_creates_star_g_and_joins_toward_rp() {
        let mut router = router();
        let now = Instant::now();
        let group = addr("230.1.1.1");
        router
            .local_membership_changed(now, group, None, IF1, MembershipChange::Join)
            .unwrap();

        let entry = router.entry(&TreeKey::star_g(group)).unwrap();
        assert_eq!(entry.downstream_state(IF1), DownstreamState::Join);
        assert_eq!(entry.upstream, UpstreamState::Joined);

        let output = router.take_output();
        let (iface, jp) = join_prunes(&output).into_iter().next().unwrap();
        assert_eq!(iface, Some(IF2));
        assert_eq!(jp.upstream_neighbor, addr("10.0.2.2"));
        assert_eq!(jp.groups[0].group.address, group);
        let source = jp.groups[0].joins[0];
        assert_eq!(source.address, addr("10.0.0.5"));
        assert!(source.wildcard && source.rpt);
    }

    #[test]
    fn test_rpt_prune_tmp_states_settle_at_end_of_message() {
        let mut router = router();
        let now = Instant::now();
        let group = addr("239.1.1.1");
        let rpt = TreeKey::sg_rpt(addr("192.168.1.10"), group);
        router.receive_rpt_prune(now, rpt, IF1, 210);
        // No neighbors on IF1: prune pending collapses to Pruned at once
        assert_eq!(router.entry(&rpt).unwrap().downstream_state(IF1), DownstreamState::Pruned);

        // Join(*,G) with the prune repeated keeps it pruned
        router.rpt_star_g_join(group, IF1);
        assert_eq!(router.entry(&rpt).unwrap().downstream_state(IF1), DownstreamState::PruneTmp);
        router.receive_rpt_prune(now, rpt, IF1, 210);
        router.rpt_end_of_message(group, IF1);
        assert_eq!(router.entry(&rpt).unwrap().downstream_state(IF1), DownstreamState::Pruned);

        // Join(*,G) alone clears it
        router.rpt_star_g_join(group, IF1);
        router.rpt_end_of_message(group, IF1);
        assert_eq!(router.entry(&rpt).unwrap().downstream_state(IF1), DownstreamState::NoInfo);
    }

    #[test]
    fn test_local_membership_mirrors_join_while_dr() {
        let mut router = router();
        let now = Instant::now();
        let group = addr("239.1.1.1");
        router
            .local_membership_changed(now, group, None, IF1, MembershipChange::Join)
            .unwrap();
        let key = TreeKey::star_g(group);
        let entry = router.entry(&key).unwrap();
        assert_eq!(entry.downstream_state(IF1), DownstreamState::Join);
        assert_eq!(entry.upstream, UpstreamState::Joined);

        router
            .local_membership_changed(now, group, None, IF1, MembershipChange::Leave)
            .unwrap();
        assert!(router.entry(&key).is_none());
    }

    #[test]
    fn test_local_membership_ignored_when_not_dr() {
        let mut router = router();
        let now = Instant::now();
        // A higher address with equal priority takes over DR on IF1
        hello_from(&mut router, now, IF1, "10.0.1.9");
        let group = addr("239.1.1.1");
        router
            .local_membership_changed(now, group, None, IF1, MembershipChange::Join)
            .unwrap();
        assert!(router.entry(&TreeKey::star_g(group)).is_none());
    }

    #[test]
    fn test_ssm_group_has_no_shared_tree() {
        let mut router = router();
        let now = Instant::now();
        let group = addr("232.1.1.1");
        router
            .local_membership_changed(now, group, None, IF1, MembershipChange::Join)
            .unwrap();
        assert!(router.tib().is_empty());

        let source = addr("192.168.1.10");
        router
            .local_membership_changed(now, group, Some(source), IF1, MembershipChange::Join)
            .unwrap();
        let entry = router.entry(&TreeKey::sg(source, group)).unwrap();
        assert_eq!(entry.upstream, UpstreamState::Joined);
    }
}
