// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Outgoing interface lists and the derived predicates of RFC 4601
//! section 4.1.6 and 4.6.
//!
//! Every function here is a pure read of router state. Nothing is cached
//! except the `immediate_olist`/`inherited_olist` snapshot kept on each entry
//! for introspection, refreshed at the end of every evaluation pass.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use super::assert::AssertState;
use super::tib::{TreeKey, TreeType};
use super::Router;
use crate::env::Environment;
use crate::IfIndex;

/// A set of outgoing interfaces
pub type OifList = BTreeSet<IfIndex>;

impl<E: Environment> Router<E> {
    fn all_interfaces(&self) -> impl Iterator<Item = IfIndex> + '_ {
        self.interfaces.keys().copied()
    }

    /// RP(G) as recorded on the (*,G) entry, else the current mapping
    pub(crate) fn group_rp(&self, group: Ipv4Addr) -> Option<Ipv4Addr> {
        match self.tib.lookup(&TreeKey::star_g(group)) {
            Some(entry) => entry.rp,
            None => self.rp_for_group(group),
        }
    }

    /// RPF_interface(RP(G))
    pub(crate) fn rp_rpf_interface(&self, group: Ipv4Addr) -> Option<IfIndex> {
        if let Some(entry) = self.tib.lookup(&TreeKey::star_g(group)) {
            return entry.rpf_interface();
        }
        let rp = self.rp_for_group(group)?;
        if self.is_local_address(rp) {
            return None;
        }
        self.env.resolve(rp).map(|r| r.interface)
    }

    /// RPF_interface(S)
    pub(crate) fn source_rpf_interface(&self, source: Ipv4Addr, group: Ipv4Addr) -> Option<IfIndex> {
        if let Some(entry) = self.tib.lookup(&TreeKey::sg(source, group)) {
            return entry.rpf_interface();
        }
        if self.is_local_address(source) {
            return None;
        }
        self.env.resolve(source).map(|r| r.interface)
    }

    pub(crate) fn spt_bit(&self, source: Ipv4Addr, group: Ipv4Addr) -> bool {
        self.tib
            .lookup(&TreeKey::sg(source, group))
            .is_some_and(|e| e.spt_bit)
    }

    fn assert_state_of(&self, key: TreeKey, interface: IfIndex) -> AssertState {
        self.tib
            .lookup(&key)
            .map_or(AssertState::NoInfo, |e| e.assert_state(interface))
    }

    /// AssertWinner(key, I) is some other router
    fn assert_lost_to_other(&self, key: TreeKey, interface: IfIndex) -> bool {
        self.assert_state_of(key, interface) == AssertState::Loser
    }

    pub(crate) fn i_am_assert_winner(&self, key: TreeKey, interface: IfIndex) -> bool {
        self.assert_state_of(key, interface) == AssertState::Winner
    }

    pub(crate) fn i_am_assert_loser(&self, key: TreeKey, interface: IfIndex) -> bool {
        self.assert_state_of(key, interface) == AssertState::Loser
    }

    /// Local receivers for `group` (from `source`) on `interface`
    pub(crate) fn local_receiver_include(
        &self,
        group: Ipv4Addr,
        source: Option<Ipv4Addr>,
        interface: IfIndex,
    ) -> bool {
        self.env.includes(group, source, interface)
            || self.local_members.contains(&(group, source, interface))
    }

    /// Interfaces with downstream Join state for `key`
    pub(crate) fn joins(&self, key: TreeKey) -> OifList {
        self.tib.lookup(&key).map_or_else(OifList::new, |entry| {
            entry
                .interfaces
                .iter()
                .filter(|(_, state)| state.is_joined() || state.local_join)
                .map(|(index, _)| *index)
                .collect()
        })
    }

    /// Interfaces with (S,G,rpt) Prune state
    pub(crate) fn prunes_rpt(&self, source: Ipv4Addr, group: Ipv4Addr) -> OifList {
        self.tib
            .lookup(&TreeKey::sg_rpt(source, group))
            .map_or_else(OifList::new, |entry| {
                entry
                    .interfaces
                    .iter()
                    .filter(|(_, state)| state.is_rpt_pruned())
                    .map(|(index, _)| *index)
                    .collect()
            })
    }

    fn joins_star_star_rp(&self, group: Ipv4Addr) -> OifList {
        match self.group_rp(group) {
            Some(rp) => self.joins(TreeKey::star_star_rp(rp)),
            None => OifList::new(),
        }
    }

    pub(crate) fn pim_include_star_g(&self, group: Ipv4Addr) -> OifList {
        let key = TreeKey::star_g(group);
        self.all_interfaces()
            .filter(|&i| {
                ((self.is_dr(i) && !self.lost_assert_star_g(group, i))
                    || self.i_am_assert_winner(key, i))
                    && self.local_receiver_include(group, None, i)
            })
            .collect()
    }

    pub(crate) fn pim_include_sg(&self, source: Ipv4Addr, group: Ipv4Addr) -> OifList {
        let key = TreeKey::sg(source, group);
        self.all_interfaces()
            .filter(|&i| {
                ((self.is_dr(i) && !self.lost_assert_sg(source, group, i))
                    || self.i_am_assert_winner(key, i))
                    && self.local_receiver_include(group, Some(source), i)
            })
            .collect()
    }

    pub(crate) fn pim_exclude_sg(&self, source: Ipv4Addr, group: Ipv4Addr) -> OifList {
        let star_g = TreeKey::star_g(group);
        self.all_interfaces()
            .filter(|&i| {
                ((self.is_dr(i) && !self.lost_assert_star_g(group, i))
                    || self.i_am_assert_winner(star_g, i))
                    && self.env.excludes(group, source, i)
            })
            .collect()
    }

    pub(crate) fn lost_assert_star_g(&self, group: Ipv4Addr, interface: IfIndex) -> bool {
        if self.rp_rpf_interface(group) == Some(interface) {
            return false;
        }
        self.assert_lost_to_other(TreeKey::star_g(group), interface)
    }

    pub(crate) fn lost_assert_sg(&self, source: Ipv4Addr, group: Ipv4Addr, interface: IfIndex) -> bool {
        if self.source_rpf_interface(source, group) == Some(interface)
            || (self.rp_rpf_interface(group) == Some(interface) && !self.spt_bit(source, group))
        {
            return false;
        }
        self.assert_lost_to_other(TreeKey::sg(source, group), interface)
    }

    pub(crate) fn lost_assert_sg_rpt(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        interface: IfIndex,
    ) -> bool {
        if self.rp_rpf_interface(group) == Some(interface)
            || (self.source_rpf_interface(source, group) == Some(interface)
                && self.spt_bit(source, group))
        {
            return false;
        }
        self.assert_lost_to_other(TreeKey::sg(source, group), interface)
    }

    fn without_lost_star_g(&self, group: Ipv4Addr, olist: OifList) -> OifList {
        olist
            .into_iter()
            .filter(|&i| !self.lost_assert_star_g(group, i))
            .collect()
    }

    /// immediate_olist for (*,*,RP), (*,G) and (S,G); empty for (S,G,rpt)
    pub(crate) fn immediate_olist(&self, key: TreeKey) -> OifList {
        match key.tree {
            TreeType::Rp => self.joins(key),
            TreeType::G => {
                let olist: OifList = self
                    .joins(key)
                    .union(&self.pim_include_star_g(key.group))
                    .copied()
                    .collect();
                self.without_lost_star_g(key.group, olist)
            }
            TreeType::Sg => self
                .joins(key)
                .union(&self.pim_include_sg(key.source, key.group))
                .copied()
                .filter(|&i| !self.lost_assert_sg(key.source, key.group, i))
                .collect(),
            TreeType::SgRpt => OifList::new(),
        }
    }

    /// Interfaces a (*,G) packet goes out
    pub(crate) fn inherited_olist_star_g(&self, group: Ipv4Addr) -> OifList {
        let mut olist = self.joins_star_star_rp(group);
        olist.extend(self.joins(TreeKey::star_g(group)));
        olist.extend(self.pim_include_star_g(group));
        self.without_lost_star_g(group, olist)
    }

    pub(crate) fn inherited_olist_sg_rpt(&self, source: Ipv4Addr, group: Ipv4Addr) -> OifList {
        let prunes = self.prunes_rpt(source, group);
        let mut olist: OifList = self
            .joins_star_star_rp(group)
            .union(&self.joins(TreeKey::star_g(group)))
            .filter(|i| !prunes.contains(i))
            .copied()
            .collect();
        let exclude = self.pim_exclude_sg(source, group);
        olist.extend(
            self.pim_include_star_g(group)
                .into_iter()
                .filter(|i| !exclude.contains(i)),
        );
        olist
            .into_iter()
            .filter(|&i| {
                !self.lost_assert_star_g(group, i) && !self.lost_assert_sg_rpt(source, group, i)
            })
            .collect()
    }

    pub(crate) fn inherited_olist_sg(&self, source: Ipv4Addr, group: Ipv4Addr) -> OifList {
        let mut olist = self.inherited_olist_sg_rpt(source, group);
        olist.extend(
            self.joins(TreeKey::sg(source, group))
                .union(&self.pim_include_sg(source, group))
                .filter(|&&i| !self.lost_assert_sg(source, group, i))
                .copied(),
        );
        olist
    }

    /// JoinDesired for (*,*,RP), (*,G) and (S,G)
    pub(crate) fn join_desired(&self, key: TreeKey) -> bool {
        match key.tree {
            TreeType::Rp | TreeType::G => !self.immediate_olist(key).is_empty(),
            TreeType::Sg => {
                if !self.immediate_olist(key).is_empty() {
                    return true;
                }
                let keepalive = self
                    .tib
                    .lookup(&key)
                    .is_some_and(|e| e.keepalive.is_running());
                keepalive && !self.inherited_olist_sg(key.source, key.group).is_empty()
            }
            TreeType::SgRpt => false,
        }
    }

    pub(crate) fn rpt_join_desired(&self, group: Ipv4Addr) -> bool {
        if self.join_desired(TreeKey::star_g(group)) {
            return true;
        }
        match self.group_rp(group) {
            Some(rp) => self.join_desired(TreeKey::star_star_rp(rp)),
            None => false,
        }
    }

    pub(crate) fn prune_desired_sg_rpt(&self, source: Ipv4Addr, group: Ipv4Addr) -> bool {
        if !self.rpt_join_desired(group) {
            return false;
        }
        if self.inherited_olist_sg_rpt(source, group).is_empty() {
            return true;
        }
        self.spt_bit(source, group)
            && self.rpf_prime(TreeKey::star_g(group)) != self.rpf_prime(TreeKey::sg(source, group))
    }

    /// I is in the shared-tree part of inherited_olist(S,G) or in joins(S,G),
    /// ignoring lost (S,G) asserts
    fn sg_assert_candidate(&self, source: Ipv4Addr, group: Ipv4Addr, interface: IfIndex) -> bool {
        let star_g = TreeKey::star_g(group);
        let in_rpt = (self.joins_star_star_rp(group).contains(&interface)
            || self.joins(star_g).contains(&interface))
            && !self.prunes_rpt(source, group).contains(&interface);
        let included = self.pim_include_star_g(group).contains(&interface)
            && !self.pim_exclude_sg(source, group).contains(&interface);
        let shared = (in_rpt || included) && !self.lost_assert_star_g(group, interface);
        shared || self.joins(TreeKey::sg(source, group)).contains(&interface)
    }

    pub(crate) fn could_assert_sg(&self, source: Ipv4Addr, group: Ipv4Addr, interface: IfIndex) -> bool {
        if !self.spt_bit(source, group) || self.source_rpf_interface(source, group) == Some(interface) {
            return false;
        }
        self.sg_assert_candidate(source, group, interface)
            || self.pim_include_sg(source, group).contains(&interface)
    }

    pub(crate) fn could_assert_star_g(&self, group: Ipv4Addr, interface: IfIndex) -> bool {
        if self.rp_rpf_interface(group) == Some(interface) {
            return false;
        }
        self.joins_star_star_rp(group).contains(&interface)
            || self.joins(TreeKey::star_g(group)).contains(&interface)
            || self.pim_include_star_g(group).contains(&interface)
    }

    pub(crate) fn assert_tracking_desired_sg(
        &self,
        source: Ipv4Addr,
        group: Ipv4Addr,
        interface: IfIndex,
    ) -> bool {
        let key = TreeKey::sg(source, group);
        if self.sg_assert_candidate(source, group, interface) {
            return true;
        }
        if self.local_receiver_include(group, Some(source), interface)
            && (self.is_dr(interface) || self.i_am_assert_winner(key, interface))
        {
            return true;
        }
        if self.source_rpf_interface(source, group) == Some(interface) && self.join_desired(key) {
            return true;
        }
        self.rp_rpf_interface(group) == Some(interface)
            && self.join_desired(TreeKey::star_g(group))
            && !self.spt_bit(source, group)
    }

    pub(crate) fn assert_tracking_desired_star_g(&self, group: Ipv4Addr, interface: IfIndex) -> bool {
        let key = TreeKey::star_g(group);
        if self.could_assert_star_g(group, interface) {
            return true;
        }
        if self.local_receiver_include(group, None, interface)
            && (self.is_dr(interface) || self.i_am_assert_winner(key, interface))
        {
            return true;
        }
        self.rp_rpf_interface(group) == Some(interface) && self.rpt_join_desired(group)
    }

    /// RPF' of `key`: the assert winner on the RPF interface when this router
    /// lost there, else the MRIB next hop
    pub(crate) fn rpf_prime(&self, key: TreeKey) -> Option<Ipv4Addr> {
        let entry_rpf = |k: TreeKey| self.tib.lookup(&k).and_then(|e| e.rpf);
        let winner_on = |k: TreeKey, interface: IfIndex| {
            self.tib
                .lookup(&k)
                .and_then(|e| e.interface(interface))
                .filter(|s| s.assert == AssertState::Loser)
                .and_then(|s| s.assert_winner)
                .map(|w| w.address)
        };
        match key.tree {
            TreeType::Rp => entry_rpf(key).and_then(|r| r.neighbor()),
            TreeType::G => {
                let rpf = entry_rpf(key)?;
                winner_on(key, rpf.interface).or_else(|| rpf.neighbor())
            }
            TreeType::Sg => {
                let rpf = entry_rpf(key)?;
                winner_on(key, rpf.interface).or_else(|| rpf.neighbor())
            }
            TreeType::SgRpt => {
                let sg = key.with_tree(TreeType::Sg);
                if let Some(interface) = self.rp_rpf_interface(key.group) {
                    if let Some(winner) = winner_on(sg, interface) {
                        return Some(winner);
                    }
                }
                self.rpf_prime(TreeKey::star_g(key.group))
            }
        }
    }

    /// Refresh the olist snapshot kept on the entry
    pub(crate) fn refresh_olist_cache(&mut self, key: TreeKey) {
        let (immediate, inherited) = match key.tree {
            TreeType::Rp => {
                let joins = self.joins(key);
                (joins.clone(), joins)
            }
            TreeType::G => (
                self.immediate_olist(key),
                self.inherited_olist_star_g(key.group),
            ),
            TreeType::Sg => (
                self.immediate_olist(key),
                self.inherited_olist_sg(key.source, key.group),
            ),
            TreeType::SgRpt => (
                OifList::new(),
                self.inherited_olist_sg_rpt(key.source, key.group),
            ),
        };
        if let Some(entry) = self.tib.lookup_mut(&key) {
            entry.immediate_olist = immediate;
            entry.inherited_olist = inherited;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::router::{DownstreamState, MembershipChange};
    use std::time::Instant;

    #[test]
    fn test_joins_and_local_receivers_in_star_g_olist() {
        let mut router = router();
        let now = Instant::now();
        let group = addr("239.1.1.1");
        router.env_mut().join(group, None, IF1);
        router
            .local_membership_changed(now, group, None, IF1, MembershipChange::Join)
            .unwrap();

        let key = TreeKey::star_g(group);
        assert!(router.immediate_olist(key).contains(&IF1));
        assert!(router.join_desired(key));
        assert_eq!(router.rp_rpf_interface(group), Some(IF2));
    }

    #[test]
    fn test_rpt_prune_removes_interface_from_inherited_olist() {
        let mut router = router();
        let group = addr("239.1.1.1");
        let source = addr("192.168.1.10");
        router
            .ensure_entry(TreeKey::star_g(group))
            .interface_mut(IF1)
            .join_prune = DownstreamState::Join;
        router
            .ensure_entry(TreeKey::star_g(group))
            .interface_mut(IF3)
            .join_prune = DownstreamState::Join;
        router
            .ensure_entry(TreeKey::sg_rpt(source, group))
            .interface_mut(IF1)
            .join_prune = DownstreamState::Pruned;

        let olist = router.inherited_olist_sg_rpt(source, group);
        assert_eq!(olist, OifList::from([IF3]));
        // (S,G) inherits the (S,G,rpt) list plus its own joins
        router
            .ensure_entry(TreeKey::sg(source, group))
            .interface_mut(IF1)
            .join_prune = DownstreamState::Join;
        assert_eq!(router.inherited_olist_sg(source, group), OifList::from([IF1, IF3]));
    }

    #[test]
    fn test_prune_desired_requires_rpt_join() {
        let mut router = router();
        let group = addr("239.1.1.1");
        let source = addr("192.168.1.10");
        router.ensure_entry(TreeKey::sg_rpt(source, group));
        assert!(!router.prune_desired_sg_rpt(source, group));

        router
            .ensure_entry(TreeKey::star_g(group))
            .interface_mut(IF1)
            .join_prune = DownstreamState::Join;
        router
            .ensure_entry(TreeKey::sg_rpt(source, group))
            .interface_mut(IF1)
            .join_prune = DownstreamState::Pruned;
        assert!(router.prune_desired_sg_rpt(source, group));
    }

    #[test]
    fn test_could_assert_needs_spt_bit() {
        let mut router = router();
        let group = addr("239.1.1.1");
        let source = addr("192.168.1.10");
        router
            .ensure_entry(TreeKey::sg(source, group))
            .interface_mut(IF1)
            .join_prune = DownstreamState::Join;
        assert!(!router.could_assert_sg(source, group, IF1));

        router.ensure_entry(TreeKey::sg(source, group)).spt_bit = true;
        assert!(router.could_assert_sg(source, group, IF1));
        // Never on the RPF interface toward the source
        assert!(!router.could_assert_sg(source, group, IF3));
    }

    #[test]
    fn test_rpf_prime_follows_mrib_next_hop() {
        let mut router = router();
        let group = addr("239.1.1.1");
        router.ensure_entry(TreeKey::star_g(group));
        assert_eq!(
            router.rpf_prime(TreeKey::star_g(group)),
            Some(addr("10.0.2.2"))
        );
        let source = addr("192.168.1.10");
        router.ensure_entry(TreeKey::sg_rpt(source, group));
        assert_eq!(
            router.rpf_prime(TreeKey::sg_rpt(source, group)),
            Some(addr("10.0.2.2"))
        );
    }
}
