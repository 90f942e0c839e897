// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Per-packet forwarding decision
//!
//! For each data packet the router checks the incoming interface against
//! RPF(S) and RPF(RP(G)), updates keepalive and SPT-bit state, picks the
//! outgoing list and hands one copy per interface to the caller. Packets
//! that arrive on a wrong interface which is itself in our olist trigger an
//! Assert instead.
//!
//! The [`ForwardingTable`] counts packets per (interface, group, source).
//! Last-hop routers use the counts for the SPT switchover threshold.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use serde::Serialize;

use super::tib::TreeKey;
use super::Router;
use crate::config::SptThreshold;
use crate::env::Environment;
use crate::error::PimError;
use crate::logging::Facility;
use crate::packet::DataPacket;
use crate::timer::EntryTimer;
use crate::{log_debug, log_info};
use crate::IfIndex;

/// Traffic seen for one (interface, group, source)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwardingRow {
    pub packets: u64,
    pub bytes: u64,
    /// The SPT threshold was crossed on this row
    pub spt_switch: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ForwardingTable {
    rows: BTreeMap<(IfIndex, Ipv4Addr, Ipv4Addr), ForwardingRow>,
}

impl ForwardingTable {
    /// Count one packet and return the updated row
    pub fn record(&mut self, interface: IfIndex, packet: &DataPacket) -> &mut ForwardingRow {
        let row = self
            .rows
            .entry((interface, packet.group, packet.source))
            .or_default();
        row.packets += 1;
        row.bytes += packet.payload.len() as u64;
        row
    }

    pub fn get(&self, interface: IfIndex, group: Ipv4Addr, source: Ipv4Addr) -> Option<&ForwardingRow> {
        self.rows.get(&(interface, group, source))
    }

    /// Drop every row of (S,G)
    pub fn forget(&mut self, source: Ipv4Addr, group: Ipv4Addr) {
        self.rows.retain(|&(_, g, s), _| g != group || s != source);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ((IfIndex, Ipv4Addr, Ipv4Addr), &ForwardingRow)> {
        self.rows.iter().map(|(k, v)| (*k, v))
    }
}

impl<E: Environment> Router<E> {
    /// Route one multicast data packet that arrived on `interface`.
    /// A packet whose source is one of our own addresses is locally
    /// originated and `interface` is where the application sent it.
    pub fn forward_data_packet(
        &mut self,
        now: Instant,
        packet: DataPacket,
        interface: IfIndex,
    ) -> Result<(), PimError> {
        self.check_interface(interface)?;
        self.stats.data_received += 1;
        let (source, group) = (packet.source, packet.group);

        if !group.is_multicast() {
            self.stats.ignored += 1;
            return Ok(());
        }
        if packet.ttl <= 1 {
            self.stats.discarded_ttl += 1;
            return Ok(());
        }

        let local_origin = self.is_local_address(source);
        let rpf_source = if local_origin {
            Some(interface)
        } else {
            self.source_rpf_interface(source, group)
        };
        let Some(rpf_source) = rpf_source else {
            self.stats.discarded_no_route += 1;
            log_debug!(
                self.logger,
                Facility::Forwarding,
                &format!("PIM: no route to source {} of {}", source, group)
            );
            return Ok(());
        };
        let on_source_path = interface == rpf_source;
        let directly_connected =
            local_origin || self.directly_connected_interface(source) == Some(interface);
        let sg = TreeKey::sg(source, group);

        let mut changed = false;
        if directly_connected && on_source_path {
            changed |= self.restart_keepalive(now, sg, true);
        } else if on_source_path
            && self.tib.lookup(&sg).is_some_and(|e| e.is_joined_upstream())
        {
            changed |= self.restart_keepalive(now, sg, false);
        }
        changed |= self.update_spt_bit(source, group, interface);

        let rp_interface = self.rp_rpf_interface(group);
        let on_shared_path = !self.spt_bit(source, group) && Some(interface) == rp_interface;
        self.forwarding.record(interface, &packet);
        if on_shared_path {
            changed |= self.check_switch_to_spt(now, source, group, interface);
        }

        if changed {
            self.evaluate_group(now, group)?;
        }

        let spt = self.spt_bit(source, group);
        let mut olist = if on_source_path && (spt || directly_connected) {
            self.inherited_olist_sg(source, group)
        } else if !spt && Some(interface) == rp_interface {
            self.inherited_olist_sg_rpt(source, group)
        } else {
            self.stats.rpf_failures += 1;
            let could_assert = if spt {
                self.could_assert_sg(source, group, interface)
            } else {
                self.could_assert_star_g(group, interface)
            };
            if could_assert {
                self.data_triggered_assert(now, source, group, interface)?;
            } else {
                log_debug!(
                    self.logger,
                    Facility::Forwarding,
                    &format!("PIM: RPF failure for ({},{}) on {}", source, group, interface)
                );
            }
            return Ok(());
        };

        let registered = directly_connected && on_source_path && self.register_data(&packet);

        // A relayed packet never goes back out its incoming interface
        if !local_origin {
            olist.remove(&interface);
        }
        if olist.is_empty() {
            if !registered {
                self.stats.discarded_empty_olist += 1;
            }
            return Ok(());
        }

        let mut copy = packet;
        copy.ttl -= 1;
        for out in olist {
            self.stats.data_forwarded += 1;
            self.emit_data(out, copy.clone());
        }
        Ok(())
    }

    /// Start or restart the (S,G) keepalive, creating the entry when
    /// `create` is set. True when the entry or its keepalive is new.
    fn restart_keepalive(&mut self, now: Instant, key: TreeKey, create: bool) -> bool {
        let fresh = match self.tib.lookup(&key) {
            Some(entry) => !entry.keepalive.is_running(),
            None if create => {
                self.ensure_entry(key);
                true
            }
            None => return false,
        };
        self.arm_entry_timer(now, key, EntryTimer::Keepalive, self.config.timers.keepalive_period);
        fresh
    }

    /// Set the SPT bit once (S,G) traffic arrives over the source tree
    fn update_spt_bit(&mut self, source: Ipv4Addr, group: Ipv4Addr, interface: IfIndex) -> bool {
        let sg = TreeKey::sg(source, group);
        let Some(entry) = self.tib.lookup(&sg) else {
            return false;
        };
        if entry.spt_bit
            || self.source_rpf_interface(source, group) != Some(interface)
            || !self.join_desired(sg)
        {
            return false;
        }
        let star_g = TreeKey::star_g(group);
        let sg_neighbor = self.rpf_prime(sg);
        let set = self.directly_connected_interface(source).is_some()
            || self.rp_rpf_interface(group) != Some(interface)
            || self.inherited_olist_sg_rpt(source, group).is_empty()
            || (sg_neighbor.is_some() && sg_neighbor == self.rpf_prime(star_g))
            || self.i_am_assert_loser(sg, interface);
        if set {
            if let Some(entry) = self.tib.lookup_mut(&sg) {
                entry.spt_bit = true;
            }
            log_info!(
                self.logger,
                Facility::Forwarding,
                &format!("PIM: SPT bit set for {}", sg)
            );
        }
        set
    }

    /// Last-hop SPT switchover: once the shared-tree count reaches the
    /// threshold, keep the (S,G) keepalive running so JoinDesired(S,G) holds
    fn check_switch_to_spt(&mut self, now: Instant, source: Ipv4Addr, group: Ipv4Addr, interface: IfIndex) -> bool {
        let SptThreshold::Packets(threshold) = self.config.spt_threshold else {
            return false;
        };
        if self.is_ssm(group) {
            return false;
        }
        let has_receivers = !self.pim_include_star_g(group).is_empty()
            || !self.pim_include_sg(source, group).is_empty();
        if !has_receivers {
            return false;
        }
        let Some(row) = self.forwarding.rows.get_mut(&(interface, group, source)) else {
            return false;
        };
        if row.packets < threshold {
            return false;
        }
        if !row.spt_switch {
            row.spt_switch = true;
            log_info!(
                self.logger,
                Facility::Forwarding,
                &format!("PIM: ({},{}) crossed SPT threshold of {} packets", source, group, threshold)
            );
        }
        self.restart_keepalive(now, TreeKey::sg(source, group), true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::StaticRpConfig;
    use crate::packet::PimMessage;
    use crate::router::{MembershipChange, RouterOutput};
    use crate::ALL_MULTICAST;

    const GROUP: &str = "239.1.1.1";

    fn packet(source: &str) -> DataPacket {
        DataPacket::new(addr(source), addr(GROUP), &b"payload"[..])
    }

    fn with_receiver(router: &mut Router<crate::env::StaticEnvironment>, now: Instant) {
        router.env_mut().join(addr(GROUP), None, IF1);
        router
            .local_membership_changed(now, addr(GROUP), None, IF1, MembershipChange::Join)
            .unwrap();
        router.take_output();
    }

    /// (interface, upstream neighbor) of every (S,G) Join in `output`
    fn sg_joins(output: &RouterOutput, source: Ipv4Addr) -> Vec<(Option<IfIndex>, Ipv4Addr)> {
        join_prunes(output)
            .into_iter()
            .filter(|(_, jp)| {
                jp.groups
                    .iter()
                    .flat_map(|g| g.joins.iter())
                    .any(|s| s.address == source && !s.rpt && !s.wildcard)
            })
            .map(|(iface, jp)| (iface, jp.upstream_neighbor))
            .collect()
    }

    #[test]
    fn test_forwarding_table_counts_and_forgets() {
        let mut table = ForwardingTable::default();
        let p = packet("192.168.5.5");
        table.record(IF2, &p);
        let row = table.record(IF2, &p);
        assert_eq!(row.packets, 2);
        assert_eq!(row.bytes, 14);
        table.record(IF3, &p);
        assert_eq!(table.len(), 2);

        table.forget(p.source, p.group);
        assert!(table.is_empty());
    }

    #[test]
    fn test_shared_tree_packet_forwarded_to_receiver() {
        let mut router = router();
        let now = Instant::now();
        with_receiver(&mut router, now);

        router
            .forward_data_packet(now, packet("192.168.5.5"), IF2)
            .unwrap();
        let output = router.take_output();
        assert_eq!(output.forwarded.len(), 1);
        assert_eq!(output.forwarded[0].interface, IF1);
        assert_eq!(output.forwarded[0].packet.ttl, 63);
        assert_eq!(router.stats().data_forwarded, 1);
        assert_eq!(
            router.forwarding_table().get(IF2, addr(GROUP), addr("192.168.5.5")).unwrap().packets,
            1
        );
    }

    #[test]
    fn test_discard_reasons_are_separate() {
        let mut router = router();
        let now = Instant::now();

        let mut expiring = packet("192.168.5.5");
        expiring.ttl = 1;
        router.forward_data_packet(now, expiring, IF3).unwrap();
        router.forward_data_packet(now, packet("172.31.0.9"), IF3).unwrap();
        router.forward_data_packet(now, packet("192.168.5.5"), IF1).unwrap();

        let stats = router.stats();
        assert_eq!(stats.data_received, 3);
        assert_eq!(stats.discarded_ttl, 1);
        assert_eq!(stats.discarded_no_route, 1);
        assert_eq!(stats.rpf_failures, 1);
        assert!(router.take_output().forwarded.is_empty());
    }

    #[test]
    fn test_dr_with_unreachable_rp_discards_without_register() {
        let mut config = config();
        config.static_rp = vec![StaticRpConfig {
            rp: addr("172.16.0.1"),
            group: ALL_MULTICAST,
            priority: 0,
        }];
        let mut router = router_with(config);
        let now = Instant::now();

        router.forward_data_packet(now, packet("10.0.1.50"), IF1).unwrap();

        let output = router.take_output();
        assert!(output
            .packets
            .iter()
            .all(|p| !matches!(p.message, PimMessage::Register(_))));
        assert_eq!(router.stats().data_discarded(), 1);
        assert_eq!(router.stats().discarded_empty_olist, 1);
        assert!(router
            .entry(&TreeKey::sg(addr("10.0.1.50"), addr(GROUP)))
            .unwrap()
            .keepalive
            .is_running());
    }

    #[test]
    fn test_dr_registers_local_source() {
        let mut router = router();
        let now = Instant::now();
        router.forward_data_packet(now, packet("10.0.1.50"), IF1).unwrap();

        let output = router.take_output();
        let register = output
            .packets
            .iter()
            .find(|p| matches!(p.message, PimMessage::Register(_)))
            .unwrap();
        assert_eq!(register.destination, addr("10.0.0.5"));
        assert_eq!(router.stats().data_registered, 1);
        assert_eq!(router.stats().discarded_empty_olist, 0);
    }

    #[test]
    fn test_spt_threshold_sends_single_join() {
        let mut config = config();
        config.spt_threshold = SptThreshold::Packets(3);
        let mut router = router_with(config);
        let now = Instant::now();
        with_receiver(&mut router, now);
        let source = addr("192.168.5.5");

        let mut joins = Vec::new();
        for _ in 0..6 {
            router.forward_data_packet(now, packet("192.168.5.5"), IF2).unwrap();
            joins.extend(sg_joins(&router.take_output(), source));
        }
        assert_eq!(joins, vec![(Some(IF3), addr("10.0.3.2"))]);
        assert!(router
            .forwarding_table()
            .get(IF2, addr(GROUP), source)
            .unwrap()
            .spt_switch);
    }

    #[test]
    fn test_source_tree_arrival_sets_spt_bit_and_prunes_rpt() {
        let mut config = config();
        config.spt_threshold = SptThreshold::Packets(1);
        let mut router = router_with(config);
        let now = Instant::now();
        with_receiver(&mut router, now);
        let source = addr("192.168.5.5");

        router.forward_data_packet(now, packet("192.168.5.5"), IF2).unwrap();
        router.take_output();
        router.forward_data_packet(now, packet("192.168.5.5"), IF3).unwrap();

        assert!(router.entry(&TreeKey::sg(source, addr(GROUP))).unwrap().spt_bit);
        let output = router.take_output();
        assert_eq!(output.forwarded.len(), 1);
        assert_eq!(output.forwarded[0].interface, IF1);
        let rpt_prune = join_prunes(&output)
            .into_iter()
            .find(|(_, jp)| jp.groups.iter().any(|g| g.prunes.iter().any(|s| s.rpt)))
            .unwrap();
        assert_eq!(rpt_prune.0, Some(IF2));

        // Shared-tree copies are now RPF failures
        router.forward_data_packet(now, packet("192.168.5.5"), IF2).unwrap();
        assert!(router.take_output().forwarded.is_empty());
        assert_eq!(router.stats().rpf_failures, 1);
    }
}
