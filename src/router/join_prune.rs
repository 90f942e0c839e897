// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Join/Prune message reception
//!
//! A message addressed to one of our interface addresses drives the
//! downstream machines of the arrival interface. A message addressed to some
//! other router is overheard: if it targets our own RPF' neighbor on our RPF
//! interface, it suppresses or overrides our pending upstream Joins.

use std::net::Ipv4Addr;
use std::time::Instant;

use super::tib::{TreeKey, TreeType};
use super::Router;
use crate::env::Environment;
use crate::error::PimError;
use crate::logging::Facility;
use crate::packet::{EncodedSource, JoinPrune, JoinPruneGroup};
use crate::IfIndex;
use crate::{log_debug, ALL_MULTICAST};

/// Tree a Join/Prune source entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinPruneTarget {
    StarStarRp(Ipv4Addr),
    StarG { rp: Ipv4Addr },
    SgRpt(Ipv4Addr),
    Sg(Ipv4Addr),
}

fn classify_source(block: &JoinPruneGroup, source: &EncodedSource) -> Option<JoinPruneTarget> {
    let all_groups = block.group.address == ALL_MULTICAST.prefix
        && block.group.mask_len == ALL_MULTICAST.mask_len;
    if source.wildcard && source.rpt {
        return Some(if all_groups {
            JoinPruneTarget::StarStarRp(source.address)
        } else {
            JoinPruneTarget::StarG {
                rp: source.address,
            }
        });
    }
    if all_groups || source.wildcard {
        return None;
    }
    Some(if source.rpt {
        JoinPruneTarget::SgRpt(source.address)
    } else {
        JoinPruneTarget::Sg(source.address)
    })
}

impl<E: Environment> Router<E> {
    pub(crate) fn receive_join_prune(
        &mut self,
        now: Instant,
        interface: IfIndex,
        sender: Ipv4Addr,
        message: &JoinPrune,
    ) -> Result<(), PimError> {
        let known = self
            .interfaces
            .get(&interface)
            .is_some_and(|i| i.neighbors.contains_key(&sender));
        if !known {
            self.stats.ignored += 1;
            log_debug!(
                self.logger,
                Facility::JoinPrune,
                &format!("PIM: ignoring Join/Prune from non-neighbor {} on {}", sender, interface)
            );
            return Ok(());
        }

        let addressed_to_me = self.interface_address(interface) == Some(message.upstream_neighbor);
        for block in &message.groups {
            let whole_range = block.group.mask_len != 32;
            if whole_range
                && !(block.group.address == ALL_MULTICAST.prefix
                    && block.group.mask_len == ALL_MULTICAST.mask_len)
            {
                log_debug!(
                    self.logger,
                    Facility::JoinPrune,
                    &format!(
                        "PIM: ignoring Join/Prune block for {}/{}",
                        block.group.address, block.group.mask_len
                    )
                );
                continue;
            }
            if addressed_to_me {
                self.downstream_block(now, interface, message.holdtime, block)?;
            } else {
                self.overheard_block(interface, message.upstream_neighbor, message.holdtime, block);
            }
            if whole_range {
                self.evaluate_all(now)?;
            } else {
                self.evaluate_group(now, block.group.address)?;
            }
        }
        Ok(())
    }

    /// (*,G) entries are accepted only when the RP in the message matches
    fn star_g_matches(&self, group: Ipv4Addr, rp: Ipv4Addr) -> bool {
        if self.is_ssm(group) {
            return false;
        }
        let matches = self.rp_for_group(group) == Some(rp);
        if !matches {
            log_debug!(
                self.logger,
                Facility::JoinPrune,
                &format!("PIM: (*,{}) names RP {} which is not ours", group, rp)
            );
        }
        matches
    }

    fn downstream_block(
        &mut self,
        now: Instant,
        interface: IfIndex,
        holdtime: u16,
        block: &JoinPruneGroup,
    ) -> Result<(), PimError> {
        let group = block.group.address;
        for source in &block.joins {
            match classify_source(block, source) {
                Some(JoinPruneTarget::StarStarRp(rp)) => {
                    self.receive_join(now, TreeKey::star_star_rp(rp), interface, holdtime)?;
                }
                Some(JoinPruneTarget::StarG { rp }) => {
                    if self.star_g_matches(group, rp) {
                        self.receive_join(now, TreeKey::star_g(group), interface, holdtime)?;
                        self.rpt_star_g_join(group, interface);
                    }
                }
                Some(JoinPruneTarget::SgRpt(s)) => {
                    self.receive_rpt_join(TreeKey::sg_rpt(s, group), interface);
                }
                Some(JoinPruneTarget::Sg(s)) => {
                    self.receive_join(now, TreeKey::sg(s, group), interface, holdtime)?;
                }
                None => self.stats.ignored += 1,
            }
        }
        for source in &block.prunes {
            match classify_source(block, source) {
                Some(JoinPruneTarget::StarStarRp(rp)) => {
                    self.receive_prune(now, TreeKey::star_star_rp(rp), interface);
                }
                Some(JoinPruneTarget::StarG { rp }) => {
                    if self.star_g_matches(group, rp) {
                        self.receive_prune(now, TreeKey::star_g(group), interface);
                    }
                }
                Some(JoinPruneTarget::SgRpt(s)) => {
                    self.receive_rpt_prune(now, TreeKey::sg_rpt(s, group), interface, holdtime);
                }
                Some(JoinPruneTarget::Sg(s)) => {
                    self.receive_prune(now, TreeKey::sg(s, group), interface);
                }
                None => self.stats.ignored += 1,
            }
        }
        if block.group.mask_len == 32 {
            self.rpt_end_of_message(group, interface);
        }
        Ok(())
    }

    /// Flag entries whose RPF' is `target` on `interface`
    fn mark_seen(&mut self, key: TreeKey, interface: IfIndex, target: Ipv4Addr, join: Option<u16>) {
        if let Some(entry) = self.tib.lookup_mut(&key) {
            if entry.rpf_interface() == Some(interface) && entry.upstream_neighbor == Some(target) {
                match join {
                    Some(holdtime) => {
                        entry.join_seen = Some(entry.join_seen.map_or(holdtime, |h| h.max(holdtime)));
                    }
                    None => entry.prune_seen = true,
                }
            }
        }
    }

    fn overheard_block(&mut self, interface: IfIndex, target: Ipv4Addr, holdtime: u16, block: &JoinPruneGroup) {
        let group = block.group.address;
        for source in &block.joins {
            match classify_source(block, source) {
                Some(JoinPruneTarget::StarStarRp(rp)) => {
                    self.mark_seen(TreeKey::star_star_rp(rp), interface, target, Some(holdtime));
                }
                Some(JoinPruneTarget::StarG { .. }) => {
                    self.mark_seen(TreeKey::star_g(group), interface, target, Some(holdtime));
                }
                Some(JoinPruneTarget::SgRpt(s)) => {
                    self.mark_seen(TreeKey::sg_rpt(s, group), interface, target, Some(holdtime));
                }
                Some(JoinPruneTarget::Sg(s)) => {
                    self.mark_seen(TreeKey::sg(s, group), interface, target, Some(holdtime));
                }
                None => {}
            }
        }
        for source in &block.prunes {
            match classify_source(block, source) {
                Some(JoinPruneTarget::StarStarRp(rp)) => {
                    self.mark_seen(TreeKey::star_star_rp(rp), interface, target, None);
                }
                Some(JoinPruneTarget::StarG { .. }) => {
                    self.mark_seen(TreeKey::star_g(group), interface, target, None);
                    for key in self.tib.sources(group, TreeType::Sg) {
                        self.mark_seen(key, interface, target, None);
                    }
                }
                Some(JoinPruneTarget::SgRpt(s)) | Some(JoinPruneTarget::Sg(s)) => {
                    self.mark_seen(TreeKey::sg(s, group), interface, target, None);
                    self.mark_seen(TreeKey::sg_rpt(s, group), interface, target, None);
                }
                None => {}
            }
        }
    }
}
