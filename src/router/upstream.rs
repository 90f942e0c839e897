// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Upstream Join/Prune state machines, RFC 4601 section 4.5.5 to 4.5.9
//!
//! (*,*,RP), (*,G) and (S,G) share one two-state machine (NotJoined/Joined)
//! driven by JoinDesired. (S,G,rpt) runs the three-state machine driven by
//! RPTJoinDesired(G) and PruneDesired(S,G,rpt). Joins and Prunes seen on the
//! upstream LAN arrive as flags on the entry and are consumed here.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::tib::{TreeKey, TreeType, UpstreamState};
use super::Router;
use crate::env::{Environment, RpfRoute};
use crate::error::PimError;
use crate::logging::Facility;
use crate::packet::{EncodedGroup, EncodedSource, JoinPrune, PimMessage, HOLDTIME_INFINITE};
use crate::timer::EntryTimer;
use crate::{log_debug, log_info};
use crate::{IfIndex, ALL_MULTICAST};

/// Why RPF' moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpfChange {
    /// Assert winner on the RPF interface changed
    Assert,
    /// Unicast route or RP changed
    Route,
}

impl<E: Environment> Router<E> {
    /// Holdtime carried in outgoing Join/Prune messages
    pub(crate) fn join_prune_holdtime(&self) -> u16 {
        let secs = self.config.timers.join_prune_holdtime.as_secs();
        secs.min(u64::from(HOLDTIME_INFINITE - 1)) as u16
    }

    /// Group and source encodings of `key` inside a Join/Prune message
    pub(crate) fn join_prune_encoding(&self, key: TreeKey, rp: Option<Ipv4Addr>) -> Option<(EncodedGroup, EncodedSource)> {
        let group = EncodedGroup::host(key.group);
        match key.tree {
            TreeType::Rp => Some((
                EncodedGroup::new(ALL_MULTICAST.prefix, ALL_MULTICAST.mask_len),
                EncodedSource::wildcard_rp(key.source),
            )),
            TreeType::G => rp.map(|rp| (group, EncodedSource::wildcard_rp(rp))),
            TreeType::Sg => Some((group, EncodedSource::source(key.source))),
            TreeType::SgRpt => Some((group, EncodedSource::source_rpt(key.source))),
        }
    }

    /// RPF interface and RPF' neighbor of `key`
    pub(crate) fn upstream_target(&self, key: TreeKey) -> Option<(IfIndex, Ipv4Addr)> {
        let entry = self.tib.lookup(&key)?;
        Some((entry.rpf_interface()?, entry.upstream_neighbor?))
    }

    /// (S,G,rpt) prunes that ride along a Join(*,G) to `neighbor`
    fn rpt_prunes_for(&self, group: Ipv4Addr, neighbor: Ipv4Addr) -> Vec<Ipv4Addr> {
        self.tib
            .sources(group, TreeType::SgRpt)
            .into_iter()
            .filter(|key| {
                self.tib.lookup(key).is_some_and(|e| {
                    e.upstream_neighbor == Some(neighbor)
                        && (e.upstream == UpstreamState::RptPruned
                            || (e.upstream == UpstreamState::RptNotJoined
                                && self.prune_desired_sg_rpt(key.source, key.group)))
                })
            })
            .map(|key| key.source)
            .collect()
    }

    /// Send a Join or Prune for `key` to `target`. No target means this
    /// router is the root of the tree or the root is unreachable.
    pub(crate) fn send_join_prune(
        &mut self,
        key: TreeKey,
        join: bool,
        target: Option<(IfIndex, Ipv4Addr)>,
    ) -> Result<(), PimError> {
        let Some((interface, neighbor)) = target else {
            return Ok(());
        };
        let rp = match key.tree {
            TreeType::G => self.tib.lookup(&key).and_then(|e| e.rp),
            _ => None,
        };
        let Some((group, source)) = self.join_prune_encoding(key, rp) else {
            return self.invariant(format!("{} has no RP to encode", key));
        };

        let mut message = JoinPrune::new(neighbor, self.join_prune_holdtime());
        if join {
            message.add_join(group, source);
            if key.tree == TreeType::G {
                for pruned in self.rpt_prunes_for(key.group, neighbor) {
                    message.add_prune(group, EncodedSource::source_rpt(pruned));
                }
            }
        } else {
            message.add_prune(group, source);
        }

        log_debug!(
            self.logger,
            Facility::JoinPrune,
            &format!(
                "PIM: sending {} {} to {} on {}",
                if join { "Join" } else { "Prune" },
                key,
                neighbor,
                interface
            )
        );
        self.send_multicast(interface, PimMessage::JoinPrune(message));
        Ok(())
    }

    /// Re-arm `slot` to `delay` unless it would fire sooner already
    pub(crate) fn reduce_timer(&mut self, now: Instant, key: TreeKey, slot: EntryTimer, delay: Duration) {
        let remaining = match self.tib.lookup_mut(&key) {
            Some(entry) => entry.timer(slot).remaining(now),
            None => return,
        };
        if remaining.map_or(true, |r| r > delay) {
            self.arm_entry_timer(now, key, slot, delay);
        }
    }

    /// Two-state upstream machine of (*,*,RP), (*,G) and (S,G)
    pub(crate) fn update_upstream(&mut self, now: Instant, key: TreeKey, desired: bool) -> Result<(), PimError> {
        let Some(entry) = self.tib.lookup_mut(&key) else {
            return Ok(());
        };
        let state = entry.upstream;
        let join_seen = entry.join_seen.take();
        let prune_seen = std::mem::take(&mut entry.prune_seen);

        match (state, desired) {
            (UpstreamState::NotJoined, true) => {
                entry.upstream = UpstreamState::Joined;
                let target = self.upstream_target(key);
                self.send_join_prune(key, true, target)?;
                self.arm_entry_timer(now, key, EntryTimer::Join, self.config.timers.join_prune_period);
                log_info!(
                    self.logger,
                    Facility::JoinPrune,
                    &format!("PIM: {} joined upstream via {:?}", key, target)
                );
            }
            (UpstreamState::Joined, false) => {
                entry.upstream = UpstreamState::NotJoined;
                if key.tree == TreeType::Sg {
                    entry.spt_bit = false;
                }
                entry.join_timer.stop();
                let target = self.upstream_target(key);
                self.send_join_prune(key, false, target)?;
                log_info!(
                    self.logger,
                    Facility::JoinPrune,
                    &format!("PIM: {} pruned upstream via {:?}", key, target)
                );
            }
            (UpstreamState::Joined, true) => {
                if let Some(holdtime) = join_seen {
                    let suppress = self
                        .config
                        .timers
                        .join_suppression
                        .min(Duration::from_secs(u64::from(holdtime)));
                    let remaining = self
                        .tib
                        .lookup_mut(&key)
                        .and_then(|e| e.join_timer.remaining(now));
                    if remaining.is_some_and(|r| r < suppress) {
                        self.arm_entry_timer(now, key, EntryTimer::Join, suppress);
                    }
                }
                if prune_seen {
                    let delay = self.override_delay();
                    self.reduce_timer(now, key, EntryTimer::Join, delay);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// (S,G,rpt) upstream machine
    pub(crate) fn update_rpt_upstream(&mut self, now: Instant, key: TreeKey) -> Result<(), PimError> {
        let rpt_join = self.rpt_join_desired(key.group);
        let prune_desired = self.prune_desired_sg_rpt(key.source, key.group);
        let Some(entry) = self.tib.lookup_mut(&key) else {
            return Ok(());
        };
        let join_seen = entry.join_seen.take().is_some();
        let prune_seen = std::mem::take(&mut entry.prune_seen);

        match entry.upstream {
            UpstreamState::RptNotJoined => {
                if rpt_join {
                    entry.upstream = if prune_desired {
                        UpstreamState::RptPruned
                    } else {
                        UpstreamState::RptNotPruned
                    };
                }
            }
            UpstreamState::RptPruned => {
                if !rpt_join {
                    entry.upstream = UpstreamState::RptNotJoined;
                } else if !prune_desired {
                    entry.upstream = UpstreamState::RptNotPruned;
                    let target = self.upstream_target(key);
                    self.send_join_prune(key, true, target)?;
                }
            }
            UpstreamState::RptNotPruned => {
                if !rpt_join {
                    entry.upstream = UpstreamState::RptNotJoined;
                    entry.override_timer.stop();
                } else if prune_desired {
                    entry.upstream = UpstreamState::RptPruned;
                    entry.override_timer.stop();
                    let target = self.upstream_target(key);
                    self.send_join_prune(key, false, target)?;
                } else {
                    if prune_seen {
                        let delay = self.override_delay();
                        self.reduce_timer(now, key, EntryTimer::Override, delay);
                    }
                    if join_seen {
                        self.stop_entry_timer(key, EntryTimer::Override);
                    }
                }
            }
            UpstreamState::NotJoined | UpstreamState::Joined => {
                return self.invariant(format!("{} in non-rpt upstream state", key));
            }
        }
        Ok(())
    }

    /// Periodic Join; (S,G,rpt) prunes ride along with Join(*,G)
    pub(crate) fn join_timer_expired(&mut self, now: Instant, key: TreeKey) -> Result<(), PimError> {
        if !self.tib.lookup(&key).is_some_and(|e| e.is_joined_upstream()) {
            return Ok(());
        }
        let target = self.upstream_target(key);
        self.send_join_prune(key, true, target)?;
        self.arm_entry_timer(now, key, EntryTimer::Join, self.config.timers.join_prune_period);
        Ok(())
    }

    pub(crate) fn override_timer_expired(&mut self, _now: Instant, key: TreeKey) -> Result<(), PimError> {
        let not_pruned = self
            .tib
            .lookup(&key)
            .is_some_and(|e| e.upstream == UpstreamState::RptNotPruned);
        if not_pruned {
            let target = self.upstream_target(key);
            self.send_join_prune(key, true, target)?;
        }
        Ok(())
    }

    /// Recompute RPF' of `key` and react to a change
    pub(crate) fn refresh_rpf_prime(&mut self, now: Instant, key: TreeKey, cause: RpfChange) -> Result<(), PimError> {
        let new = self.rpf_prime(key);
        let Some(entry) = self.tib.lookup_mut(&key) else {
            return Ok(());
        };
        let old = entry.upstream_neighbor;
        if new == old {
            return Ok(());
        }
        entry.upstream_neighbor = new;
        let state = entry.upstream;
        let interface = entry.rpf_interface();
        log_debug!(
            self.logger,
            Facility::JoinPrune,
            &format!("PIM: RPF' of {} {:?} -> {:?} ({:?})", key, old, new, cause)
        );

        match (state, cause) {
            (UpstreamState::Joined, RpfChange::Assert) => {
                let delay = self.override_delay();
                self.reduce_timer(now, key, EntryTimer::Join, delay);
            }
            (UpstreamState::Joined, RpfChange::Route) => {
                let new_target = interface.zip(new);
                let old_target = interface.zip(old);
                self.send_join_prune(key, true, new_target)?;
                self.send_join_prune(key, false, old_target)?;
                self.arm_entry_timer(now, key, EntryTimer::Join, self.config.timers.join_prune_period);
            }
            (UpstreamState::RptNotPruned, RpfChange::Assert) => {
                let delay = self.override_delay();
                self.reduce_timer(now, key, EntryTimer::Override, delay);
            }
            _ => {}
        }
        Ok(())
    }

    /// New RPF snapshot for `key`. A Joined entry moves its Join to the new
    /// RPF' neighbor and prunes the old one.
    pub(crate) fn rpf_route_changed(
        &mut self,
        now: Instant,
        key: TreeKey,
        rpf: Option<RpfRoute>,
    ) -> Result<(), PimError> {
        let Some(entry) = self.tib.lookup_mut(&key) else {
            return Ok(());
        };
        let old_target = entry.rpf_interface().zip(entry.upstream_neighbor);
        let interface_changed = entry.rpf_interface() != rpf.map(|r| r.interface);
        entry.rpf = rpf;
        if key.tree == TreeType::Sg && interface_changed {
            entry.spt_bit = false;
        }
        let neighbor = self.rpf_prime(key);
        let Some(entry) = self.tib.lookup_mut(&key) else {
            return Ok(());
        };
        entry.upstream_neighbor = neighbor;
        let joined = entry.is_joined_upstream();
        let new_target = entry.rpf_interface().zip(neighbor);

        if joined && new_target != old_target {
            self.send_join_prune(key, true, new_target)?;
            self.send_join_prune(key, false, old_target)?;
            self.arm_entry_timer(now, key, EntryTimer::Join, self.config.timers.join_prune_period);
        }

        // (S,G,rpt) RPF' follows (*,G)
        if key.tree == TreeType::G {
            for rpt in self.tib.sources(key.group, TreeType::SgRpt) {
                let rpt_rpf = self.tib.lookup(&key).and_then(|e| e.rpf);
                if let Some(entry) = self.tib.lookup_mut(&rpt) {
                    entry.rpf = rpt_rpf;
                }
                let neighbor = self.rpf_prime(rpt);
                if let Some(entry) = self.tib.lookup_mut(&rpt) {
                    entry.upstream_neighbor = neighbor;
                }
            }
        }
        Ok(())
    }

    /// The upstream neighbor restarted (GenID change): refresh Joins soon
    pub(crate) fn upstream_neighbor_restarted(&mut self, now: Instant, interface: IfIndex, neighbor: Ipv4Addr) {
        let keys: Vec<(TreeKey, UpstreamState)> = self
            .tib
            .iter()
            .filter(|e| e.rpf_interface() == Some(interface) && e.upstream_neighbor == Some(neighbor))
            .map(|e| (e.key, e.upstream))
            .collect();
        for (key, state) in keys {
            let delay = self.override_delay();
            match state {
                UpstreamState::Joined => self.reduce_timer(now, key, EntryTimer::Join, delay),
                UpstreamState::RptNotPruned => self.reduce_timer(now, key, EntryTimer::Override, delay),
                _ => {}
            }
        }
    }
}
