// SPDX-License-Identifier: Apache-2.0 OR MIT
//! RP-set and RP(G) selection (RFC 4601 section 4.7.1, RFC 5059 section 4.1)
//!
//! Selection among the mappings covering a group:
//!
//! 1. Longest group prefix wins, whatever the priorities.
//! 2. Lowest priority value wins among those.
//! 3. Remaining ties go to the highest hash value, then the highest RP
//!    address.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::Router;
use crate::env::Environment;
use crate::error::PimError;
use crate::logging::Facility;
use crate::timer::{Timer, TimerKind};
use crate::{log_debug, log_info};
use crate::{prefix_mask, GroupRange};

const HASH_MULTIPLIER: u32 = 1_103_515_245;
const HASH_INCREMENT: u32 = 12_345;

/// Where an RP mapping came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RpOrigin {
    /// Configured; never expires
    Static,
    /// Learned from the elected BSR
    Bootstrap,
    /// Candidate-RP advertisement held by this router as elected BSR
    Candidate,
}

/// One group-range to RP mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpListEntry {
    pub rp: Ipv4Addr,
    pub range: GroupRange,
    pub priority: u8,
    /// Seconds, as advertised
    pub holdtime: u16,
    pub origin: RpOrigin,
    pub expiry: Timer,
}

/// RPs of one group range, as carried in a Bootstrap message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupHashEntry {
    pub range: GroupRange,
    pub rps: Vec<RpListEntry>,
}

/// The group-range to RP mappings of one router
#[derive(Debug, Clone, Default)]
pub struct RpSet {
    entries: BTreeMap<(GroupRange, Ipv4Addr), RpListEntry>,
}

/// RFC 4601 hash of `group` masked to `mask_len` bits against `rp`
pub fn rp_hash(group: Ipv4Addr, mask_len: u8, rp: Ipv4Addr) -> u32 {
    let masked = u32::from(group) & prefix_mask(mask_len);
    let seed = HASH_MULTIPLIER
        .wrapping_mul(masked)
        .wrapping_add(HASH_INCREMENT);
    HASH_MULTIPLIER
        .wrapping_mul(seed ^ u32::from(rp))
        .wrapping_add(HASH_INCREMENT)
        & 0x7FFF_FFFF
}

impl RpSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_static(&mut self, rp: Ipv4Addr, range: GroupRange, priority: u8) {
        self.entries.insert(
            (range, rp),
            RpListEntry {
                rp,
                range,
                priority,
                holdtime: u16::MAX,
                origin: RpOrigin::Static,
                expiry: Timer::default(),
            },
        );
    }

    pub fn get(&self, range: GroupRange, rp: Ipv4Addr) -> Option<&RpListEntry> {
        self.entries.get(&(range, rp))
    }

    pub fn get_mut(&mut self, range: GroupRange, rp: Ipv4Addr) -> Option<&mut RpListEntry> {
        self.entries.get_mut(&(range, rp))
    }

    pub fn remove(&mut self, range: GroupRange, rp: Ipv4Addr) -> Option<RpListEntry> {
        self.entries.remove(&(range, rp))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RpListEntry> {
        self.entries.values()
    }

    /// Keys of every mapping of `origin`
    pub fn keys_of(&self, origin: RpOrigin) -> Vec<(GroupRange, Ipv4Addr)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.origin == origin)
            .map(|(k, _)| *k)
            .collect()
    }

    /// RP(G), or None when no mapping covers `group`
    pub fn select(&self, group: Ipv4Addr, hash_mask_len: u8) -> Option<Ipv4Addr> {
        let covering: Vec<&RpListEntry> = self
            .entries
            .values()
            .filter(|e| e.range.contains(group))
            .collect();
        let longest = covering.iter().map(|e| e.range.mask_len).max()?;
        let best_priority = covering
            .iter()
            .filter(|e| e.range.mask_len == longest)
            .map(|e| e.priority)
            .min()?;
        covering
            .into_iter()
            .filter(|e| e.range.mask_len == longest && e.priority == best_priority)
            .max_by_key(|e| (rp_hash(group, hash_mask_len, e.rp), e.rp))
            .map(|e| e.rp)
    }

    /// Mappings of `origin` grouped by range, for Bootstrap origination
    pub fn group_hash_entries(&self, origin: RpOrigin) -> Vec<GroupHashEntry> {
        let mut groups: Vec<GroupHashEntry> = Vec::new();
        for entry in self.entries.values().filter(|e| e.origin == origin) {
            match groups.last_mut() {
                Some(last) if last.range == entry.range => last.rps.push(entry.clone()),
                _ => groups.push(GroupHashEntry {
                    range: entry.range,
                    rps: vec![entry.clone()],
                }),
            }
        }
        groups
    }
}

impl<E: Environment> Router<E> {
    pub(crate) fn is_ssm(&self, group: Ipv4Addr) -> bool {
        self.config.ssm_range.contains(group)
    }

    /// RP(G); None for SSM groups and unmapped groups
    pub fn rp_for_group(&self, group: Ipv4Addr) -> Option<Ipv4Addr> {
        if self.is_ssm(group) {
            return None;
        }
        self.rp_set.select(group, self.bootstrap.hash_mask_len)
    }

    /// Add or refresh a dynamic mapping; holdtime 0 removes it. Returns true
    /// when the set of mappings or a priority changed.
    pub(crate) fn set_rp_mapping(
        &mut self,
        now: Instant,
        rp: Ipv4Addr,
        range: GroupRange,
        priority: u8,
        holdtime: u16,
        origin: RpOrigin,
    ) -> bool {
        if holdtime == 0 {
            return self.remove_rp_mapping(range, rp);
        }
        let changed = match self.rp_set.get_mut(range, rp) {
            Some(entry) if entry.origin == RpOrigin::Static => return false,
            Some(entry) => {
                let changed = entry.priority != priority;
                entry.priority = priority;
                entry.holdtime = holdtime;
                entry.origin = origin;
                changed
            }
            None => {
                self.rp_set.entries.insert(
                    (range, rp),
                    RpListEntry {
                        rp,
                        range,
                        priority,
                        holdtime,
                        origin,
                        expiry: Timer::default(),
                    },
                );
                log_info!(
                    self.logger,
                    Facility::RpMapping,
                    &format!("PIM: RP {} for {} (priority {}, {:?})", rp, range, priority, origin)
                );
                true
            }
        };
        if let Some(entry) = self.rp_set.get_mut(range, rp) {
            self.scheduler.arm(
                &mut entry.expiry,
                now,
                Duration::from_secs(u64::from(holdtime)),
                |epoch| TimerKind::RpMapping { rp, range, epoch },
            );
        }
        changed
    }

    pub(crate) fn remove_rp_mapping(&mut self, range: GroupRange, rp: Ipv4Addr) -> bool {
        match self.rp_set.get(range, rp) {
            Some(entry) if entry.origin != RpOrigin::Static => {
                self.rp_set.remove(range, rp);
                log_info!(
                    self.logger,
                    Facility::RpMapping,
                    &format!("PIM: removed RP {} for {}", rp, range)
                );
                true
            }
            _ => false,
        }
    }

    pub(crate) fn rp_mapping_expired(
        &mut self,
        now: Instant,
        rp: Ipv4Addr,
        range: GroupRange,
    ) -> Result<(), PimError> {
        log_debug!(
            self.logger,
            Facility::RpMapping,
            &format!("PIM: holdtime of RP {} for {} expired", rp, range)
        );
        if self.remove_rp_mapping(range, rp) {
            self.rp_set_changed(now)?;
        }
        Ok(())
    }
}
