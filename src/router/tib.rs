// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Tree Information Base
//!
//! One [`TreeEntry`] per (group, source, tree type). Entries are created on
//! the first event that references them and collected once they hold no
//! state. Key shapes:
//!
//! | Tree | group | source |
//! |------|-------|--------|
//! | (*,*,RP) | 0.0.0.0 | RP |
//! | (*,G) | G | 0.0.0.0 (RP kept in [`TreeEntry::rp`]) |
//! | (S,G) | G | S |
//! | (S,G,rpt) | G | S |

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use super::assert::{AssertMetric, AssertState};
use super::olist::OifList;
use super::Router;
use crate::env::{Environment, RpfRoute};
use crate::log_debug;
use crate::logging::Facility;
use crate::timer::{EntryTimer, InterfaceTimer, Timer};
use crate::IfIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TreeType {
    /// (*,*,RP)
    Rp,
    /// (*,G)
    G,
    /// (S,G)
    Sg,
    /// (S,G,rpt)
    SgRpt,
}

/// TIB key, ordered group first so one group's entries are contiguous
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeKey {
    pub group: Ipv4Addr,
    pub source: Ipv4Addr,
    pub tree: TreeType,
}

impl TreeKey {
    pub fn star_star_rp(rp: Ipv4Addr) -> Self {
        Self {
            group: Ipv4Addr::UNSPECIFIED,
            source: rp,
            tree: TreeType::Rp,
        }
    }

    pub fn star_g(group: Ipv4Addr) -> Self {
        Self {
            group,
            source: Ipv4Addr::UNSPECIFIED,
            tree: TreeType::G,
        }
    }

    pub fn sg(source: Ipv4Addr, group: Ipv4Addr) -> Self {
        Self {
            group,
            source,
            tree: TreeType::Sg,
        }
    }

    pub fn sg_rpt(source: Ipv4Addr, group: Ipv4Addr) -> Self {
        Self {
            group,
            source,
            tree: TreeType::SgRpt,
        }
    }

    /// Same (S,G) pair on the other tree
    pub fn with_tree(self, tree: TreeType) -> Self {
        Self { tree, ..self }
    }
}

impl fmt::Display for TreeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tree {
            TreeType::Rp => write!(f, "(*,*,{})", self.source),
            TreeType::G => write!(f, "(*,{})", self.group),
            TreeType::Sg => write!(f, "({},{})", self.source, self.group),
            TreeType::SgRpt => write!(f, "({},{},rpt)", self.source, self.group),
        }
    }
}

/// Upstream Join/Prune state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    /// (*,*,RP), (*,G), (S,G)
    NotJoined,
    Joined,
    /// (S,G,rpt)
    RptNotJoined,
    RptPruned,
    RptNotPruned,
}

/// Downstream Join/Prune state of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamState {
    NoInfo,
    Join,
    PrunePending,
    /// (S,G,rpt) only
    Pruned,
    PruneTmp,
    PrunePendingTmp,
}

/// DR-side register state, (S,G) entries only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterState {
    NoInfo,
    Join,
    JoinPending,
    Prune,
}

/// Per-(entry, interface) state
#[derive(Debug, Clone)]
pub struct InterfaceState {
    pub join_prune: DownstreamState,
    pub expiry: Timer,
    pub prune_pending: Timer,
    pub assert: AssertState,
    pub assert_winner: Option<AssertMetric>,
    pub assert_timer: Timer,
    /// Downstream Join mirrored from local membership while DR
    pub local_join: bool,
}

impl Default for InterfaceState {
    fn default() -> Self {
        Self {
            join_prune: DownstreamState::NoInfo,
            expiry: Timer::default(),
            prune_pending: Timer::default(),
            assert: AssertState::NoInfo,
            assert_winner: None,
            assert_timer: Timer::default(),
            local_join: false,
        }
    }
}

impl InterfaceState {
    /// Counts in joins(*,*,RP), joins(*,G) or joins(S,G)
    pub fn is_joined(&self) -> bool {
        matches!(
            self.join_prune,
            DownstreamState::Join | DownstreamState::PrunePending
        )
    }

    /// Counts in prunes(S,G,rpt)
    pub fn is_rpt_pruned(&self) -> bool {
        matches!(
            self.join_prune,
            DownstreamState::Pruned | DownstreamState::PruneTmp
        )
    }

    pub fn is_idle(&self) -> bool {
        self.join_prune == DownstreamState::NoInfo
            && self.assert == AssertState::NoInfo
            && !self.local_join
    }

    pub fn timer(&mut self, slot: InterfaceTimer) -> &mut Timer {
        match slot {
            InterfaceTimer::Expiry => &mut self.expiry,
            InterfaceTimer::PrunePending => &mut self.prune_pending,
            InterfaceTimer::Assert => &mut self.assert_timer,
        }
    }
}

/// One TIB entry
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub key: TreeKey,
    /// RP(G) when the entry was created or last re-mapped
    pub rp: Option<Ipv4Addr>,
    /// RPF snapshot toward the RP ((*,*,RP), (*,G), (S,G,rpt)) or the source
    /// ((S,G))
    pub rpf: Option<RpfRoute>,
    /// RPF' neighbor, including assert overrides
    pub upstream_neighbor: Option<Ipv4Addr>,
    pub spt_bit: bool,
    pub upstream: UpstreamState,
    /// Join seen on the upstream LAN, with its holdtime; consumed on the next
    /// evaluation
    pub join_seen: Option<u16>,
    /// Prune seen on the upstream LAN; consumed on the next evaluation
    pub prune_seen: bool,
    pub join_timer: Timer,
    pub override_timer: Timer,
    pub keepalive: Timer,
    pub register: RegisterState,
    pub register_stop_timer: Timer,
    pub interfaces: BTreeMap<IfIndex, InterfaceState>,
    pub immediate_olist: OifList,
    pub inherited_olist: OifList,
}

impl TreeEntry {
    pub fn new(key: TreeKey, rp: Option<Ipv4Addr>, rpf: Option<RpfRoute>) -> Self {
        let upstream = match key.tree {
            TreeType::SgRpt => UpstreamState::RptNotJoined,
            _ => UpstreamState::NotJoined,
        };
        Self {
            key,
            rp,
            rpf,
            upstream_neighbor: rpf.and_then(|r| r.neighbor()),
            spt_bit: false,
            upstream,
            join_seen: None,
            prune_seen: false,
            join_timer: Timer::default(),
            override_timer: Timer::default(),
            keepalive: Timer::default(),
            register: RegisterState::NoInfo,
            register_stop_timer: Timer::default(),
            interfaces: BTreeMap::new(),
            immediate_olist: OifList::new(),
            inherited_olist: OifList::new(),
        }
    }

    pub fn rpf_interface(&self) -> Option<IfIndex> {
        self.rpf.map(|r| r.interface)
    }

    /// Interface state, if any was ever recorded
    pub fn interface(&self, index: IfIndex) -> Option<&InterfaceState> {
        self.interfaces.get(&index)
    }

    /// Interface state, created in NoInfo on first use
    pub fn interface_mut(&mut self, index: IfIndex) -> &mut InterfaceState {
        self.interfaces.entry(index).or_default()
    }

    pub fn downstream_state(&self, index: IfIndex) -> DownstreamState {
        self.interfaces
            .get(&index)
            .map_or(DownstreamState::NoInfo, |i| i.join_prune)
    }

    pub fn assert_state(&self, index: IfIndex) -> AssertState {
        self.interfaces
            .get(&index)
            .map_or(AssertState::NoInfo, |i| i.assert)
    }

    pub fn timer(&mut self, slot: EntryTimer) -> &mut Timer {
        match slot {
            EntryTimer::Join => &mut self.join_timer,
            EntryTimer::Override => &mut self.override_timer,
            EntryTimer::Keepalive => &mut self.keepalive,
            EntryTimer::RegisterStop => &mut self.register_stop_timer,
        }
    }

    pub fn is_joined_upstream(&self) -> bool {
        self.upstream == UpstreamState::Joined
    }

    /// No state worth keeping
    pub fn is_idle(&self) -> bool {
        let upstream_idle = match self.upstream {
            UpstreamState::NotJoined | UpstreamState::RptNotJoined => true,
            UpstreamState::RptNotPruned => !self.override_timer.is_running(),
            UpstreamState::Joined | UpstreamState::RptPruned => false,
        };
        upstream_idle
            && !self.keepalive.is_running()
            && self.register == RegisterState::NoInfo
            && self.interfaces.values().all(InterfaceState::is_idle)
    }
}

/// Tree Information Base
#[derive(Debug, Default)]
pub struct Tib {
    entries: BTreeMap<TreeKey, TreeEntry>,
}

impl Tib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &TreeKey) -> Option<&TreeEntry> {
        self.entries.get(key)
    }

    pub fn lookup_mut(&mut self, key: &TreeKey) -> Option<&mut TreeEntry> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &TreeKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Entry for `key`, inserted blank when absent
    pub fn entry_mut(&mut self, key: TreeKey) -> &mut TreeEntry {
        self.entries
            .entry(key)
            .or_insert_with(|| TreeEntry::new(key, None, None))
    }

    /// Insert `entry` unless its key is present; returns the stored entry
    pub fn insert(&mut self, entry: TreeEntry) -> &mut TreeEntry {
        match self.entries.entry(entry.key) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => vacant.insert(entry),
        }
    }

    pub fn remove(&mut self, key: &TreeKey) -> Option<TreeEntry> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.values()
    }

    pub fn keys(&self) -> Vec<TreeKey> {
        self.entries.keys().copied().collect()
    }

    /// Keys of every (*,G), (S,G) and (S,G,rpt) entry of `group`
    pub fn group_keys(&self, group: Ipv4Addr) -> Vec<TreeKey> {
        let start = TreeKey {
            group,
            source: Ipv4Addr::UNSPECIFIED,
            tree: TreeType::Rp,
        };
        let end = TreeKey {
            group,
            source: Ipv4Addr::BROADCAST,
            tree: TreeType::SgRpt,
        };
        self.entries.range(start..=end).map(|(k, _)| *k).collect()
    }

    /// Distinct groups with state, excluding (*,*,RP)
    pub fn groups(&self) -> Vec<Ipv4Addr> {
        let mut groups: Vec<Ipv4Addr> = self
            .entries
            .keys()
            .filter(|k| k.tree != TreeType::Rp)
            .map(|k| k.group)
            .collect();
        groups.dedup();
        groups
    }

    /// (S,G) or (S,G,rpt) entries of `group`
    pub fn sources(&self, group: Ipv4Addr, tree: TreeType) -> Vec<TreeKey> {
        self.group_keys(group)
            .into_iter()
            .filter(|k| k.tree == tree)
            .collect()
    }
}

impl<E: Environment> Router<E> {
    /// Look up `key`, creating the entry with a fresh RPF snapshot when absent
    pub(crate) fn ensure_entry(&mut self, key: TreeKey) -> &mut TreeEntry {
        if !self.tib.contains(&key) {
            let rp = match key.tree {
                TreeType::Rp => Some(key.source),
                _ => self.rp_for_group(key.group),
            };
            let rpf = self.resolve_entry_rpf(key, rp);
            let mut entry = TreeEntry::new(key, rp, rpf);
            if key.tree == TreeType::SgRpt {
                let star_g_joined = self
                    .tib
                    .lookup(&TreeKey::star_g(key.group))
                    .is_some_and(TreeEntry::is_joined_upstream);
                if star_g_joined {
                    entry.upstream = UpstreamState::RptNotPruned;
                }
            }
            log_debug!(
                self.logger,
                Facility::Tib,
                &format!("PIM: created {} rp={:?} rpf={:?}", key, rp, rpf)
            );
            self.tib.insert(entry);
        }
        self.tib.entry_mut(key)
    }

    /// RPF toward the root of `key`'s tree; None when unreachable or when
    /// this router is the root
    pub(crate) fn resolve_entry_rpf(&self, key: TreeKey, rp: Option<Ipv4Addr>) -> Option<RpfRoute> {
        let target = match key.tree {
            TreeType::Sg => Some(key.source),
            _ => rp,
        }?;
        if self.is_local_address(target) {
            return None;
        }
        self.env.resolve(target)
    }

    /// Remove idle entries of `group` (and idle (*,*,RP) entries)
    pub(crate) fn collect_garbage(&mut self, group: Option<Ipv4Addr>) {
        let keys = match group {
            Some(group) => self.tib.group_keys(group),
            None => self.tib.keys(),
        };
        for key in keys {
            if self.tib.lookup(&key).is_some_and(TreeEntry::is_idle) {
                self.tib.remove(&key);
                log_debug!(
                    self.logger,
                    Facility::Tib,
                    &format!("PIM: removed idle {}", key)
                );
            }
        }
    }
}
