// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Epoch-stamped timers
//!
//! The engine never cancels a timer. Arming a [`Timer`] stamps it with a fresh
//! epoch from one router-wide counter and emits a [`TimerRequest`] carrying
//! that epoch. When a request fires, the router hands it back through
//! `Router::timer_expired`; the handler runs only if the epoch still matches
//! the stored one. Re-arming or stopping therefore silently invalidates every
//! earlier request, and a timer of a deleted entry can never match a
//! re-created one.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::router::TreeKey;
use crate::{GroupRange, IfIndex};

/// Timers owned by a TIB entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryTimer {
    /// Upstream periodic Join timer
    Join,
    /// (S,G,rpt) upstream override timer
    Override,
    /// (S,G) keepalive timer
    Keepalive,
    /// DR-side Register-Stop timer
    RegisterStop,
}

/// Timers owned by one downstream interface of a TIB entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InterfaceTimer {
    Expiry,
    PrunePending,
    Assert,
}

/// What a fired timer refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    Hello {
        interface: IfIndex,
        epoch: u64,
    },
    NeighborLiveness {
        interface: IfIndex,
        neighbor: Ipv4Addr,
        epoch: u64,
    },
    Entry {
        key: TreeKey,
        slot: EntryTimer,
        epoch: u64,
    },
    Downstream {
        key: TreeKey,
        interface: IfIndex,
        slot: InterfaceTimer,
        epoch: u64,
    },
    /// Candidate-BSR or non-candidate bootstrap timer of one interface
    Bootstrap {
        interface: IfIndex,
        epoch: u64,
    },
    /// Candidate-RP advertisement timer of one interface
    CandidateRp {
        interface: IfIndex,
        epoch: u64,
    },
    /// Holdtime of one RP-set mapping
    RpMapping {
        rp: Ipv4Addr,
        range: GroupRange,
        epoch: u64,
    },
}

impl TimerKind {
    pub fn epoch(&self) -> u64 {
        match self {
            TimerKind::Hello { epoch, .. }
            | TimerKind::NeighborLiveness { epoch, .. }
            | TimerKind::Entry { epoch, .. }
            | TimerKind::Downstream { epoch, .. }
            | TimerKind::Bootstrap { epoch, .. }
            | TimerKind::CandidateRp { epoch, .. }
            | TimerKind::RpMapping { epoch, .. } => *epoch,
        }
    }
}

/// Request to fire `kind` after `delay`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest {
    pub kind: TimerKind,
    pub delay: Duration,
}

/// Stored side of a timer: the epoch of the last arming and its deadline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timer {
    epoch: u64,
    deadline: Option<Instant>,
}

impl Timer {
    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// True if a firing stamped with `epoch` belongs to the current arming
    pub fn is_current(&self, epoch: u64) -> bool {
        self.deadline.is_some() && self.epoch == epoch
    }

    /// Time left before expiry, zero once overdue
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Stop the timer; pending requests become stale
    pub fn stop(&mut self) {
        self.deadline = None;
    }
}

/// Hands out epochs and collects the timer requests of one router
#[derive(Debug, Default)]
pub struct Scheduler {
    last_epoch: u64,
    pending: Vec<TimerRequest>,
}

impl Scheduler {
    /// Arm `timer` to fire after `delay`. `kind` builds the request from the
    /// new epoch.
    pub fn arm(
        &mut self,
        timer: &mut Timer,
        now: Instant,
        delay: Duration,
        kind: impl FnOnce(u64) -> TimerKind,
    ) {
        self.last_epoch += 1;
        timer.epoch = self.last_epoch;
        timer.deadline = Some(now + delay);
        self.pending.push(TimerRequest {
            kind: kind(self.last_epoch),
            delay,
        });
    }

    /// Drain the requests issued since the last call
    pub fn take(&mut self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.pending)
    }
}
