// SPDX-License-Identifier: Apache-2.0 OR MIT
//! PIM interfaces, Hello exchange and DR election (RFC 4601 section 4.3)

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::bootstrap::BsrMachine;
use super::Router;
use crate::config::InterfaceConfig;
use crate::env::Environment;
use crate::error::PimError;
use crate::logging::Facility;
use crate::packet::{Hello, PimMessage, HOLDTIME_INFINITE};
use crate::timer::{Timer, TimerKind};
use crate::{prefix_contains, IfIndex};
use crate::{log_debug, log_info};

/// A PIM neighbor learned from its Hellos
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub address: Ipv4Addr,
    /// None when the neighbor omits the DR Priority option
    pub dr_priority: Option<u32>,
    pub generation_id: Option<u32>,
    pub holdtime: u16,
    pub liveness: Timer,
}

/// One PIM-enabled interface
#[derive(Debug, Clone)]
pub struct PimInterface {
    pub index: IfIndex,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub dr_priority: u32,
    pub generation_id: u32,
    pub neighbors: BTreeMap<Ipv4Addr, Neighbor>,
    pub designated_router: Ipv4Addr,
    pub hello_timer: Timer,
    /// Bootstrap machine running on this interface
    pub bsr: BsrMachine,
    pub bsr_timer: Timer,
    /// Candidate-RP priority when this interface address is a C-RP
    pub candidate_rp_priority: Option<u8>,
    pub crp_timer: Timer,
    /// Fast C-RP advertisements left before settling on the regular period
    pub crp_backoff_rounds: u8,
}

impl PimInterface {
    pub fn new(config: &InterfaceConfig, generation_id: u32) -> Self {
        Self {
            index: config.index,
            address: config.address,
            prefix_len: config.prefix_len,
            dr_priority: config.dr_priority,
            generation_id,
            neighbors: BTreeMap::new(),
            designated_router: config.address,
            hello_timer: Timer::default(),
            bsr: BsrMachine::new(config.candidate_bsr_priority),
            bsr_timer: Timer::default(),
            candidate_rp_priority: config.candidate_rp_priority,
            crp_timer: Timer::default(),
            crp_backoff_rounds: 0,
        }
    }

    pub fn is_dr(&self) -> bool {
        self.designated_router == self.address
    }

    pub fn is_directly_connected(&self, address: Ipv4Addr) -> bool {
        prefix_contains(self.address, self.prefix_len, address)
    }

    pub fn neighbor(&self, address: Ipv4Addr) -> Option<&Neighbor> {
        self.neighbors.get(&address)
    }

    /// Re-run DR election; returns true when the DR changed.
    ///
    /// Highest DR priority wins with ties broken by the highest address. If
    /// any neighbor omits the DR Priority option, priorities are ignored and
    /// the highest address wins.
    pub fn elect_dr(&mut self) -> bool {
        let use_priority = self.neighbors.values().all(|n| n.dr_priority.is_some());
        let rank = |priority: Option<u32>, address: Ipv4Addr| {
            let priority = if use_priority { priority.unwrap_or(0) } else { 0 };
            (priority, address)
        };
        let winner = self
            .neighbors
            .values()
            .map(|n| rank(n.dr_priority, n.address))
            .fold(rank(Some(self.dr_priority), self.address), |best, candidate| {
                best.max(candidate)
            })
            .1;
        let changed = winner != self.designated_router;
        self.designated_router = winner;
        changed
    }
}

impl<E: Environment> Router<E> {
    /// Send the first Hello and start the bootstrap and C-RP machines
    pub(crate) fn start_interface(&mut self, now: Instant, interface: IfIndex) -> Result<(), PimError> {
        self.check_interface(interface)?;
        self.send_hello(interface, self.hello_holdtime());
        self.arm_hello_timer(now, interface, self.config.timers.hello_period);
        self.start_bootstrap(now, interface);
        self.start_candidate_rp(now, interface);
        log_debug!(
            self.logger,
            Facility::Hello,
            &format!("PIM: enabled {}", interface)
        );
        Ok(())
    }

    /// Announce shutdown: a Hello with holdtime 0 on every interface
    pub fn stop(&mut self) {
        let indices: Vec<IfIndex> = self.interfaces.keys().copied().collect();
        for index in indices {
            self.send_hello(index, 0);
            if let Some(iface) = self.interfaces.get_mut(&index) {
                iface.hello_timer.stop();
                iface.bsr_timer.stop();
                iface.crp_timer.stop();
            }
        }
        log_info!(self.logger, Facility::Hello, "PIM: stopped");
    }

    fn hello_holdtime(&self) -> u16 {
        u16::try_from(self.config.timers.hello_holdtime.as_secs()).unwrap_or(HOLDTIME_INFINITE)
    }

    fn send_hello(&mut self, interface: IfIndex, holdtime: u16) {
        let Some(iface) = self.interfaces.get(&interface) else {
            return;
        };
        let timers = &self.config.timers;
        let hello = Hello::new(holdtime, iface.dr_priority, iface.generation_id).with_lan_prune_delay(
            u16::try_from(timers.propagation_delay.as_millis()).unwrap_or(u16::MAX),
            u16::try_from(timers.override_interval.as_millis()).unwrap_or(u16::MAX),
        );
        self.send_multicast(interface, PimMessage::Hello(hello));
    }

    fn arm_hello_timer(&mut self, now: Instant, interface: IfIndex, delay: Duration) {
        if let Some(iface) = self.interfaces.get_mut(&interface) {
            self.scheduler
                .arm(&mut iface.hello_timer, now, delay, |epoch| TimerKind::Hello {
                    interface,
                    epoch,
                });
        }
    }

    pub(crate) fn hello_timer_expired(&mut self, now: Instant, interface: IfIndex) {
        self.send_hello(interface, self.hello_holdtime());
        self.arm_hello_timer(now, interface, self.config.timers.hello_period);
    }

    /// Bring the next Hello forward to a random point within the triggered
    /// Hello delay
    fn trigger_hello(&mut self, now: Instant, interface: IfIndex) {
        let max = self.config.timers.triggered_hello_delay;
        let remaining = self
            .interfaces
            .get(&interface)
            .and_then(|i| i.hello_timer.remaining(now));
        if remaining.is_some_and(|r| r <= max) {
            return;
        }
        let delay = self.random_delay(max);
        self.arm_hello_timer(now, interface, delay);
    }

    pub(crate) fn receive_hello(
        &mut self,
        now: Instant,
        interface: IfIndex,
        source: Ipv4Addr,
        hello: &Hello,
    ) -> Result<(), PimError> {
        if self.is_local_address(source) {
            return Ok(());
        }
        let default_holdtime = self.hello_holdtime();
        let holdtime = hello.holdtime().unwrap_or(default_holdtime);
        let Some(iface) = self.interfaces.get_mut(&interface) else {
            return Ok(());
        };

        if holdtime == 0 {
            if iface.neighbors.contains_key(&source) {
                log_info!(
                    self.logger,
                    Facility::Hello,
                    &format!("PIM: neighbor {} on {} said goodbye", source, interface)
                );
                return self.neighbor_lost(now, interface, source);
            }
            return Ok(());
        }

        let previous = iface.neighbors.get(&source).map(|n| n.generation_id);
        let is_new = previous.is_none();
        let restarted = previous.is_some_and(|old| old != hello.generation_id());

        let neighbor = iface.neighbors.entry(source).or_insert_with(|| Neighbor {
            address: source,
            dr_priority: None,
            generation_id: None,
            holdtime,
            liveness: Timer::default(),
        });
        neighbor.dr_priority = hello.dr_priority();
        neighbor.generation_id = hello.generation_id();
        neighbor.holdtime = holdtime;
        if holdtime == HOLDTIME_INFINITE {
            neighbor.liveness.stop();
        } else {
            self.scheduler.arm(
                &mut neighbor.liveness,
                now,
                Duration::from_secs(u64::from(holdtime)),
                |epoch| TimerKind::NeighborLiveness {
                    interface,
                    neighbor: source,
                    epoch,
                },
            );
        }
        let dr_changed = iface.elect_dr();
        let dr = iface.designated_router;

        if is_new || restarted {
            log_info!(
                self.logger,
                Facility::Hello,
                &format!(
                    "PIM: {} neighbor {} on {} (holdtime {}s)",
                    if is_new { "new" } else { "restarted" },
                    source,
                    interface,
                    holdtime
                )
            );
            if self.bootstrap.stored_bsm.is_some() {
                // The neighbor must know us before it accepts our BSM
                self.hello_timer_expired(now, interface);
                self.send_stored_bsm(interface, source);
            } else {
                self.trigger_hello(now, interface);
            }
        }
        if restarted {
            self.upstream_neighbor_restarted(now, interface, source);
            self.assert_winner_gone(now, interface, source)?;
        }
        if dr_changed {
            log_info!(
                self.logger,
                Facility::Hello,
                &format!("PIM: DR on {} is now {}", interface, dr)
            );
            self.dr_changed(now, interface)?;
        }
        Ok(())
    }

    /// Neighbor timed out or said goodbye
    pub(crate) fn neighbor_lost(
        &mut self,
        now: Instant,
        interface: IfIndex,
        neighbor: Ipv4Addr,
    ) -> Result<(), PimError> {
        let Some(iface) = self.interfaces.get_mut(&interface) else {
            return Ok(());
        };
        if iface.neighbors.remove(&neighbor).is_none() {
            return Ok(());
        }
        let dr_changed = iface.elect_dr();
        let dr = iface.designated_router;
        log_info!(
            self.logger,
            Facility::Hello,
            &format!("PIM: lost neighbor {} on {}", neighbor, interface)
        );

        self.assert_winner_gone(now, interface, neighbor)?;
        if dr_changed {
            log_info!(
                self.logger,
                Facility::Hello,
                &format!("PIM: DR on {} is now {}", interface, dr)
            );
            self.dr_changed(now, interface)
        } else {
            self.evaluate_all(now)
        }
    }
}
