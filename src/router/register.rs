// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Register machinery, RFC 4601 section 4.4
//!
//! The DR of a directly connected source encapsulates its data toward the RP
//! until the RP answers with Register-Stop. The per-(S,G) register state
//! machine then suppresses encapsulation and periodically probes with a
//! Null-Register shortly before the suppression runs out.
//!
//! ```text
//!            CouldRegister
//!   NoInfo ----------------> Join
//!                            |  ^
//!             Register-Stop  |  | RST expires
//!                            v  |
//!             Prune ------> JoinPending
//!                RST expires
//!               (Null-Register)
//! ```

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::tib::{RegisterState, TreeKey, TreeType};
use super::Router;
use crate::env::Environment;
use crate::error::PimError;
use crate::logging::Facility;
use crate::packet::{DataPacket, PimMessage, Register, RegisterStop};
use crate::timer::EntryTimer;
use crate::{log_debug, log_info};

impl<E: Environment> Router<E> {
    /// CouldRegister(S,G)
    pub(crate) fn could_register(&self, source: Ipv4Addr, group: Ipv4Addr) -> bool {
        let key = TreeKey::sg(source, group);
        let keepalive = self
            .tib
            .lookup(&key)
            .is_some_and(|e| e.keepalive.is_running());
        if !keepalive || self.is_ssm(group) {
            return false;
        }
        let Some(interface) = self.directly_connected_interface(source) else {
            return false;
        };
        if self.source_rpf_interface(source, group) != Some(interface) || !self.is_dr(interface) {
            return false;
        }
        match self.rp_for_group(group) {
            Some(rp) => self.is_local_address(rp) || self.env.resolve(rp).is_some(),
            None => false,
        }
    }

    /// Register state follows CouldRegister
    pub(crate) fn update_register(&mut self, _now: Instant, key: TreeKey) {
        let could = self.could_register(key.source, key.group);
        let Some(entry) = self.tib.lookup_mut(&key) else {
            return;
        };
        let old = entry.register;
        match (old, could) {
            (RegisterState::NoInfo, true) => entry.register = RegisterState::Join,
            (RegisterState::NoInfo, false) | (_, true) => {}
            (_, false) => {
                entry.register = RegisterState::NoInfo;
                entry.register_stop_timer.stop();
            }
        }
        let new = entry.register;
        if new != old {
            log_debug!(
                self.logger,
                Facility::Register,
                &format!("PIM: register {} {:?} -> {:?}", key, old, new)
            );
        }
    }

    /// Encapsulate `packet` toward the RP when the register state allows it.
    /// Returns whether a Register was sent.
    pub(crate) fn register_data(&mut self, packet: &DataPacket) -> bool {
        let key = TreeKey::sg(packet.source, packet.group);
        let Some(entry) = self.tib.lookup(&key) else {
            return false;
        };
        if entry.spt_bit
            || !matches!(
                entry.register,
                RegisterState::Join | RegisterState::JoinPending
            )
        {
            return false;
        }
        let Some(rp) = entry.rp.or_else(|| self.rp_for_group(packet.group)) else {
            return false;
        };
        if self.is_local_address(rp) {
            return false;
        }
        self.send_unicast(None, rp, PimMessage::Register(Register::encapsulate(packet)));
        self.stats.data_registered += 1;
        true
    }

    pub(crate) fn receive_register_stop(&mut self, now: Instant, stop: &RegisterStop) -> Result<(), PimError> {
        let keys: Vec<TreeKey> = if stop.source.is_unspecified() {
            self.tib.sources(stop.group, TreeType::Sg)
        } else {
            vec![TreeKey::sg(stop.source, stop.group)]
        };
        for key in keys {
            let state = self.tib.lookup(&key).map(|e| e.register);
            if !matches!(state, Some(RegisterState::Join | RegisterState::JoinPending)) {
                continue;
            }
            if let Some(entry) = self.tib.lookup_mut(&key) {
                entry.register = RegisterState::Prune;
            }
            let timers = &self.config.timers;
            let suppression = timers.register_suppression;
            let probe = timers.register_probe;
            let delay = suppression
                .mul_f64(self.random_range(0.5, 1.5))
                .saturating_sub(probe);
            self.arm_entry_timer(now, key, EntryTimer::RegisterStop, delay);
            log_info!(
                self.logger,
                Facility::Register,
                &format!("PIM: Register-Stop for {}, suppressing for {:?}", key, delay)
            );
        }
        Ok(())
    }

    pub(crate) fn register_stop_timer_expired(&mut self, now: Instant, key: TreeKey) {
        let Some((state, rp)) = self.tib.lookup(&key).map(|e| (e.register, e.rp)) else {
            return;
        };
        match state {
            RegisterState::Prune => {
                if let Some(entry) = self.tib.lookup_mut(&key) {
                    entry.register = RegisterState::JoinPending;
                }
                if let Some(rp) = rp.or_else(|| self.rp_for_group(key.group)) {
                    self.send_unicast(
                        None,
                        rp,
                        PimMessage::Register(Register::null(key.source, key.group)),
                    );
                }
                let probe = self.config.timers.register_probe;
                self.arm_entry_timer(now, key, EntryTimer::RegisterStop, probe);
                log_debug!(
                    self.logger,
                    Facility::Register,
                    &format!("PIM: probing RP for {} with Null-Register", key)
                );
            }
            RegisterState::JoinPending => {
                if let Some(entry) = self.tib.lookup_mut(&key) {
                    entry.register = RegisterState::Join;
                }
                log_debug!(
                    self.logger,
                    Facility::Register,
                    &format!("PIM: resuming registers for {}", key)
                );
            }
            RegisterState::NoInfo | RegisterState::Join => {}
        }
    }

    pub(crate) fn keepalive_expired(&mut self, _now: Instant, key: TreeKey) {
        if let Some(entry) = self.tib.lookup_mut(&key) {
            if !entry.is_joined_upstream() {
                entry.spt_bit = false;
            }
        }
        self.forwarding.forget(key.source, key.group);
        log_debug!(
            self.logger,
            Facility::Register,
            &format!("PIM: keepalive of {} expired", key)
        );
    }

    /// RP side: decapsulate, answer with Register-Stop when the native path
    /// works or nobody listens
    pub(crate) fn receive_register(
        &mut self,
        now: Instant,
        sender: Ipv4Addr,
        register: &Register,
    ) -> Result<(), PimError> {
        let inner = match register.inner() {
            Ok(packet) if packet.group.is_multicast() => packet,
            Ok(_) | Err(_) => {
                self.stats.malformed += 1;
                log_debug!(
                    self.logger,
                    Facility::Register,
                    &format!("PIM: bad Register payload from {}", sender)
                );
                return Ok(());
            }
        };
        let (source, group) = (inner.source, inner.group);
        let stop = PimMessage::RegisterStop(RegisterStop { group, source });

        let i_am_rp = self
            .rp_for_group(group)
            .is_some_and(|rp| self.is_local_address(rp));
        if !i_am_rp {
            log_debug!(
                self.logger,
                Facility::Register,
                &format!("PIM: Register for ({},{}) but not its RP", source, group)
            );
            self.send_unicast(None, sender, stop);
            return Ok(());
        }

        let key = TreeKey::sg(source, group);
        self.ensure_entry(key);
        let spt_bit = self.spt_bit(source, group);
        let send_stop = spt_bit || self.inherited_olist_sg(source, group).is_empty();
        if send_stop {
            self.send_unicast(None, sender, stop);
        }
        let keepalive: Duration = if send_stop {
            self.config.timers.rp_keepalive_period()
        } else {
            self.config.timers.keepalive_period
        };
        self.arm_entry_timer(now, key, EntryTimer::Keepalive, keepalive);

        if !spt_bit && !register.null_register && inner.ttl > 1 {
            let mut copy = inner.clone();
            copy.ttl -= 1;
            for interface in self.inherited_olist_sg_rpt(source, group) {
                self.emit_data(interface, copy.clone());
                self.stats.data_forwarded += 1;
            }
        }
        log_debug!(
            self.logger,
            Facility::Register,
            &format!(
                "PIM: {}Register for {} from {}{}",
                if register.null_register { "Null-" } else { "" },
                key,
                sender,
                if send_stop { ", stopped" } else { "" }
            )
        );
        self.evaluate_group(now, group)
    }
}
