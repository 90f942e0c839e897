// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Re-mapping of trees after an RP-set change

use std::time::Instant;

use super::tib::{RegisterState, TreeKey, TreeType};
use super::Router;
use crate::env::Environment;
use crate::error::PimError;
use crate::log_info;
use crate::logging::Facility;
use crate::timer::EntryTimer;

impl<E: Environment> Router<E> {
    /// Recompute RP(G) for every (*,G) and (S,G) entry and move the trees
    /// whose RP changed
    pub(crate) fn rp_set_changed(&mut self, now: Instant) -> Result<(), PimError> {
        for key in self.tib.keys() {
            let Some(old_rp) = self.tib.lookup(&key).map(|e| e.rp) else {
                continue;
            };
            let new_rp = self.rp_for_group(key.group);
            if old_rp == new_rp {
                continue;
            }
            match key.tree {
                TreeType::G => self.move_shared_tree(now, key, new_rp)?,
                TreeType::Sg => {
                    if let Some(entry) = self.tib.lookup_mut(&key) {
                        entry.rp = new_rp;
                        if matches!(entry.register, RegisterState::Prune | RegisterState::JoinPending) {
                            entry.register = RegisterState::Join;
                            entry.register_stop_timer.stop();
                        }
                    }
                }
                TreeType::SgRpt | TreeType::Rp => {}
            }
        }
        self.evaluate_all(now)
    }

    fn move_shared_tree(
        &mut self,
        now: Instant,
        key: TreeKey,
        new_rp: Option<std::net::Ipv4Addr>,
    ) -> Result<(), PimError> {
        let Some(entry) = self.tib.lookup(&key) else {
            return Ok(());
        };
        let old_rp = entry.rp;
        let joined = entry.is_joined_upstream();
        let was_rp = old_rp.is_some_and(|rp| self.is_local_address(rp));
        log_info!(
            self.logger,
            Facility::RpMapping,
            &format!("PIM: RP of {} changed {:?} -> {:?}", key, old_rp, new_rp)
        );

        if joined && !was_rp {
            let old_target = self.upstream_target(key);
            self.send_join_prune(key, false, old_target)?;
        }

        let rpf = self.resolve_entry_rpf(key, new_rp);
        if let Some(entry) = self.tib.lookup_mut(&key) {
            entry.rp = new_rp;
            entry.rpf = rpf;
        }
        let neighbor = self.rpf_prime(key);
        if let Some(entry) = self.tib.lookup_mut(&key) {
            entry.upstream_neighbor = neighbor;
        }

        for rpt in self.tib.sources(key.group, TreeType::SgRpt) {
            if let Some(entry) = self.tib.lookup_mut(&rpt) {
                entry.rp = new_rp;
                entry.rpf = rpf;
            }
            let neighbor = self.rpf_prime(rpt);
            if let Some(entry) = self.tib.lookup_mut(&rpt) {
                entry.upstream_neighbor = neighbor;
            }
        }

        if joined {
            let new_target = self.upstream_target(key);
            self.send_join_prune(key, true, new_target)?;
            self.arm_entry_timer(now, key, EntryTimer::Join, self.config.timers.join_prune_period);
        }
        Ok(())
    }
}
