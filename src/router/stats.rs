// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Protocol and data-path counters

use serde::Serialize;

use crate::packet::{
    PIM_ASSERT, PIM_BOOTSTRAP, PIM_CANDIDATE_RP, PIM_HELLO, PIM_JOIN_PRUNE, PIM_REGISTER,
    PIM_REGISTER_STOP,
};

/// Per-message-type counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageCounters {
    pub hello: u64,
    pub register: u64,
    pub register_stop: u64,
    pub join_prune: u64,
    pub bootstrap: u64,
    pub assert: u64,
    pub candidate_rp: u64,
}

impl MessageCounters {
    pub fn count(&mut self, msg_type: u8) {
        let counter = match msg_type {
            PIM_HELLO => &mut self.hello,
            PIM_REGISTER => &mut self.register,
            PIM_REGISTER_STOP => &mut self.register_stop,
            PIM_JOIN_PRUNE => &mut self.join_prune,
            PIM_BOOTSTRAP => &mut self.bootstrap,
            PIM_ASSERT => &mut self.assert,
            PIM_CANDIDATE_RP => &mut self.candidate_rp,
            _ => return,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u64 {
        self.hello
            + self.register
            + self.register_stop
            + self.join_prune
            + self.bootstrap
            + self.assert
            + self.candidate_rp
    }
}

/// Router-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PimStats {
    pub sent: MessageCounters,
    pub received: MessageCounters,
    /// Control packets that failed to decode
    pub malformed: u64,
    /// Well-formed messages dropped (unknown sender, foreign RP, bad scope)
    pub ignored: u64,
    pub asserts_won: u64,
    pub asserts_lost: u64,

    pub data_received: u64,
    /// Copies sent out of an interface
    pub data_forwarded: u64,
    pub data_registered: u64,
    /// Source not RPF-resolvable
    pub discarded_no_route: u64,
    /// Nothing to forward to and nothing registered
    pub discarded_empty_olist: u64,
    pub discarded_ttl: u64,
    /// Arrived on neither RPF(S) nor RPF(RP)
    pub rpf_failures: u64,
}

impl PimStats {
    pub fn data_discarded(&self) -> u64 {
        self.discarded_no_route + self.discarded_empty_olist + self.discarded_ttl
    }

    /// JSON snapshot for embedders
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
