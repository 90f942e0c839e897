// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Property-Based Tests: RP Selection and Assert Metrics
//!
//! Every router on a domain must compute the same RP(G) from the same RP
//! set, whatever order the mappings arrived in, and every router on a LAN
//! must agree on the assert winner.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use pim_sm::router::{rp_hash, AssertMetric, RpSet};
use pim_sm::GroupRange;
use proptest::prelude::*;

fn group() -> impl Strategy<Value = Ipv4Addr> {
    (224u8..=239, any::<[u8; 3]>()).prop_map(|(a, [b, c, d])| Ipv4Addr::new(a, b, c, d))
}

fn mapping() -> impl Strategy<Value = (Ipv4Addr, GroupRange, u8)> {
    (
        (1u8..=223, any::<[u8; 3]>()).prop_map(|(a, [b, c, d])| Ipv4Addr::new(a, b, c, d)),
        group(),
        4u8..=32,
        0u8..4,
    )
        .prop_map(|(rp, prefix, mask_len, priority)| (rp, GroupRange::new(prefix, mask_len), priority))
}

fn metric() -> impl Strategy<Value = AssertMetric> {
    (any::<bool>(), 0u32..4, 0u32..4, any::<[u8; 4]>()).prop_map(|(rpt_bit, preference, metric, a)| {
        AssertMetric {
            rpt_bit,
            preference,
            metric,
            address: Ipv4Addr::from(a),
        }
    })
}

/// One mapping per (range, RP), as in a real RP set
fn distinct(mut mappings: Vec<(Ipv4Addr, GroupRange, u8)>) -> Vec<(Ipv4Addr, GroupRange, u8)> {
    let mut seen = BTreeSet::new();
    mappings.retain(|&(rp, range, _)| seen.insert((range, rp)));
    mappings
}

fn build(mappings: &[(Ipv4Addr, GroupRange, u8)]) -> RpSet {
    let mut set = RpSet::new();
    for &(rp, range, priority) in mappings {
        set.insert_static(rp, range, priority);
    }
    set
}

proptest! {
    #[test]
    fn test_selection_ignores_insertion_order(
        mappings in prop::collection::vec(mapping(), 1..8),
        g in group(),
        hash_mask_len in 0u8..=32,
    ) {
        let mappings = distinct(mappings);
        let forward = build(&mappings);
        let mut reversed = mappings.clone();
        reversed.reverse();
        let backward = build(&reversed);
        prop_assert_eq!(forward.select(g, hash_mask_len), backward.select(g, hash_mask_len));
    }

    /// The chosen RP comes from a longest-prefix covering range with the
    /// best priority there, and wins the hash among its peers
    #[test]
    fn test_selection_prefers_longest_prefix_then_priority(
        mappings in prop::collection::vec(mapping(), 1..8),
        g in group(),
    ) {
        let set = build(&mappings);
        let covering: Vec<_> = set.iter().filter(|e| e.range.contains(g)).collect();
        match set.select(g, 30) {
            None => prop_assert!(covering.is_empty()),
            Some(rp) => {
                let longest = covering.iter().map(|e| e.range.mask_len).max().unwrap();
                let best = covering
                    .iter()
                    .filter(|e| e.range.mask_len == longest)
                    .map(|e| e.priority)
                    .min()
                    .unwrap();
                let peers: Vec<_> = covering
                    .iter()
                    .filter(|e| e.range.mask_len == longest && e.priority == best)
                    .collect();
                prop_assert!(peers.iter().any(|e| e.rp == rp));
                let winner = (rp_hash(g, 30, rp), rp);
                prop_assert!(peers.iter().all(|e| (rp_hash(g, 30, e.rp), e.rp) <= winner));
            }
        }
    }

    #[test]
    fn test_hash_stays_below_2_31(g in group(), rp in any::<[u8; 4]>(), mask_len in 0u8..=32) {
        prop_assert!(rp_hash(g, mask_len, Ipv4Addr::from(rp)) < 1 << 31);
    }

    /// Assert comparison is a total order consistent with equality
    #[test]
    fn test_assert_metric_total_order(a in metric(), b in metric(), c in metric()) {
        prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        prop_assert_eq!(a.cmp(&b) == Ordering::Equal, a == b);
        if a > b && b > c {
            prop_assert!(a > c);
        }
    }

    /// A cleared RPT bit beats any metric with the bit set
    #[test]
    fn test_spt_assert_beats_rpt_assert(a in metric(), b in metric()) {
        let spt = AssertMetric { rpt_bit: false, ..a };
        let rpt = AssertMetric { rpt_bit: true, ..b };
        prop_assert!(spt > rpt);
    }
}
