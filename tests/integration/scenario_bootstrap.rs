// SPDX-License-Identifier: Apache-2.0 OR MIT
use std::time::Duration;

use pim_sm::packet::{PimMessage, PIM_BOOTSTRAP, PIM_CANDIDATE_RP};
use pim_sm::router::{BsrInfo, RpOrigin, TreeKey};
use pim_sm::IfIndex;

use crate::common::{addr, two_routers};

#[test]
fn test_rp_set_learned_from_elected_bsr() {
    let mut lab = two_routers(|router, config| {
        if router == 0 {
            config.interfaces[1].candidate_bsr_priority = Some(10);
            config.interfaces[1].candidate_rp_priority = Some(5);
        }
    });
    lab.start();
    assert_eq!(lab.routers[1].rp_for_group(addr("230.3.3.3")), None);

    lab.advance(Duration::from_secs(20));

    let bsr = BsrInfo {
        address: addr("10.12.0.1"),
        priority: 10,
    };
    assert!(lab.routers[0].interface(IfIndex(2)).unwrap().bsr.is_elected());
    assert_eq!(lab.routers[0].bootstrap().current, Some(bsr));
    assert_eq!(lab.routers[1].bootstrap().current, Some(bsr));

    assert_eq!(lab.routers[1].rp_for_group(addr("230.3.3.3")), Some(addr("10.12.0.1")));
    assert!(lab.routers[1]
        .rp_set()
        .iter()
        .any(|e| e.rp == addr("10.12.0.1") && e.origin == RpOrigin::Bootstrap));

    // Only the link with a neighbor carries BSMs
    let bsms = lab.sent_by(0, PIM_BOOTSTRAP);
    assert!(!bsms.is_empty());
    assert!(bsms.iter().all(|p| p.interface == Some(IfIndex(2))));
    // R1 has no candidacy and never re-originates
    assert!(lab.sent_by(1, PIM_CANDIDATE_RP).is_empty());
    assert!(lab.sent_by(1, PIM_BOOTSTRAP).iter().all(|p| match &p.message {
        PimMessage::Bootstrap(bsm) => bsm.bsr_address == bsr.address,
        _ => false,
    }));
}

#[test]
fn test_higher_priority_candidate_wins() {
    let mut lab = two_routers(|router, config| match router {
        0 => config.interfaces[1].candidate_bsr_priority = Some(10),
        _ => config.interfaces[0].candidate_bsr_priority = Some(20),
    });
    lab.start();
    lab.advance(Duration::from_secs(30));

    let winner = BsrInfo {
        address: addr("10.12.0.2"),
        priority: 20,
    };
    assert!(lab.routers[1].interface(IfIndex(1)).unwrap().bsr.is_elected());
    assert!(!lab.routers[0].interface(IfIndex(2)).unwrap().bsr.is_elected());
    assert_eq!(lab.routers[0].bootstrap().current, Some(winner));
    assert_eq!(lab.routers[1].bootstrap().current, Some(winner));

    // The loser keeps following the winner's periodic BSMs
    lab.advance(Duration::from_secs(120));
    assert_eq!(lab.routers[0].bootstrap().current, Some(winner));
}

#[test]
fn test_joins_follow_bootstrap_rp() {
    let mut lab = two_routers(|router, config| {
        if router == 0 {
            config.interfaces[0].candidate_bsr_priority = Some(1);
            config.interfaces[0].candidate_rp_priority = Some(1);
        }
    });
    lab.start();
    lab.advance(Duration::from_secs(20));

    let group = addr("230.4.4.4");
    lab.join(1, group, 2);
    let entry = lab.routers[1].entry(&TreeKey::star_g(group)).expect("(*,G) at R1");
    assert_eq!(entry.rp, Some(addr("10.1.0.1")));
    assert_eq!(entry.upstream_neighbor, Some(addr("10.12.0.1")));
}
