// SPDX-License-Identifier: Apache-2.0 OR MIT
use pim_sm::config::StaticRpConfig;
use pim_sm::packet::{PimMessage, PIM_JOIN_PRUNE};
use pim_sm::router::{DownstreamState, TreeKey, UpstreamState};
use pim_sm::{DataPacket, IfIndex, ALL_MULTICAST};

use crate::common::{addr, two_routers, Lab};

fn rp_on_r0() -> Lab {
    let mut lab = two_routers(|_, config| {
        config.static_rp = vec![StaticRpConfig {
            rp: addr("10.1.0.1"),
            group: ALL_MULTICAST,
            priority: 0,
        }];
    });
    lab.start();
    lab
}

#[test]
fn test_receiver_join_builds_shared_tree() {
    let mut lab = rp_on_r0();
    let group = addr("230.1.1.1");
    lab.join(1, group, 2);

    let star_g = TreeKey::star_g(group);
    let leaf = lab.routers[1].entry(&star_g).expect("(*,G) on the last hop");
    assert_eq!(leaf.rp, Some(addr("10.1.0.1")));
    assert_eq!(leaf.upstream, UpstreamState::Joined);
    assert_eq!(leaf.downstream_state(IfIndex(2)), DownstreamState::Join);

    let joins = lab.sent_by(1, PIM_JOIN_PRUNE);
    let first = joins.first().expect("Join(*,G) sent upstream");
    assert_eq!(first.interface, Some(IfIndex(1)));
    match &first.message {
        PimMessage::JoinPrune(jp) => {
            assert_eq!(jp.upstream_neighbor, addr("10.12.0.1"));
            let block = &jp.groups[0];
            assert_eq!(block.group.address, group);
            assert!(block.joins[0].wildcard && block.joins[0].rpt);
        }
        other => panic!("expected Join/Prune, got {:?}", other),
    }

    // The RP holds the receiver side of the link
    let root = lab.routers[0].entry(&star_g).expect("(*,G) at the RP");
    assert_eq!(root.downstream_state(IfIndex(2)), DownstreamState::Join);
}

#[test]
fn test_data_follows_shared_tree_to_receiver() {
    let mut lab = rp_on_r0();
    let group = addr("230.1.1.1");
    lab.join(1, group, 2);

    for n in 0..3u8 {
        lab.send_data(0, 1, DataPacket::new(addr("10.1.0.10"), group, vec![n]));
    }

    assert_eq!(lab.delivered_on(0, 2), 3);
    assert_eq!(lab.delivered_on(1, 2), 3);
    // The RP is its own DR's RP, nothing is registered
    assert_eq!(lab.routers[0].stats().data_registered, 0);
    assert!(lab.delivered.iter().all(|(_, _, p)| p.ttl < 64));
}

#[test]
fn test_receiver_leave_prunes_shared_tree() {
    let mut lab = rp_on_r0();
    let group = addr("230.1.1.1");
    lab.join(1, group, 2);
    lab.leave(1, group, 2);

    let star_g = TreeKey::star_g(group);
    assert!(lab.routers[1]
        .entry(&star_g)
        .map_or(true, |e| e.upstream == UpstreamState::NotJoined));

    // The RP drops the link once the prune-pending delay has run out
    lab.advance(std::time::Duration::from_secs(5));
    assert!(lab.routers[0]
        .entry(&star_g)
        .map_or(true, |e| e.downstream_state(IfIndex(2)) == DownstreamState::NoInfo));

    lab.send_data(0, 1, DataPacket::new(addr("10.1.0.10"), group, &b"late"[..]));
    assert_eq!(lab.delivered_on(1, 2), 0);
}
