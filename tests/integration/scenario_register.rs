// SPDX-License-Identifier: Apache-2.0 OR MIT
use std::time::Duration;

use pim_sm::config::StaticRpConfig;
use pim_sm::packet::{PimMessage, PIM_REGISTER, PIM_REGISTER_STOP};
use pim_sm::router::{DownstreamState, RegisterState, TreeKey};
use pim_sm::{DataPacket, IfIndex, ALL_MULTICAST};

use crate::common::{addr, two_routers, Lab};

/// R1 is the RP, R0 the first-hop DR of 10.1.0.10
fn rp_on_r1() -> Lab {
    let mut lab = two_routers(|_, config| {
        config.static_rp = vec![StaticRpConfig {
            rp: addr("10.12.0.2"),
            group: ALL_MULTICAST,
            priority: 0,
        }];
    });
    lab.start();
    lab
}

fn is_null_register(message: &PimMessage) -> bool {
    matches!(message, PimMessage::Register(r) if r.null_register)
}

#[test]
fn test_register_without_receivers_is_stopped_and_probed() {
    let mut lab = rp_on_r1();
    let (source, group) = (addr("10.1.0.10"), addr("230.2.2.2"));
    lab.send_data(0, 1, DataPacket::new(source, group, &b"first"[..]));

    let sg = TreeKey::sg(source, group);
    assert_eq!(lab.routers[0].stats().data_registered, 1);
    assert_eq!(lab.sent_by(1, PIM_REGISTER_STOP).len(), 1);
    assert_eq!(lab.routers[0].entry(&sg).unwrap().register, RegisterState::Prune);
    assert!(lab.routers[1].entry(&sg).is_some());

    // Suppression is randomized within [25s, 85s] before the probe
    lab.advance(Duration::from_secs(90));
    let registers = lab.sent_by(0, PIM_REGISTER);
    assert!(registers.len() >= 2);
    assert!(!is_null_register(&registers[0].message));
    assert!(registers[1..].iter().all(|r| is_null_register(&r.message)));
    assert_eq!(lab.sent_by(1, PIM_REGISTER_STOP).len(), registers.len());
    assert_eq!(lab.routers[0].entry(&sg).unwrap().register, RegisterState::Prune);
    // Null-Registers never reach the data path
    assert_eq!(lab.routers[0].stats().data_registered, 1);
}

#[test]
fn test_rp_joins_source_and_registers_stop() {
    let mut lab = rp_on_r1();
    let (source, group) = (addr("10.1.0.10"), addr("230.2.2.2"));
    lab.join(1, group, 2);

    lab.send_data(0, 1, DataPacket::new(source, group, &b"encapsulated"[..]));
    // Decapsulated at the RP, which then joins toward the source
    assert_eq!(lab.delivered_on(1, 2), 1);
    assert_eq!(lab.routers[0].stats().data_registered, 1);
    let sg = TreeKey::sg(source, group);
    assert_eq!(
        lab.routers[1].entry(&sg).unwrap().upstream_neighbor,
        Some(addr("10.12.0.1"))
    );
    assert_eq!(
        lab.routers[0].entry(&sg).unwrap().downstream_state(IfIndex(2)),
        DownstreamState::Join
    );

    // Native forwarding from here on, one copy per packet and no Registers
    for n in 1..=3 {
        lab.send_data(0, 1, DataPacket::new(source, group, &b"native"[..]));
        assert_eq!(lab.delivered_on(1, 2), 1 + n);
    }
    assert!(lab.routers[0].entry(&sg).unwrap().spt_bit);
    assert!(lab.routers[1].entry(&sg).unwrap().spt_bit);
    assert_eq!(lab.routers[0].stats().data_registered, 1);
    assert_eq!(lab.sent_by(0, PIM_REGISTER).len(), 1);
}
