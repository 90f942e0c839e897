// SPDX-License-Identifier: Apache-2.0 OR MIT
// Integration test utilities
//
// Routers under test run in-process. A `Lab` wires several of them into
// shared LAN segments, carries their control packets over the real wire
// encoding, relays forwarded data copies and fires timers on a simulated
// clock.

pub mod lab;

pub use lab::{Lab, LanMember};

use std::net::Ipv4Addr;

use pim_sm::config::InterfaceConfig;
use pim_sm::{IfIndex, PimConfig, RpfRoute, StaticEnvironment};

pub fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

/// Two routers joined by one link:
///
/// ```text
///  hosts 10.1.0.0/24     link 10.12.0.0/24      hosts 10.2.0.0/24
///  ---------- if1 [R0] if2 ------------ if1 [R1] if2 ----------
///           .1         .1              .2         .1
/// ```
///
/// `tune` adjusts each router's configuration (index 0 or 1) before start.
pub fn two_routers(tune: impl Fn(usize, &mut PimConfig)) -> Lab {
    let mut lab = Lab::new();

    let mut r0 = PimConfig::default();
    r0.interfaces = vec![
        InterfaceConfig::new(1, addr("10.1.0.1"), 24),
        InterfaceConfig::new(2, addr("10.12.0.1"), 24),
    ];
    r0.random_seed = Some(11);
    tune(0, &mut r0);
    let mut env0 = StaticEnvironment::new();
    env0.add_connected(addr("10.1.0.0"), 24, IfIndex(1));
    env0.add_connected(addr("10.12.0.0"), 24, IfIndex(2));
    env0.add_route(addr("10.2.0.0"), 24, RpfRoute::via(IfIndex(2), addr("10.12.0.2")));

    let mut r1 = PimConfig::default();
    r1.interfaces = vec![
        InterfaceConfig::new(1, addr("10.12.0.2"), 24),
        InterfaceConfig::new(2, addr("10.2.0.1"), 24),
    ];
    r1.random_seed = Some(22);
    tune(1, &mut r1);
    let mut env1 = StaticEnvironment::new();
    env1.add_connected(addr("10.12.0.0"), 24, IfIndex(1));
    env1.add_connected(addr("10.2.0.0"), 24, IfIndex(2));
    env1.add_route(addr("10.1.0.0"), 24, RpfRoute::via(IfIndex(1), addr("10.12.0.1")));

    lab.add_router(r0, env0);
    lab.add_router(r1, env1);
    lab.connect(&[(0, 1)]);
    lab.connect(&[(0, 2), (1, 1)]);
    lab.connect(&[(1, 2)]);
    lab
}
