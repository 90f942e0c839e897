// SPDX-License-Identifier: Apache-2.0 OR MIT
// In-process multi-router test bed

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use pim_sm::logging::Logger;
use pim_sm::router::{ForwardedPacket, OutgoingPacket};
use pim_sm::timer::TimerKind;
use pim_sm::{
    DataPacket, IfIndex, MembershipChange, PimConfig, Router, RpfResolver, StaticEnvironment,
};

/// One router interface attached to a LAN segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanMember {
    pub router: usize,
    pub interface: IfIndex,
}

pub struct Lab {
    pub routers: Vec<Router<StaticEnvironment>>,
    lans: Vec<Vec<LanMember>>,
    timers: BinaryHeap<Reverse<(Instant, u64, usize, TimerKind)>>,
    seq: u64,
    pub now: Instant,
    /// Data copies that reached a LAN: (router, interface, packet)
    pub delivered: Vec<(usize, IfIndex, DataPacket)>,
    /// Every control message sent, by sending router
    pub sent: Vec<(usize, OutgoingPacket)>,
}

impl Lab {
    pub fn new() -> Self {
        Self {
            routers: Vec::new(),
            lans: Vec::new(),
            timers: BinaryHeap::new(),
            seq: 0,
            now: Instant::now(),
            delivered: Vec::new(),
            sent: Vec::new(),
        }
    }

    pub fn add_router(&mut self, config: PimConfig, env: StaticEnvironment) -> usize {
        let (logger, _ring) = Logger::in_memory(1024);
        self.routers
            .push(Router::new(config, env, logger).expect("valid router config"));
        self.routers.len() - 1
    }

    /// Attach `(router, interface index)` pairs to one segment
    pub fn connect(&mut self, members: &[(usize, u32)]) {
        self.lans.push(
            members
                .iter()
                .map(|&(router, index)| LanMember {
                    router,
                    interface: IfIndex(index),
                })
                .collect(),
        );
    }

    pub fn start(&mut self) {
        for router in &mut self.routers {
            router.start(self.now).unwrap();
        }
        self.settle();
    }

    /// Run timers up to `now + duration`
    pub fn advance(&mut self, duration: Duration) {
        let until = self.now + duration;
        while let Some(Reverse((deadline, _, _, _))) = self.timers.peek() {
            if *deadline > until {
                break;
            }
            let Some(Reverse((deadline, _, router, kind))) = self.timers.pop() else {
                break;
            };
            self.now = self.now.max(deadline);
            self.routers[router].timer_expired(self.now, kind).unwrap();
            self.settle();
        }
        self.now = until;
    }

    pub fn join(&mut self, router: usize, group: Ipv4Addr, interface: u32) {
        let interface = IfIndex(interface);
        self.routers[router].env_mut().join(group, None, interface);
        self.routers[router]
            .local_membership_changed(self.now, group, None, interface, MembershipChange::Join)
            .unwrap();
        self.settle();
    }

    pub fn leave(&mut self, router: usize, group: Ipv4Addr, interface: u32) {
        let interface = IfIndex(interface);
        self.routers[router].env_mut().leave(group, None, interface);
        self.routers[router]
            .local_membership_changed(self.now, group, None, interface, MembershipChange::Leave)
            .unwrap();
        self.settle();
    }

    /// A host on `interface` of `router` sends `packet`
    pub fn send_data(&mut self, router: usize, interface: u32, packet: DataPacket) {
        self.routers[router]
            .forward_data_packet(self.now, packet, IfIndex(interface))
            .unwrap();
        self.settle();
    }

    /// Control messages of `msg_type` sent by `router`
    pub fn sent_by(&self, router: usize, msg_type: u8) -> Vec<&OutgoingPacket> {
        self.sent
            .iter()
            .filter(|(from, p)| *from == router && p.message.msg_type() == msg_type)
            .map(|(_, p)| p)
            .collect()
    }

    /// Data copies that reached `interface` of `router`
    pub fn delivered_on(&self, router: usize, interface: u32) -> usize {
        self.delivered
            .iter()
            .filter(|(r, i, _)| *r == router && *i == IfIndex(interface))
            .count()
    }

    /// Deliver output until every router is quiet
    pub fn settle(&mut self) {
        for _ in 0..10_000 {
            let mut busy = false;
            for index in 0..self.routers.len() {
                let output = self.routers[index].take_output();
                if output.is_empty() {
                    continue;
                }
                busy = true;
                for request in output.timers {
                    self.timers.push(Reverse((
                        self.now + request.delay,
                        self.seq,
                        index,
                        request.kind,
                    )));
                    self.seq += 1;
                }
                for packet in output.packets {
                    self.deliver_control(index, packet);
                }
                for copy in output.forwarded {
                    self.deliver_data(index, copy);
                }
            }
            if !busy {
                return;
            }
        }
        panic!("routers never went quiet");
    }

    fn lan_of(&self, router: usize, interface: IfIndex) -> Option<&Vec<LanMember>> {
        self.lans
            .iter()
            .find(|lan| lan.contains(&LanMember { router, interface }))
    }

    fn interface_address(&self, router: usize, interface: IfIndex) -> Ipv4Addr {
        self.routers[router]
            .interface(interface)
            .map(|i| i.address)
            .expect("known interface")
    }

    fn owner_of(&self, address: Ipv4Addr) -> Option<usize> {
        self.routers
            .iter()
            .position(|r| r.interfaces().any(|i| i.address == address))
    }

    fn deliver_control(&mut self, from: usize, packet: OutgoingPacket) {
        self.sent.push((from, packet.clone()));
        let wire = packet.message.encode();

        match packet.interface {
            Some(interface) if packet.destination.is_multicast() => {
                let source = self.interface_address(from, interface);
                let members: Vec<LanMember> = self
                    .lan_of(from, interface)
                    .map(|lan| lan.iter().copied().filter(|m| m.router != from).collect())
                    .unwrap_or_default();
                for member in members {
                    self.routers[member.router]
                        .receive_control_packet(self.now, member.interface, source, &wire)
                        .unwrap();
                }
            }
            interface => {
                let Some(owner) = self.owner_of(packet.destination) else {
                    return;
                };
                let out = interface
                    .or_else(|| self.routers[from].env().resolve(packet.destination).map(|r| r.interface));
                let Some(out) = out else {
                    return;
                };
                let source = self.interface_address(from, out);
                let arrival = self.routers[owner]
                    .env()
                    .resolve(source)
                    .map(|r| r.interface)
                    .or_else(|| {
                        self.routers[owner]
                            .interfaces()
                            .find(|i| i.address == packet.destination)
                            .map(|i| i.index)
                    });
                if let Some(arrival) = arrival {
                    self.routers[owner]
                        .receive_control_packet(self.now, arrival, source, &wire)
                        .unwrap();
                }
            }
        }
    }

    fn deliver_data(&mut self, from: usize, copy: ForwardedPacket) {
        self.delivered
            .push((from, copy.interface, copy.packet.clone()));
        let members: Vec<LanMember> = self
            .lan_of(from, copy.interface)
            .map(|lan| lan.iter().copied().filter(|m| m.router != from).collect())
            .unwrap_or_default();
        for member in members {
            self.routers[member.router]
                .forward_data_packet(self.now, copy.packet.clone(), member.interface)
                .unwrap();
        }
    }
}
