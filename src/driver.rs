// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Async driver for one router.
//!
//! The [`RouterDriver`] owns a [`Router`] on a single tokio task. Commands
//! (received packets, membership and route changes) arrive over an mpsc
//! channel; every side effect the router produces is pushed to an output
//! channel. Timer requests are kept in a priority queue and the task sleeps
//! until the earliest one is due, so nothing but this task ever touches the
//! router state.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};

use crate::env::Environment;
use crate::logging::{Facility, Logger};
use crate::packet::DataPacket;
use crate::router::{ForwardedPacket, MembershipChange, OutgoingPacket, PimStats, Router};
use crate::timer::TimerKind;
use crate::{log_debug, log_info, log_warning};
use crate::IfIndex;

/// Input to the driver task
#[derive(Debug)]
pub enum DriverCommand {
    /// Raw PIM message received on an interface
    ControlPacket {
        interface: IfIndex,
        source: Ipv4Addr,
        data: Bytes,
    },
    /// Multicast data packet to route
    Data {
        interface: IfIndex,
        packet: DataPacket,
    },
    Membership {
        group: Ipv4Addr,
        source: Option<Ipv4Addr>,
        interface: IfIndex,
        change: MembershipChange,
    },
    /// The unicast routing table changed
    RouteChanged,
    Stats(oneshot::Sender<PimStats>),
    /// Send goodbye Hellos and stop
    Shutdown,
}

/// Output of the driver task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Control(OutgoingPacket),
    Data(ForwardedPacket),
}

#[derive(Debug, Clone)]
struct ScheduledTimer {
    fire_at: Instant,
    /// Insertion order, breaks ties between equal deadlines
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for ScheduledTimer {}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.fire_at, self.seq).cmp(&(other.fire_at, other.seq))
    }
}

pub struct RouterDriver<E: Environment> {
    router: Router<E>,
    timers: BinaryHeap<Reverse<ScheduledTimer>>,
    next_seq: u64,
    commands: mpsc::Receiver<DriverCommand>,
    events: mpsc::Sender<DriverEvent>,
    logger: Logger,
}

impl<E: Environment> RouterDriver<E> {
    pub fn new(
        router: Router<E>,
        commands: mpsc::Receiver<DriverCommand>,
        events: mpsc::Sender<DriverEvent>,
    ) -> Self {
        let logger = router.logger().clone();
        Self {
            router,
            timers: BinaryHeap::new(),
            next_seq: 0,
            commands,
            events,
            logger,
        }
    }

    /// Build a driver together with its command sender and event receiver
    pub fn channel(
        router: Router<E>,
        capacity: usize,
    ) -> (Self, mpsc::Sender<DriverCommand>, mpsc::Receiver<DriverEvent>) {
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (Self::new(router, command_rx, event_tx), command_tx, event_rx)
    }

    /// Run until `Shutdown` or until the command channel closes. Returns the
    /// router so its final state can be inspected.
    pub async fn run(mut self) -> Result<Router<E>> {
        log_info!(self.logger, Facility::Driver, "PIM: driver started");
        self.router
            .start(Instant::now().into_std())
            .context("starting router")?;
        if !self.flush().await {
            return Ok(self.router);
        }

        loop {
            let deadline = self
                .timers
                .peek()
                .map(|Reverse(t)| t.fire_at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = sleep_until(deadline) => {
                    self.fire_due()?;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(DriverCommand::Shutdown) | None => {
                            log_info!(self.logger, Facility::Driver, "PIM: driver stopping");
                            self.router.stop();
                            self.flush().await;
                            return Ok(self.router);
                        }
                        Some(command) => self.handle(command)?,
                    }
                }
            }
            if !self.flush().await {
                log_warning!(
                    self.logger,
                    Facility::Driver,
                    "PIM: event channel closed, driver exiting"
                );
                return Ok(self.router);
            }
        }
    }

    fn handle(&mut self, command: DriverCommand) -> Result<()> {
        let now = Instant::now().into_std();
        match command {
            DriverCommand::ControlPacket {
                interface,
                source,
                data,
            } => self
                .router
                .receive_control_packet(now, interface, source, &data)
                .with_context(|| format!("control packet from {} on {}", source, interface)),
            DriverCommand::Data { interface, packet } => self
                .router
                .forward_data_packet(now, packet, interface)
                .with_context(|| format!("data packet on {}", interface)),
            DriverCommand::Membership {
                group,
                source,
                interface,
                change,
            } => self
                .router
                .local_membership_changed(now, group, source, interface, change)
                .with_context(|| format!("membership change for {} on {}", group, interface)),
            DriverCommand::RouteChanged => self
                .router
                .unicast_route_changed(now)
                .context("unicast route change"),
            DriverCommand::Stats(reply) => {
                let _ = reply.send(self.router.stats().clone());
                Ok(())
            }
            DriverCommand::Shutdown => Ok(()),
        }
    }

    /// Fire every timer whose deadline has passed
    fn fire_due(&mut self) -> Result<()> {
        let now = Instant::now();
        while self.timers.peek().is_some_and(|Reverse(t)| t.fire_at <= now) {
            let Some(Reverse(timer)) = self.timers.pop() else {
                break;
            };
            log_debug!(
                self.logger,
                Facility::Timer,
                &format!("PIM: timer fired {:?}", timer.kind)
            );
            self.router
                .timer_expired(now.into_std(), timer.kind)
                .with_context(|| format!("timer {:?}", timer.kind))?;
        }
        Ok(())
    }

    /// Queue timer requests and push packets out. False once the event
    /// receiver is gone.
    async fn flush(&mut self) -> bool {
        let output = self.router.take_output();
        let now = Instant::now();
        for request in output.timers {
            self.timers.push(Reverse(ScheduledTimer {
                fire_at: now + request.delay,
                seq: self.next_seq,
                kind: request.kind,
            }));
            self.next_seq += 1;
        }
        let events = output
            .packets
            .into_iter()
            .map(DriverEvent::Control)
            .chain(output.forwarded.into_iter().map(DriverEvent::Data));
        for event in events {
            if self.events.send(event).await.is_err() {
                return false;
            }
        }
        true
    }
}
