//! In-process stand-in for the roof controller firmware.
//!
//! [`SimulatedController`] sits on the far side of a [`ByteChannel`]: it
//! parses host requests off the line and queues the replies the firmware
//! would send. Roof travel takes a configurable time on the tokio clock, so
//! paused-clock tests can step through a whole open or close.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::protocol::frame::{FrameScanner, ScanStatus};
use crate::protocol::handshake::MAX_ACTIONS;
use crate::protocol::{Command, Value, Verb};
use crate::transport::ByteChannel;

pub const DEFAULT_TRAVEL: Duration = Duration::from_secs(35);
pub const DEFAULT_VERSION: &str = "V1.3-0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoofPosition {
    Opened,
    Closed,
    Between,
}

#[derive(Debug, Clone, Copy)]
struct Travel {
    towards: RoofPosition,
    arrives: Instant,
}

/// Emulated firmware state plus the host-side test hooks.
#[derive(Debug)]
pub struct SimulatedController {
    version: String,
    action_count: usize,
    travel_time: Duration,
    position: RoofPosition,
    travel: Option<Travel>,
    locked: bool,
    aux: bool,
    actions: [bool; MAX_ACTIONS],
    stalled: bool,
    silent: bool,
    scanner: FrameScanner,
    outbound: VecDeque<u8>,
    received: Vec<Command>,
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new(DEFAULT_VERSION, 0, DEFAULT_TRAVEL)
    }
}

impl SimulatedController {
    /// A closed, unlocked roof.
    pub fn new(version: impl Into<String>, action_count: usize, travel_time: Duration) -> Self {
        tracing::info!("Simulated roof controller ready, travel time {:?}", travel_time);
        Self {
            version: version.into(),
            action_count: action_count.min(MAX_ACTIONS),
            travel_time,
            position: RoofPosition::Closed,
            travel: None,
            locked: false,
            aux: false,
            actions: [false; MAX_ACTIONS],
            stalled: false,
            silent: false,
            scanner: FrameScanner::new(),
            outbound: VecDeque::new(),
            received: Vec::new(),
        }
    }

    pub fn position(&mut self) -> RoofPosition {
        self.settle();
        self.position
    }

    /// Moves the roof by hand, cancelling any powered travel.
    pub fn place(&mut self, position: RoofPosition) {
        self.travel = None;
        self.position = position;
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// A stalled roof starts moving but never reaches a limit switch.
    pub fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    /// A silent controller swallows requests and never answers.
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    pub fn aux(&self) -> bool {
        self.aux
    }

    /// Switches an action output by hand, as a front-panel switch would.
    pub fn set_action(&mut self, index: usize, on: bool) {
        if let Some(action) = self.actions.get_mut(index) {
            *action = on;
        }
    }

    pub fn action(&self, index: usize) -> bool {
        self.actions.get(index).copied().unwrap_or(false)
    }

    /// Every request received so far, oldest first.
    pub fn received(&self) -> &[Command] {
        &self.received
    }

    /// Number of `SET` requests received so far.
    pub fn actuations(&self) -> usize {
        self.received.iter().filter(|c| c.verb() == Verb::Set).count()
    }

    fn settle(&mut self) {
        if let Some(travel) = self.travel {
            if !self.stalled && Instant::now() >= travel.arrives {
                self.position = travel.towards;
                self.travel = None;
            }
        }
    }

    fn start_travel(&mut self, towards: RoofPosition) {
        if self.position == towards {
            return;
        }
        self.position = RoofPosition::Between;
        self.travel = Some(Travel {
            towards,
            arrives: Instant::now() + self.travel_time,
        });
    }

    fn handle(&mut self, command: Command) {
        self.settle();
        let target = command.target().as_str().to_string();
        let reply = match command.verb() {
            Verb::Con => {
                if self.action_count > 0 {
                    ack(&target, &format!("{}[ACT{}]", self.version, self.action_count))
                } else {
                    ack(&target, &self.version)
                }
            }
            Verb::Get => match self.switch(&target) {
                Some(on) => ack(&target, Value::from(on).as_str()),
                None => nak(&target, "UNKNOWN"),
            },
            Verb::Set => self.actuate(&target, command.value() == Value::On),
        };
        self.received.push(command);
        if !self.silent {
            self.outbound.extend(reply.into_bytes());
        }
    }

    fn switch(&self, target: &str) -> Option<bool> {
        match target {
            "OPENED" => Some(self.position == RoofPosition::Opened),
            "CLOSED" => Some(self.position == RoofPosition::Closed),
            "LOCKED" => Some(self.locked),
            "AUXSTATE" => Some(self.aux),
            _ => action_number(target, "STATE")
                .filter(|n| *n <= self.action_count)
                .map(|n| self.actions[n - 1]),
        }
    }

    fn actuate(&mut self, target: &str, on: bool) -> String {
        let value = Value::from(on).as_str();
        match target {
            "OPEN" | "CLOSE" if self.locked => return nak(target, "LOCKED"),
            "OPEN" if on => self.start_travel(RoofPosition::Opened),
            "CLOSE" if on => self.start_travel(RoofPosition::Closed),
            "ABORT" if on => {
                if self.travel.take().is_some() {
                    self.position = RoofPosition::Between;
                }
            }
            "OPEN" | "CLOSE" | "ABORT" => {}
            "LOCK" => self.locked = on,
            "AUXSET" => self.aux = on,
            _ => match action_number(target, "CMD").filter(|n| *n <= self.action_count) {
                Some(n) => self.actions[n - 1] = on,
                None => return nak(target, "UNKNOWN"),
            },
        }
        ack(target, value)
    }
}

fn ack(target: &str, value: &str) -> String {
    format!("(ACK:{target}:{value})")
}

fn nak(target: &str, reason: &str) -> String {
    format!("(NAK:{target}:{reason})")
}

/// `ACT3CMD` with suffix `CMD` gives 3.
fn action_number(target: &str, suffix: &str) -> Option<usize> {
    target
        .strip_prefix("ACT")?
        .strip_suffix(suffix)?
        .parse::<usize>()
        .ok()
        .filter(|n| (1..=MAX_ACTIONS).contains(n))
}

#[async_trait]
impl ByteChannel for SimulatedController {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbound.is_empty() {
            // Nothing to say: the host's byte timeout decides what happens.
            return std::future::pending().await;
        }
        let mut n = 0;
        while n < buf.len() {
            match self.outbound.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        for &byte in buf {
            match self.scanner.push(byte) {
                ScanStatus::Incomplete => {}
                ScanStatus::Complete => {
                    match Command::decode(self.scanner.frame()) {
                        Ok(command) => self.handle(command),
                        Err(e) => tracing::warn!("Simulated controller ignored request: {}", e),
                    }
                    self.scanner.reset();
                }
                ScanStatus::Malformed => {
                    tracing::warn!("Simulated controller ignored garbage {:?}", self.scanner.raw());
                    self.scanner.reset();
                }
            }
        }
        Ok(())
    }

    async fn discard_buffers(&mut self) -> io::Result<()> {
        self.outbound.clear();
        self.scanner.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use crate::protocol::{decode, Target};

    async fn exchange(transport: &mut Transport<SimulatedController>, command: Command) -> String {
        transport.write(&command.encode().unwrap()).await.unwrap();
        let bytes = transport.read_frame().await.unwrap();
        decode(&bytes).unwrap().to_string()
    }

    fn target(name: &str) -> Target {
        Target::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_contact_reports_version_and_actions() {
        let mut transport = Transport::new(SimulatedController::new("V1.3-0", 3, Duration::ZERO));
        assert_eq!(exchange(&mut transport, Command::contact()).await, "(ACK:0:V1.3-0[ACT3])");

        let mut transport = Transport::new(SimulatedController::new("V2", 0, Duration::ZERO));
        assert_eq!(exchange(&mut transport, Command::contact()).await, "(ACK:0:V2)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_roof_travels_on_the_tokio_clock() {
        let mut transport = Transport::new(SimulatedController::new("V1", 0, Duration::from_secs(10)));
        assert_eq!(
            exchange(&mut transport, Command::actuate(target("OPEN"), true)).await,
            "(ACK:OPEN:ON)"
        );
        assert_eq!(
            exchange(&mut transport, Command::query(target("CLOSED"))).await,
            "(ACK:CLOSED:OFF)"
        );
        assert_eq!(
            exchange(&mut transport, Command::query(target("OPENED"))).await,
            "(ACK:OPENED:OFF)"
        );
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            exchange(&mut transport, Command::query(target("OPENED"))).await,
            "(ACK:OPENED:ON)"
        );
    }

    #[tokio::test]
    async fn test_lock_refuses_motion() {
        let mut sim = SimulatedController::new("V1", 0, Duration::ZERO);
        sim.set_locked(true);
        let mut transport = Transport::new(sim);
        assert_eq!(
            exchange(&mut transport, Command::actuate(target("OPEN"), true)).await,
            "(NAK:OPEN:LOCKED)"
        );
        assert_eq!(transport.channel_mut().position(), RoofPosition::Closed);
    }

    #[tokio::test]
    async fn test_unknown_targets_are_refused() {
        let mut transport = Transport::new(SimulatedController::new("V1", 2, Duration::ZERO));
        assert_eq!(
            exchange(&mut transport, Command::actuate(target("ACT3CMD"), true)).await,
            "(NAK:ACT3CMD:UNKNOWN)"
        );
        assert_eq!(
            exchange(&mut transport, Command::actuate(target("ACT2CMD"), true)).await,
            "(ACK:ACT2CMD:ON)"
        );
        assert_eq!(
            exchange(&mut transport, Command::query(target("ACT2STATE"))).await,
            "(ACK:ACT2STATE:ON)"
        );
        assert_eq!(
            exchange(&mut transport, Command::query(target("DOOR"))).await,
            "(NAK:DOOR:UNKNOWN)"
        );
        assert_eq!(transport.channel().actuations(), 2);
    }

    #[test]
    fn test_action_number() {
        assert_eq!(action_number("ACT3CMD", "CMD"), Some(3));
        assert_eq!(action_number("ACT9CMD", "CMD"), None);
        assert_eq!(action_number("ACT3STATE", "CMD"), None);
    }
}
