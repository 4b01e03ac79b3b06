//! Roof motion state machine.
//!
//! Turns open/close/abort requests and periodic limit-switch readings into
//! authoritative motion decisions. The machine never sleeps: the caller
//! supplies `now` to every time-dependent operation and gets back the delay
//! before the next [`MotionStateMachine::poll`].

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::controller::{CommandTargets, RoofLink};
use crate::error::RoofError;
use crate::protocol::Target;
use crate::status::{MotionFlags, RoofStatus, StatusAggregator, SwitchState};
use crate::transport::ByteChannel;

pub const DEFAULT_MOTION_TIMEOUT: Duration = Duration::from_secs(40);
pub const DEFAULT_MOVING_POLL: Duration = Duration::from_secs(1);
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Open,
    Close,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Open => f.write_str("opening"),
            Direction::Close => f.write_str("closing"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionState {
    #[default]
    Idle,
    Opening,
    Closing,
    /// Abort sent; the next poll settles back to `Idle`.
    Aborting,
}

/// Why the last motion ended without reaching its limit switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimedOut {
    #[default]
    None,
    WhileOpening,
    WhileClosing,
}

/// Park status reported to the dome layer. A closed roof is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParkState {
    Parked,
    Unparked,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Command acknowledged, deadline armed.
    Started,
    /// The target limit switch already reads on; nothing sent.
    AlreadyThere,
    /// A motion is already under way; nothing sent.
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    Stopped,
    /// The roof is externally locked; abort is refused.
    RefusedLocked,
    /// The roof rests at a limit switch; nothing sent.
    Stationary,
}

/// Terminal motion events surfaced by [`MotionStateMachine::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionEvent {
    Opened,
    Closed,
    TimedOut(Direction),
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionTiming {
    pub timeout: Duration,
    pub moving_poll: Duration,
    pub idle_poll: Duration,
}

impl Default for MotionTiming {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_MOTION_TIMEOUT,
            moving_poll: DEFAULT_MOVING_POLL,
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }
}

/// Result of one poll step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    /// Delay before the next poll: short while moving, long while idle.
    pub next_delay: Duration,
    /// The consecutive-error threshold was breached; the session must be
    /// torn down and re-established.
    pub reconnect: bool,
    pub event: Option<MotionEvent>,
    pub status: RoofStatus,
}

#[derive(Debug, Clone)]
pub struct MotionStateMachine {
    state: MotionState,
    deadline: Option<Instant>,
    timed_out: TimedOut,
    park: ParkState,
    commands: CommandTargets,
    timing: MotionTiming,
}

impl MotionStateMachine {
    pub fn new(commands: CommandTargets, timing: MotionTiming) -> Self {
        Self {
            state: MotionState::Idle,
            deadline: None,
            timed_out: TimedOut::None,
            park: ParkState::Unknown,
            commands,
            timing,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn timed_out(&self) -> TimedOut {
        self.timed_out
    }

    pub fn park_state(&self) -> ParkState {
        self.park
    }

    pub fn timing(&self) -> MotionTiming {
        self.timing
    }

    pub fn flags(&self) -> MotionFlags {
        MotionFlags {
            opening: self.state == MotionState::Opening,
            closing: self.state == MotionState::Closing,
        }
    }

    pub fn is_moving(&self) -> bool {
        self.flags().moving()
    }

    pub async fn request_open<C: ByteChannel>(
        &mut self,
        link: &mut RoofLink<C>,
        status: &mut StatusAggregator,
        now: Instant,
    ) -> Result<MoveOutcome, RoofError> {
        let switches = status.refresh(link).await;
        if switches.locked {
            tracing::warn!("Roof is externally locked, no movement possible");
            return Err(RoofError::LockEngaged);
        }
        if switches.opened {
            tracing::warn!("Open requested but roof is already fully opened");
            self.park = ParkState::Unparked;
            return Ok(MoveOutcome::AlreadyThere);
        }
        if let Some(outcome) = self.in_progress() {
            return Ok(outcome);
        }
        self.start(link, status, Direction::Open, now).await
    }

    /// Like [`request_open`](Self::request_open), but also refuses while the
    /// mount reports it is still parking or locking.
    pub async fn request_close<C: ByteChannel>(
        &mut self,
        link: &mut RoofLink<C>,
        status: &mut StatusAggregator,
        now: Instant,
        mount_locking: bool,
    ) -> Result<MoveOutcome, RoofError> {
        let switches = status.refresh(link).await;
        if switches.locked {
            tracing::warn!("Roof is externally locked, no movement possible");
            return Err(RoofError::LockEngaged);
        }
        if switches.closed {
            tracing::warn!("Close requested but roof is already fully closed");
            self.park = ParkState::Parked;
            return Ok(MoveOutcome::AlreadyThere);
        }
        if let Some(outcome) = self.in_progress() {
            return Ok(outcome);
        }
        if mount_locking {
            tracing::warn!("Cannot close roof when mount is locking, check the telescope parking policy");
            return Err(RoofError::MountLocking);
        }
        self.start(link, status, Direction::Close, now).await
    }

    pub async fn abort<C: ByteChannel>(
        &mut self,
        link: &mut RoofLink<C>,
        status: &mut StatusAggregator,
    ) -> Result<AbortOutcome, RoofError> {
        let switches = status.refresh(link).await;
        if switches.locked {
            tracing::warn!("Roof is externally locked, no action taken on abort request");
            return Ok(AbortOutcome::RefusedLocked);
        }
        if switches.closed {
            tracing::warn!("Roof appears to be closed and stationary, no action taken on abort request");
            return Ok(AbortOutcome::Stationary);
        }
        if switches.opened {
            tracing::warn!("Roof appears to be open and stationary, no action taken on abort request");
            return Ok(AbortOutcome::Stationary);
        }

        let moving = self.is_moving();
        if moving {
            tracing::warn!(
                "Abort requested while the roof was {}. Direction correction may be needed on the next move request.",
                if self.state == MotionState::Opening { "opening" } else { "closing" }
            );
        } else {
            tracing::warn!("Roof appears to be partially open and stationary, sending abort");
        }

        // Nothing changes unless the controller accepted the abort.
        let abort = self.commands.abort.clone();
        push_unless_locked(link, status, &abort).await?;

        if moving {
            self.state = MotionState::Aborting;
        }
        self.deadline = None;
        // Between the limits the roof is neither parked nor unparked.
        self.park = ParkState::Unknown;
        Ok(AbortOutcome::Stopped)
    }

    /// One periodic evaluation step.
    pub async fn poll<C: ByteChannel>(
        &mut self,
        link: &mut RoofLink<C>,
        status: &mut StatusAggregator,
        now: Instant,
    ) -> PollReport {
        let switches = status.refresh(link).await;
        let mut next_delay = self.timing.idle_poll;
        let mut event = None;

        match self.state {
            MotionState::Aborting => {
                tracing::warn!("Roof motion is stopped");
                self.state = MotionState::Idle;
                event = Some(MotionEvent::Stopped);
            }
            MotionState::Opening => {
                if switches.opened {
                    tracing::info!("Roof is open");
                    self.finish(ParkState::Unparked);
                    event = Some(MotionEvent::Opened);
                } else if self.expired(now) {
                    tracing::warn!("Time allowed for opening the roof has expired");
                    self.finish(ParkState::Unparked);
                    self.timed_out = TimedOut::WhileOpening;
                    event = Some(MotionEvent::TimedOut(Direction::Open));
                } else {
                    next_delay = self.timing.moving_poll;
                }
            }
            MotionState::Closing => {
                if switches.closed {
                    tracing::info!("Roof is closed");
                    self.finish(ParkState::Parked);
                    event = Some(MotionEvent::Closed);
                } else if self.expired(now) {
                    tracing::warn!("Time allowed for closing the roof has expired");
                    self.finish(ParkState::Unparked);
                    self.timed_out = TimedOut::WhileClosing;
                    event = Some(MotionEvent::TimedOut(Direction::Close));
                } else {
                    next_delay = self.timing.moving_poll;
                }
            }
            MotionState::Idle => self.reconcile(switches),
        }

        let roof = status.evaluate(self.flags(), self.timed_out);
        let reconnect = link.errors().should_reconnect();
        if reconnect {
            tracing::error!("Too many errors communicating with the roof controller");
        }
        PollReport {
            next_delay,
            reconnect,
            event,
            status: roof,
        }
    }

    fn in_progress(&self) -> Option<MoveOutcome> {
        match self.state {
            MotionState::Opening => {
                tracing::warn!("Roof is in process of opening, wait for completion.");
                Some(MoveOutcome::InProgress)
            }
            MotionState::Closing => {
                tracing::warn!("Roof is in process of closing, wait for completion.");
                Some(MoveOutcome::InProgress)
            }
            _ => None,
        }
    }

    async fn start<C: ByteChannel>(
        &mut self,
        link: &mut RoofLink<C>,
        status: &mut StatusAggregator,
        direction: Direction,
        now: Instant,
    ) -> Result<MoveOutcome, RoofError> {
        let button = match direction {
            Direction::Open => self.commands.open.clone(),
            Direction::Close => self.commands.close.clone(),
        };
        if let Err(e) = push_unless_locked(link, status, &button).await {
            tracing::warn!("Failed to operate controller for {} the roof: {}", direction, e);
            return Err(e);
        }
        self.state = match direction {
            Direction::Open => MotionState::Opening,
            Direction::Close => MotionState::Closing,
        };
        self.timed_out = TimedOut::None;
        self.deadline = Some(now + self.timing.timeout);
        tracing::info!("Roof is {}...", direction);
        tracing::debug!("Roof motion timeout setting: {:?}", self.timing.timeout);
        Ok(MoveOutcome::Started)
    }

    fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    fn finish(&mut self, park: ParkState) {
        self.state = MotionState::Idle;
        self.deadline = None;
        self.park = park;
    }

    /// Brings the park state in line with the limit switches; the roof may
    /// have been moved by hand or by a remote control.
    fn reconcile(&mut self, switches: SwitchState) {
        match self.park {
            ParkState::Parked if switches.opened => {
                tracing::info!("Roof opened outside of this controller, marking unparked");
                self.park = ParkState::Unparked;
            }
            ParkState::Parked if !switches.closed => {
                tracing::warn!("Roof indicates it is parked but the closed switch is not set, manual intervention needed");
            }
            ParkState::Unparked if switches.closed => {
                tracing::info!("Roof closed outside of this controller, marking parked");
                self.park = ParkState::Parked;
            }
            ParkState::Unparked if !switches.opened => {
                tracing::warn!("Roof indicates it is unparked but the opened switch is not set, manual intervention needed");
            }
            ParkState::Unknown if switches.closed && !switches.opened => self.park = ParkState::Parked,
            ParkState::Unknown if switches.opened && !switches.closed => self.park = ParkState::Unparked,
            _ => {}
        }
    }
}

/// Pushes a motion button after confirming the roof has not been locked
/// since the last status read. An unreadable lock switch also refuses.
async fn push_unless_locked<C: ByteChannel>(
    link: &mut RoofLink<C>,
    status: &StatusAggregator,
    button: &Target,
) -> Result<(), RoofError> {
    if link.read_switch(&status.targets().locked).await? {
        tracing::warn!("Roof external lock state prevents roof movement");
        return Err(RoofError::LockEngaged);
    }
    link.push_button(button, true).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::SwitchTargets;
    use crate::error::RoofError;
    use crate::simulator::{RoofPosition, SimulatedController};
    use crate::status::{Light, RoofCondition};
    use crate::transport::Transport;
    use tokio_test::{assert_err, assert_ok};

    const TRAVEL: Duration = Duration::from_secs(10);

    struct Rig {
        link: RoofLink<SimulatedController>,
        status: StatusAggregator,
        motion: MotionStateMachine,
    }

    impl Rig {
        async fn new(sim: SimulatedController) -> Self {
            let mut link = RoofLink::with_press_delay(Transport::new(sim), Duration::ZERO);
            link.initial_contact().await.unwrap();
            let switches = SwitchTargets::new("OPENED", "CLOSED", "LOCKED", "AUXSTATE").unwrap();
            let commands = CommandTargets::new("OPEN", "CLOSE", "ABORT", "LOCK", "AUXSET").unwrap();
            Self {
                link,
                status: StatusAggregator::new(switches),
                motion: MotionStateMachine::new(commands, MotionTiming::default()),
            }
        }

        fn sim(&mut self) -> &mut SimulatedController {
            self.link.transport_mut().channel_mut()
        }

        async fn open(&mut self) -> Result<MoveOutcome, RoofError> {
            self.motion.request_open(&mut self.link, &mut self.status, Instant::now()).await
        }

        async fn close(&mut self, mount_locking: bool) -> Result<MoveOutcome, RoofError> {
            self.motion
                .request_close(&mut self.link, &mut self.status, Instant::now(), mount_locking)
                .await
        }

        async fn abort(&mut self) -> Result<AbortOutcome, RoofError> {
            self.motion.abort(&mut self.link, &mut self.status).await
        }

        async fn poll(&mut self) -> PollReport {
            self.motion.poll(&mut self.link, &mut self.status, Instant::now()).await
        }
    }

    fn sim() -> SimulatedController {
        SimulatedController::new("V1.3-0", 0, TRAVEL)
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_runs_to_the_limit_switch() {
        let mut rig = Rig::new(sim()).await;
        assert_eq!(assert_ok!(rig.open().await), MoveOutcome::Started);
        assert_eq!(rig.motion.state(), MotionState::Opening);
        assert!(rig.motion.deadline().is_some());

        let report = rig.poll().await;
        assert_eq!(report.event, None);
        assert_eq!(report.next_delay, DEFAULT_MOVING_POLL);
        assert_eq!(report.status.condition, RoofCondition::Opening);

        tokio::time::advance(TRAVEL).await;
        let report = rig.poll().await;
        assert_eq!(report.event, Some(MotionEvent::Opened));
        assert_eq!(report.next_delay, DEFAULT_IDLE_POLL);
        assert_eq!(report.status.condition, RoofCondition::Opened);
        assert_eq!(rig.motion.state(), MotionState::Idle);
        assert_eq!(rig.motion.park_state(), ParkState::Unparked);
        assert_eq!(rig.motion.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_parks_the_roof() {
        let mut s = sim();
        s.place(RoofPosition::Opened);
        let mut rig = Rig::new(s).await;
        assert_eq!(assert_ok!(rig.close(false).await), MoveOutcome::Started);
        tokio::time::advance(TRAVEL).await;
        let report = rig.poll().await;
        assert_eq!(report.event, Some(MotionEvent::Closed));
        assert_eq!(rig.motion.park_state(), ParkState::Parked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_open_times_out() {
        let mut s = sim();
        s.set_stalled(true);
        let mut rig = Rig::new(s).await;
        assert_ok!(rig.open().await);

        tokio::time::advance(DEFAULT_MOTION_TIMEOUT - Duration::from_secs(1)).await;
        assert_eq!(rig.poll().await.event, None);

        tokio::time::advance(Duration::from_secs(1)).await;
        let report = rig.poll().await;
        assert_eq!(report.event, Some(MotionEvent::TimedOut(Direction::Open)));
        assert_eq!(rig.motion.state(), MotionState::Idle);
        assert_eq!(rig.motion.timed_out(), TimedOut::WhileOpening);
        assert_eq!(rig.motion.park_state(), ParkState::Unparked);
        assert_eq!(report.status.condition, RoofCondition::Stationary);
        assert_eq!(report.status.lights.opened, Light::Alert);
        assert!(report.status.is_alert());
    }

    #[tokio::test]
    async fn test_lock_refuses_every_request_without_actuating() {
        let mut s = SimulatedController::new("V1", 0, Duration::ZERO);
        s.set_locked(true);
        let mut rig = Rig::new(s).await;

        assert!(matches!(assert_err!(rig.open().await), RoofError::LockEngaged));
        assert!(matches!(assert_err!(rig.close(false).await), RoofError::LockEngaged));
        assert_eq!(assert_ok!(rig.abort().await), AbortOutcome::RefusedLocked);
        assert_eq!(rig.sim().actuations(), 0);
        assert_eq!(rig.motion.state(), MotionState::Idle);
    }

    #[tokio::test]
    async fn test_lock_wins_over_already_closed() {
        // Closed and locked: the lock is reported, not the limit switch.
        let mut s = SimulatedController::new("V1", 0, Duration::ZERO);
        s.set_locked(true);
        let mut rig = Rig::new(s).await;
        assert!(matches!(assert_err!(rig.close(false).await), RoofError::LockEngaged));
    }

    #[tokio::test]
    async fn test_request_at_limit_is_a_no_op() {
        let mut rig = Rig::new(SimulatedController::new("V1", 0, Duration::ZERO)).await;
        assert_eq!(assert_ok!(rig.close(false).await), MoveOutcome::AlreadyThere);
        assert_eq!(rig.motion.park_state(), ParkState::Parked);
        assert_eq!(rig.sim().actuations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_request_while_moving() {
        let mut rig = Rig::new(sim()).await;
        assert_eq!(assert_ok!(rig.open().await), MoveOutcome::Started);
        assert_eq!(assert_ok!(rig.open().await), MoveOutcome::InProgress);
        assert_eq!(assert_ok!(rig.close(false).await), MoveOutcome::InProgress);
        assert_eq!(rig.sim().actuations(), 1);
    }

    #[tokio::test]
    async fn test_close_refused_while_mount_locking() {
        let mut s = SimulatedController::new("V1", 0, Duration::ZERO);
        s.place(RoofPosition::Opened);
        let mut rig = Rig::new(s).await;
        assert!(matches!(assert_err!(rig.close(true).await), RoofError::MountLocking));
        assert_eq!(rig.sim().actuations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_opening() {
        let mut rig = Rig::new(sim()).await;
        assert_ok!(rig.open().await);
        assert_eq!(assert_ok!(rig.abort().await), AbortOutcome::Stopped);
        assert_eq!(rig.motion.state(), MotionState::Aborting);
        assert_eq!(rig.motion.park_state(), ParkState::Unknown);
        assert_eq!(rig.sim().position(), RoofPosition::Between);

        let report = rig.poll().await;
        assert_eq!(report.event, Some(MotionEvent::Stopped));
        assert_eq!(rig.motion.state(), MotionState::Idle);
        assert_eq!(report.status.condition, RoofCondition::Stationary);
    }

    #[tokio::test]
    async fn test_abort_at_a_limit_sends_nothing() {
        let mut rig = Rig::new(SimulatedController::new("V1", 0, Duration::ZERO)).await;
        assert_eq!(assert_ok!(rig.abort().await), AbortOutcome::Stationary);
        rig.sim().place(RoofPosition::Opened);
        assert_eq!(assert_ok!(rig.abort().await), AbortOutcome::Stationary);
        assert_eq!(rig.sim().actuations(), 0);
    }

    #[tokio::test]
    async fn test_abort_between_limits_while_idle() {
        let mut s = SimulatedController::new("V1", 0, Duration::ZERO);
        s.place(RoofPosition::Between);
        let mut rig = Rig::new(s).await;
        assert_eq!(assert_ok!(rig.abort().await), AbortOutcome::Stopped);
        assert_eq!(rig.motion.state(), MotionState::Idle);
        assert_eq!(rig.motion.park_state(), ParkState::Unknown);
        assert_eq!(rig.sim().actuations(), 1);
    }

    #[tokio::test]
    async fn test_idle_poll_reconciles_park_state() {
        let mut rig = Rig::new(SimulatedController::new("V1", 0, Duration::ZERO)).await;
        assert_eq!(rig.motion.park_state(), ParkState::Unknown);

        let report = rig.poll().await;
        assert_eq!(report.next_delay, DEFAULT_IDLE_POLL);
        assert_eq!(rig.motion.park_state(), ParkState::Parked);

        rig.sim().place(RoofPosition::Opened);
        rig.poll().await;
        assert_eq!(rig.motion.park_state(), ParkState::Unparked);

        rig.sim().place(RoofPosition::Between);
        rig.poll().await;
        assert_eq!(rig.motion.park_state(), ParkState::Unparked);
    }

    #[tokio::test]
    async fn test_abort_refused_by_lock_recheck_keeps_motion() {
        use crate::transport::IoChannel;
        use tokio_test::io::Builder;

        let mut builder = Builder::new();
        builder.write(b"(CON:0:0)").read(b"(ACK:0:V1)");
        for target in ["OPENED", "CLOSED", "LOCKED", "AUXSTATE", "LOCKED"] {
            builder
                .write(format!("(GET:{target}:0)").as_bytes())
                .read(format!("(ACK:{target}:OFF)").as_bytes());
        }
        builder.write(b"(SET:OPEN:ON)").read(b"(ACK:OPEN:ON)");
        for target in ["OPENED", "CLOSED", "LOCKED", "AUXSTATE"] {
            builder
                .write(format!("(GET:{target}:0)").as_bytes())
                .read(format!("(ACK:{target}:OFF)").as_bytes());
        }
        // Locked between the status read and the abort push.
        builder.write(b"(GET:LOCKED:0)").read(b"(ACK:LOCKED:ON)");

        let mut link = RoofLink::with_press_delay(
            Transport::new(IoChannel::new(builder.build())),
            Duration::ZERO,
        );
        link.initial_contact().await.unwrap();
        let mut status =
            StatusAggregator::new(SwitchTargets::new("OPENED", "CLOSED", "LOCKED", "AUXSTATE").unwrap());
        let commands = CommandTargets::new("OPEN", "CLOSE", "ABORT", "LOCK", "AUXSET").unwrap();
        let mut motion = MotionStateMachine::new(commands, MotionTiming::default());

        let outcome = motion.request_open(&mut link, &mut status, Instant::now()).await;
        assert_eq!(assert_ok!(outcome), MoveOutcome::Started);
        let deadline = motion.deadline();
        let park = motion.park_state();

        let err = assert_err!(motion.abort(&mut link, &mut status).await);
        assert!(matches!(err, RoofError::LockEngaged));
        assert_eq!(motion.state(), MotionState::Opening);
        assert_eq!(motion.deadline(), deadline);
        assert!(motion.deadline().is_some());
        assert_eq!(motion.park_state(), park);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::Open.to_string(), "opening");
        assert_eq!(
            RoofError::MotionTimeout { direction: Direction::Close }.to_string(),
            "Time allowed for closing the roof has expired"
        );
    }
}
