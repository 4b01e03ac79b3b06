// src/session.rs - One owned connection to the roof controller
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::actions::ActionRegistry;
use crate::config::Config;
use crate::controller::{CommandTargets, RoofLink};
use crate::error::RoofError;
use crate::motion::{
    AbortOutcome, Direction, MotionEvent, MotionState, MotionStateMachine, MotionTiming,
    MoveOutcome, ParkState, PollReport,
};
use crate::protocol::{ContactInfo, Target};
use crate::status::{RoofStatus, StatusAggregator};
use crate::transport::{ByteChannel, Transport};

/// Wait before the single handshake retry.
pub const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The narrow roof interface offered to a dome or observatory layer.
#[async_trait]
pub trait DomeCapability {
    async fn move_roof(&mut self, direction: Direction) -> Result<MoveOutcome, RoofError>;
    /// Closes the roof.
    async fn park(&mut self) -> Result<MoveOutcome, RoofError>;
    /// Opens the roof.
    async fn unpark(&mut self) -> Result<MoveOutcome, RoofError>;
    async fn abort(&mut self) -> Result<AbortOutcome, RoofError>;
    fn park_state(&self) -> ParkState;
}

/// Owns the link, the action slots, the status view and the motion machine.
/// Constructed once at start-up and driven by [`Session::run`] or by explicit
/// [`Session::poll`] calls.
pub struct Session<C> {
    link: RoofLink<C>,
    actions: ActionRegistry,
    status: StatusAggregator,
    motion: MotionStateMachine,
    commands: CommandTargets,
    timing: MotionTiming,
    labels: Vec<String>,
    enabled: Vec<bool>,
    lock_enabled: bool,
    aux_enabled: bool,
    /// Last lock and auxiliary states sent, `None` until known.
    lock_requested: Option<bool>,
    aux_requested: Option<bool>,
    mount_locking: bool,
    updates: watch::Sender<Option<RoofStatus>>,
}

impl<C: ByteChannel> Session<C> {
    pub fn new(config: &Config, channel: C) -> Result<Self, RoofError> {
        let commands = config.command_targets()?;
        let timing = config.motion_timing();
        let transport = Transport::with_byte_timeout(channel, config.byte_timeout());
        let labels: Vec<String> = config.actions.iter().map(|a| a.label.clone()).collect();
        let enabled = config.action_enabled();
        let (updates, _) = watch::channel(None);

        let mut session = Self {
            link: RoofLink::with_press_delay(transport, config.press_delay()),
            actions: ActionRegistry::new()?,
            status: StatusAggregator::new(config.switch_targets()?),
            motion: MotionStateMachine::new(commands.clone(), timing),
            commands,
            timing,
            labels,
            enabled,
            lock_enabled: config.roof.lock_enabled,
            aux_enabled: config.roof.aux_enabled,
            lock_requested: None,
            aux_requested: None,
            mount_locking: false,
            updates,
        };
        session.actions = session.build_registry()?;
        Ok(session)
    }

    pub fn link(&self) -> &RoofLink<C> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut RoofLink<C> {
        &mut self.link
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn motion(&self) -> &MotionStateMachine {
        &self.motion
    }

    pub fn last_status(&self) -> Option<&RoofStatus> {
        self.status.last()
    }

    /// Status changes published by [`Session::poll`].
    pub fn subscribe(&self) -> watch::Receiver<Option<RoofStatus>> {
        self.updates.subscribe()
    }

    /// Set by the collaborator while the mount is still parking; closing the
    /// roof is refused meanwhile.
    pub fn set_mount_locking(&mut self, locking: bool) {
        self.mount_locking = locking;
    }

    /// Initial handshake, retried once after [`HANDSHAKE_RETRY_DELAY`].
    pub async fn connect(&mut self) -> Result<ContactInfo, RoofError> {
        let info = match self.link.initial_contact().await {
            Ok(info) => info,
            Err(first) => {
                tracing::warn!("Initial contact with the roof controller failed, retrying: {}", first);
                sleep(HANDSHAKE_RETRY_DELAY).await;
                match self.link.initial_contact().await {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::error!("Unable to establish contact with the roof controller: {}", e);
                        return Err(e);
                    }
                }
            }
        };
        self.actions.set_available(info.action_count);
        tracing::info!("Roof controller version {} connected", info.version);
        Ok(info)
    }

    /// Tears everything down to its initial state and redoes the handshake.
    pub async fn reset_and_reconnect(&mut self) -> Result<ContactInfo, RoofError> {
        tracing::error!(
            "Resetting roof controller session after {} consecutive communication errors",
            self.link.errors().consecutive()
        );
        self.link.reset();
        self.actions = self.build_registry()?;
        self.motion = MotionStateMachine::new(self.commands.clone(), self.timing);
        self.lock_requested = None;
        self.aux_requested = None;
        self.connect().await
    }

    /// One poll step: motion and switches, then the action slots.
    pub async fn poll(&mut self, now: Instant) -> PollReport {
        let mut report = self.motion.poll(&mut self.link, &mut self.status, now).await;
        self.actions.refresh(&mut self.link).await;
        report.reconnect = self.link.errors().should_reconnect();
        if let Some(event) = report.event {
            tracing::debug!("Roof motion event: {:?}", event);
        }
        self.updates.send_if_modified(|current| {
            if *current == Some(report.status) {
                return false;
            }
            *current = Some(report.status);
            true
        });
        report
    }

    /// Polls on the cadence the motion machine asks for until `shutdown`
    /// completes. Connects first, and resets the session whenever the error
    /// threshold is breached.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), RoofError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let delay = if self.link.is_connected() {
                let report = self.poll(Instant::now()).await;
                if report.reconnect {
                    if let Err(e) = self.reset_and_reconnect().await {
                        tracing::warn!("Roof controller reconnect failed: {}", e);
                    }
                }
                report.next_delay
            } else {
                match self.connect().await {
                    Ok(_) => Duration::ZERO,
                    Err(_) => self.timing.idle_poll,
                }
            };

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Roof monitor stopping");
                    return Ok(());
                }
                _ = sleep(delay) => {}
            }
        }
    }

    pub async fn open(&mut self) -> Result<MoveOutcome, RoofError> {
        self.motion
            .request_open(&mut self.link, &mut self.status, Instant::now())
            .await
    }

    pub async fn close(&mut self) -> Result<MoveOutcome, RoofError> {
        self.motion
            .request_close(&mut self.link, &mut self.status, Instant::now(), self.mount_locking)
            .await
    }

    /// Polls until the motion in progress ends. Returns `None` when nothing
    /// was moving; a timeout surfaces as [`RoofError::MotionTimeout`].
    pub async fn wait_for_motion(&mut self) -> Result<Option<MotionEvent>, RoofError> {
        loop {
            if !self.motion.is_moving() && self.motion.state() != MotionState::Aborting {
                return Ok(None);
            }
            let report = self.poll(Instant::now()).await;
            match report.event {
                Some(MotionEvent::TimedOut(direction)) => {
                    return Err(RoofError::MotionTimeout { direction });
                }
                Some(event) => return Ok(Some(event)),
                None => sleep(report.next_delay).await,
            }
        }
    }

    /// Refreshes the switches and evaluates them without advancing motion.
    pub async fn status(&mut self) -> RoofStatus {
        self.status.refresh(&mut self.link).await;
        self.status.evaluate(self.motion.flags(), self.motion.timed_out())
    }

    /// Engages or releases the roof lock. Returns `false` when the requested
    /// state is already held and nothing was sent. Until a state has been
    /// sent, the held state is read back from the lock switch.
    pub async fn set_lock(&mut self, on: bool) -> Result<bool, RoofError> {
        if !self.lock_enabled {
            return Err(RoofError::Unsupported("lock"));
        }
        let switch = self.status.targets().locked.clone();
        if self.held_state(self.lock_requested, &switch, "lock").await == Some(on) {
            tracing::debug!("Roof lock already {}", if on { "engaged" } else { "released" });
            self.lock_requested = Some(on);
            return Ok(false);
        }
        self.link.push_button(&self.commands.lock, on).await?;
        self.lock_requested = Some(on);
        tracing::info!("Roof lock {}", if on { "engaged" } else { "released" });
        Ok(true)
    }

    /// Switches the auxiliary output. Same no-op rule as [`Session::set_lock`].
    pub async fn set_aux(&mut self, on: bool) -> Result<bool, RoofError> {
        if !self.aux_enabled {
            return Err(RoofError::Unsupported("auxiliary"));
        }
        let switch = self.status.targets().aux.clone();
        if self.held_state(self.aux_requested, &switch, "auxiliary").await == Some(on) {
            tracing::debug!("Auxiliary switch already {}", if on { "on" } else { "off" });
            self.aux_requested = Some(on);
            return Ok(false);
        }
        self.link.push_button(&self.commands.aux, on).await?;
        self.aux_requested = Some(on);
        tracing::info!("Auxiliary switch {}", if on { "on" } else { "off" });
        Ok(true)
    }

    pub async fn set_action(&mut self, slot: usize, on: bool) -> Result<bool, RoofError> {
        self.actions.set(&mut self.link, slot, on).await
    }

    /// The state last sent, or what the device switch reports when nothing
    /// has been sent yet. `None` when neither is known.
    async fn held_state(&mut self, requested: Option<bool>, switch: &Target, what: &str) -> Option<bool> {
        if requested.is_some() {
            return requested;
        }
        match self.link.read_switch(switch).await {
            Ok(on) => Some(on),
            Err(e) => {
                tracing::warn!("Unable to read the {} switch, sending anyway: {}", what, e);
                None
            }
        }
    }

    fn build_registry(&self) -> Result<ActionRegistry, RoofError> {
        let mut registry = ActionRegistry::new()?;
        registry.configure(&self.labels);
        registry.restore_enabled(&self.enabled);
        Ok(registry)
    }
}

#[async_trait]
impl<C: ByteChannel> DomeCapability for Session<C> {
    async fn move_roof(&mut self, direction: Direction) -> Result<MoveOutcome, RoofError> {
        match direction {
            Direction::Open => self.open().await,
            Direction::Close => self.close().await,
        }
    }

    async fn park(&mut self) -> Result<MoveOutcome, RoofError> {
        self.close().await
    }

    async fn unpark(&mut self) -> Result<MoveOutcome, RoofError> {
        self.open().await
    }

    async fn abort(&mut self) -> Result<AbortOutcome, RoofError> {
        self.motion.abort(&mut self.link, &mut self.status).await
    }

    fn park_state(&self) -> ParkState {
        self.motion.park_state()
    }
}

impl<C> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("link", &self.link)
            .field("actions", &self.actions)
            .field("motion", &self.motion)
            .field("mount_locking", &self.mount_locking)
            .finish()
    }
}
