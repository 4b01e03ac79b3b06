//! Composite roof status.
//!
//! The controller exposes four independent switches. [`evaluate`] folds them,
//! together with the motion in progress, into one condition and a set of
//! indicator lights. Contradictions are reported, never corrected.

use serde::Serialize;

use crate::controller::{RoofLink, SwitchTargets};
use crate::motion::TimedOut;
use crate::protocol::{Response, Target};
use crate::transport::ByteChannel;

/// Latest reading of the four device switches. Overwritten on every poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwitchState {
    pub opened: bool,
    pub closed: bool,
    pub locked: bool,
    pub aux: bool,
}

impl SwitchState {
    /// Either limit switch reports a definite position.
    pub fn at_limit(&self) -> bool {
        self.opened || self.closed
    }
}

/// Motion in progress, as seen by the status evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionFlags {
    pub opening: bool,
    pub closing: bool,
}

impl MotionFlags {
    pub fn moving(&self) -> bool {
        self.opening || self.closing
    }
}

/// Indicator severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Light {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoofCondition {
    /// Locked and closed: the normal stowed state.
    LockedClosed,
    /// Locked while open. Unusual, but the controller may lock for other reasons.
    LockedOpened,
    /// Locked while a motion is in progress. Should never happen.
    LockedMoving,
    /// Locked, stationary, between the limits.
    LockedPartial,
    Opened,
    Closed,
    Opening,
    Closing,
    /// Stationary with neither limit switch on.
    Stationary,
    /// Both limit switches on at once.
    Contradiction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusLights {
    pub opened: Light,
    pub closed: Light,
    pub moving: Light,
    pub locked: Light,
    pub aux: Light,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoofStatus {
    pub condition: RoofCondition,
    pub summary: Light,
    pub lights: StatusLights,
    pub switches: SwitchState,
    pub timed_out: TimedOut,
}

impl RoofStatus {
    pub fn is_alert(&self) -> bool {
        self.summary == Light::Alert
    }
}

/// Folds switch readings and motion flags into a [`RoofStatus`].
pub fn evaluate(switches: SwitchState, motion: MotionFlags, timed_out: TimedOut) -> RoofStatus {
    let mut lights = StatusLights::default();
    if switches.aux {
        lights.aux = Light::Ok;
    }

    let (condition, summary) = if switches.locked {
        lights.locked = Light::Alert;
        if switches.closed {
            lights.closed = Light::Ok;
            (RoofCondition::LockedClosed, Light::Ok)
        } else if switches.opened {
            lights.opened = Light::Ok;
            (RoofCondition::LockedOpened, Light::Ok)
        } else if motion.moving() {
            lights.moving = Light::Alert;
            (RoofCondition::LockedMoving, Light::Alert)
        } else {
            (RoofCondition::LockedPartial, Light::Idle)
        }
    } else if switches.opened && switches.closed {
        (RoofCondition::Contradiction, Light::Idle)
    } else if switches.opened {
        lights.opened = Light::Ok;
        (RoofCondition::Opened, Light::Ok)
    } else if switches.closed {
        lights.closed = Light::Ok;
        (RoofCondition::Closed, Light::Ok)
    } else if motion.opening {
        lights.opened = Light::Busy;
        lights.moving = Light::Busy;
        (RoofCondition::Opening, Light::Busy)
    } else if motion.closing {
        lights.closed = Light::Busy;
        lights.moving = Light::Busy;
        (RoofCondition::Closing, Light::Busy)
    } else {
        match timed_out {
            TimedOut::WhileOpening => lights.opened = Light::Alert,
            TimedOut::WhileClosing => lights.closed = Light::Alert,
            TimedOut::None => {}
        }
        (RoofCondition::Stationary, Light::Alert)
    };

    RoofStatus {
        condition,
        summary,
        lights,
        switches,
        timed_out,
    }
}

/// Reads the device switches and keeps the latest composite status.
#[derive(Debug, Clone)]
pub struct StatusAggregator {
    targets: SwitchTargets,
    switches: SwitchState,
    last: Option<RoofStatus>,
}

impl StatusAggregator {
    pub fn new(targets: SwitchTargets) -> Self {
        Self {
            targets,
            switches: SwitchState::default(),
            last: None,
        }
    }

    pub fn targets(&self) -> &SwitchTargets {
        &self.targets
    }

    pub fn switches(&self) -> SwitchState {
        self.switches
    }

    pub fn last(&self) -> Option<&RoofStatus> {
        self.last.as_ref()
    }

    /// Re-reads all four switches. A switch that cannot be read counts as off.
    pub async fn refresh<C: ByteChannel>(&mut self, link: &mut RoofLink<C>) -> SwitchState {
        let targets = &self.targets;
        let state = SwitchState {
            opened: read_or_off(link, &targets.opened, "opened").await,
            closed: read_or_off(link, &targets.closed, "closed").await,
            locked: read_or_off(link, &targets.locked, "externally locked").await,
            aux: read_or_off(link, &targets.aux, "auxiliary").await,
        };
        self.switches = state;
        state
    }

    /// Evaluates the current switches against the given motion and logs
    /// anything an operator should look at.
    pub fn evaluate(&mut self, motion: MotionFlags, timed_out: TimedOut) -> RoofStatus {
        let switches = self.switches;
        if !switches.at_limit() && !motion.moving() {
            tracing::warn!("Roof stationary, neither opened or closed, adjust to match park state");
        }
        if switches.opened && switches.closed {
            tracing::warn!("Roof showing it is both opened and closed according to the controller");
        }
        let status = evaluate(switches, motion, timed_out);
        self.last = Some(status);
        status
    }
}

async fn read_or_off<C: ByteChannel>(link: &mut RoofLink<C>, target: &Target, what: &str) -> bool {
    match link.read_switch(target).await {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!("Unable to obtain from the controller whether or not the roof is {}: {}", what, e);
            Response::fallback().switch_state()
        }
    }
}
