//! Host-side driver for a roll-off-roof controller reached over a serial line.
//!
//! The controller speaks a small framed text protocol, `(VERB:TARGET:VALUE)`.
//! [`Session`] owns the connection and drives the [`MotionStateMachine`] from
//! limit-switch readings; everything below it is usable on its own.

pub mod actions;
pub mod config;
pub mod controller;
pub mod error;
pub mod monitor;
pub mod motion;
pub mod protocol;
pub mod session;
pub mod simulator;
pub mod status;
pub mod transport;

pub use actions::{ActionRegistry, ActionSlot};
pub use config::{load_config, Config, ConfigError};
pub use controller::{CommandTargets, RoofLink, SwitchTargets};
pub use error::{ProtocolError, RoofError, TransportError};
pub use monitor::ErrorMonitor;
pub use motion::{
    AbortOutcome, Direction, MotionEvent, MotionState, MotionStateMachine, MotionTiming,
    MoveOutcome, ParkState, PollReport, TimedOut,
};
pub use session::{DomeCapability, Session};
pub use simulator::SimulatedController;
pub use status::{evaluate, Light, RoofCondition, RoofStatus, StatusAggregator, SwitchState};
pub use transport::{ByteChannel, IoChannel, SerialChannel, Transport};
