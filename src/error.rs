// src/error.rs - Error taxonomy for the roof controller link
use std::time::Duration;
use thiserror::Error;

use crate::motion::Direction;

/// Failures of the byte channel itself.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Timeout after {0:?} waiting for a byte from the roof controller")]
    Timeout(Duration),
}

/// Frame-level failures: building an outbound frame or validating an inbound one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame too long: {len} bytes exceeds the {max} byte limit")]
    TooLong { len: usize, max: usize },
    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("Received communication protocol not valid: {raw:?}")]
    Malformed { raw: String },
}

#[derive(Debug, Error)]
pub enum RoofError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("Negative response from roof controller for {target}: {reason}")]
    NegativeAck { target: String, reason: String },
    #[error("Roof is externally locked, no movement possible")]
    LockEngaged,
    #[error("Cannot close roof while the mount is locking")]
    MountLocking,
    #[error("Action {slot} is not supported, the controller reports {available} actions")]
    UnknownAction { slot: usize, available: usize },
    #[error("No contact with the roof controller has been established")]
    NotConnected,
    #[error("Time allowed for {direction} the roof has expired")]
    MotionTimeout { direction: Direction },
    #[error("The {0} switch is not enabled in the configuration")]
    Unsupported(&'static str),
}

impl RoofError {
    /// True for failures that count towards the consecutive-error threshold.
    pub fn is_communication_failure(&self) -> bool {
        matches!(self, RoofError::Transport(_) | RoofError::Protocol(_))
    }
}
