// src/controller.rs - Command/response link to the roof controller
use std::time::Duration;

use tokio::time::sleep;

use crate::error::{ProtocolError, RoofError};
use crate::monitor::ErrorMonitor;
use crate::protocol::{decode, Command, ContactInfo, Response, Target};
use crate::transport::{ByteChannel, Transport, TransportStats};

/// Wait between pushing a button and reading the controller's reply.
pub const DEFAULT_PRESS_DELAY: Duration = Duration::from_millis(1000);

/// Device-side identifiers of the four status switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTargets {
    pub opened: Target,
    pub closed: Target,
    pub locked: Target,
    pub aux: Target,
}

impl SwitchTargets {
    pub fn new(opened: &str, closed: &str, locked: &str, aux: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            opened: Target::new(opened)?,
            closed: Target::new(closed)?,
            locked: Target::new(locked)?,
            aux: Target::new(aux)?,
        })
    }
}

/// Device-side identifiers of the core buttons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTargets {
    pub open: Target,
    pub close: Target,
    pub abort: Target,
    pub lock: Target,
    pub aux: Target,
}

impl CommandTargets {
    pub fn new(open: &str, close: &str, abort: &str, lock: &str, aux: &str) -> Result<Self, ProtocolError> {
        Ok(Self {
            open: Target::new(open)?,
            close: Target::new(close)?,
            abort: Target::new(abort)?,
            lock: Target::new(lock)?,
            aux: Target::new(aux)?,
        })
    }
}

/// Owns the transport and the consecutive-error count. Every round-trip goes
/// through here so that failures are always counted exactly once.
pub struct RoofLink<C> {
    transport: Transport<C>,
    errors: ErrorMonitor,
    contact: Option<ContactInfo>,
    press_delay: Duration,
}

impl<C: ByteChannel> RoofLink<C> {
    pub fn new(transport: Transport<C>) -> Self {
        Self::with_press_delay(transport, DEFAULT_PRESS_DELAY)
    }

    pub fn with_press_delay(transport: Transport<C>, press_delay: Duration) -> Self {
        Self {
            transport,
            errors: ErrorMonitor::new(),
            contact: None,
            press_delay,
        }
    }

    pub fn errors(&self) -> &ErrorMonitor {
        &self.errors
    }

    pub fn stats(&self) -> &TransportStats {
        self.transport.stats()
    }

    pub fn transport_mut(&mut self) -> &mut Transport<C> {
        &mut self.transport
    }

    pub fn contact(&self) -> Option<&ContactInfo> {
        self.contact.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.contact.is_some()
    }

    /// Actions the controller declared during the handshake.
    pub fn action_count(&self) -> usize {
        self.contact.as_ref().map_or(0, |c| c.action_count)
    }

    /// Forgets the handshake and clears the error count.
    pub fn reset(&mut self) {
        self.contact = None;
        self.errors.reset();
    }

    /// Sends `(CON:0:0)` and records what the controller reports.
    pub async fn initial_contact(&mut self) -> Result<ContactInfo, RoofError> {
        self.contact = None;
        let response = self.round_trip(&Command::contact(), None).await?;
        let info = ContactInfo::from_response(response)?;
        if info.action_count > 0 {
            tracing::debug!("Remote version: {}, actions: {}", info.version, info.action_count);
        } else {
            tracing::debug!("Remote version {}", info.version);
        }
        self.contact = Some(info.clone());
        Ok(info)
    }

    /// Queries one switch. `NAK` replies surface as [`RoofError::NegativeAck`].
    pub async fn read_switch(&mut self, target: &Target) -> Result<bool, RoofError> {
        self.ensure_contact()?;
        let response = self.round_trip(&Command::query(target.clone()), None).await?;
        let response = log_negative(response).into_ack()?;
        Ok(response.switch_state())
    }

    /// Actuates one button and returns the acknowledged reply.
    pub async fn push_button(&mut self, target: &Target, on: bool) -> Result<Response, RoofError> {
        self.ensure_contact()?;
        let command = Command::actuate(target.clone(), on);
        tracing::debug!("Button pushed: {} {}", target, command.value().as_str());
        let response = self.round_trip(&command, Some(self.press_delay)).await?;
        log_negative(response).into_ack()
    }

    fn ensure_contact(&self) -> Result<(), RoofError> {
        if self.contact.is_none() {
            tracing::warn!("No contact with the roof controller has been established");
            return Err(RoofError::NotConnected);
        }
        Ok(())
    }

    async fn round_trip(
        &mut self,
        command: &Command,
        settle: Option<Duration>,
    ) -> Result<Response, RoofError> {
        let frame = command.encode()?;
        let result = async {
            self.transport.write(&frame).await?;
            if let Some(delay) = settle {
                sleep(delay).await;
            }
            let bytes = self.transport.read_frame().await?;
            Ok::<_, RoofError>(decode(&bytes)?)
        }
        .await;

        match &result {
            Ok(_) => self.errors.record(true),
            Err(e) if e.is_communication_failure() => {
                self.errors.record(false);
                tracing::warn!(
                    "Unable to complete {} exchange with the roof controller ({} consecutive errors): {}",
                    command.target(),
                    self.errors.consecutive(),
                    e
                );
            }
            Err(_) => {}
        }
        result
    }
}

fn log_negative(response: Response) -> Response {
    if !response.is_ack() {
        tracing::warn!(
            "Negative response from roof controller for {}: {}",
            response.target(),
            response.value()
        );
    }
    response
}

impl<C> std::fmt::Debug for RoofLink<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoofLink")
            .field("contact", &self.contact)
            .field("errors", &self.errors)
            .field("press_delay", &self.press_delay)
            .finish()
    }
}
