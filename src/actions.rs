// src/actions.rs - Operator-defined auxiliary action slots
use crate::controller::RoofLink;
use crate::error::RoofError;
use crate::protocol::{Response, Target};
use crate::protocol::handshake::MAX_ACTIONS;
use crate::transport::ByteChannel;

/// One auxiliary on/off command. Slot indices are fixed for the life of the
/// registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSlot {
    index: usize,
    label: String,
    command: Target,
    status: Target,
    enabled: bool,
    active: bool,
    /// Whether `enabled` reflects the controller rather than saved configuration.
    synced: bool,
}

impl ActionSlot {
    fn new(index: usize) -> Result<Self, RoofError> {
        let number = index + 1;
        Ok(Self {
            index,
            label: placeholder_label(index),
            command: Target::new(format!("ACT{number}CMD"))?,
            status: Target::new(format!("ACT{number}STATE"))?,
            enabled: false,
            active: false,
            synced: false,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn command(&self) -> &Target {
        &self.command
    }

    pub fn status(&self) -> &Target {
        &self.status
    }

    /// Last state the operator requested.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Last state the controller returned for the slot's status switch.
    pub fn active(&self) -> bool {
        self.active
    }
}

fn placeholder_label(index: usize) -> String {
    format!("Action {}", index + 1)
}

/// Holds the eight action slots and how many of them the controller accepts.
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    slots: Vec<ActionSlot>,
    available: usize,
}

impl ActionRegistry {
    pub fn new() -> Result<Self, RoofError> {
        let slots = (0..MAX_ACTIONS)
            .map(ActionSlot::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { slots, available: 0 })
    }

    /// Assigns slot labels in order. Empty labels get an `Action N`
    /// placeholder; a label already used by an earlier slot becomes
    /// `Duplicate Label N`, N being that earlier slot's index.
    pub fn configure<S: AsRef<str>>(&mut self, labels: &[S]) {
        // Labels as later slots compare against them: placeholders stay empty.
        let mut seen: Vec<String> = Vec::with_capacity(MAX_ACTIONS);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let requested = labels.get(index).map(|l| l.as_ref().trim()).unwrap_or("");
            if requested.is_empty() {
                slot.label = placeholder_label(index);
                seen.push(String::new());
                continue;
            }
            let label = match seen.iter().position(|earlier| earlier == requested) {
                Some(earlier) => {
                    tracing::warn!(
                        "Action label {:?} for slot {} duplicates slot {}",
                        requested,
                        index + 1,
                        earlier + 1
                    );
                    format!("Duplicate Label {earlier}")
                }
                None => requested.to_string(),
            };
            seen.push(label.clone());
            slot.label = label;
        }
    }

    /// Restores the operator's requested states, e.g. from saved configuration.
    /// The controller's status switch overrides them once it has been read.
    pub fn restore_enabled(&mut self, enabled: &[bool]) {
        for (slot, on) in self.slots.iter_mut().zip(enabled) {
            slot.enabled = *on;
            slot.synced = false;
        }
    }

    pub fn set_available(&mut self, available: usize) {
        self.available = available.min(MAX_ACTIONS);
    }

    /// Number of slots the controller declared during the handshake.
    pub fn available(&self) -> usize {
        self.available
    }

    pub fn slots(&self) -> &[ActionSlot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Option<&ActionSlot> {
        self.slots.get(index)
    }

    /// Switches one slot on or off. Requesting the state already held sends
    /// nothing and returns `false`. A slot not yet read back from the
    /// controller reads its status switch first.
    pub async fn set<C: ByteChannel>(
        &mut self,
        link: &mut RoofLink<C>,
        index: usize,
        on: bool,
    ) -> Result<bool, RoofError> {
        if index >= self.available {
            return Err(RoofError::UnknownAction {
                slot: index,
                available: self.available,
            });
        }
        let slot = &mut self.slots[index];
        if !slot.synced {
            match link.read_switch(&slot.status).await {
                Ok(state) => {
                    slot.enabled = state;
                    slot.active = state;
                    slot.synced = true;
                }
                Err(e) => tracing::warn!("Unable to read status of action {}, sending anyway: {}", slot.label, e),
            }
        }
        if slot.synced && slot.enabled == on {
            tracing::debug!("Action {} is already {}", slot.label, if on { "on" } else { "off" });
            return Ok(false);
        }
        link.push_button(&slot.command, on).await?;
        slot.enabled = on;
        slot.synced = true;
        tracing::info!("Action {} switched {}", slot.label, if on { "on" } else { "off" });
        Ok(true)
    }

    /// Reads the status switch of every usable slot. A failed read reports the
    /// slot with the fallback reply's state.
    pub async fn refresh<C: ByteChannel>(&mut self, link: &mut RoofLink<C>) {
        for slot in self.slots.iter_mut().take(self.available) {
            slot.active = match link.read_switch(&slot.status).await {
                Ok(state) => {
                    if !slot.synced {
                        slot.enabled = state;
                        slot.synced = true;
                    }
                    state
                }
                Err(e) => {
                    tracing::warn!("Unable to read status of action {}: {}", slot.label, e);
                    Response::fallback().switch_state()
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{IoChannel, Transport};
    use std::time::Duration;
    use tokio_test::io::Builder;
    use tokio_test::assert_ok;

    fn labels(registry: &ActionRegistry) -> Vec<&str> {
        registry.slots().iter().map(|s| s.label()).collect()
    }

    #[test]
    fn test_default_slots() {
        let registry = ActionRegistry::new().unwrap();
        assert_eq!(registry.slots().len(), MAX_ACTIONS);
        let slot = registry.slot(2).unwrap();
        assert_eq!(slot.label(), "Action 3");
        assert_eq!(slot.command().as_str(), "ACT3CMD");
        assert_eq!(slot.status().as_str(), "ACT3STATE");
        assert_eq!(registry.available(), 0);
    }

    #[test]
    fn test_configure_fills_placeholders() {
        let mut registry = ActionRegistry::new().unwrap();
        registry.configure(&["Dew heater", "", "Fan"]);
        assert_eq!(
            labels(&registry),
            vec!["Dew heater", "Action 2", "Fan", "Action 4", "Action 5", "Action 6", "Action 7", "Action 8"]
        );
    }

    #[test]
    fn test_configure_first_label_wins() {
        let mut registry = ActionRegistry::new().unwrap();
        registry.configure(&["Light", "Fan", "Light", "Heater", "Fan"]);
        let labels = labels(&registry);
        assert_eq!(labels[0], "Light");
        assert_eq!(labels[1], "Fan");
        assert_eq!(labels[2], "Duplicate Label 0");
        assert_eq!(labels[3], "Heater");
        assert_eq!(labels[4], "Duplicate Label 1");
    }

    #[test]
    fn test_placeholders_are_not_duplicate_checked() {
        let mut registry = ActionRegistry::new().unwrap();
        registry.configure(&["", "", "Action 1"]);
        let labels = labels(&registry);
        assert_eq!(labels[0], "Action 1");
        assert_eq!(labels[1], "Action 2");
        assert_eq!(labels[2], "Action 1");
    }

    #[test]
    fn test_available_is_capped() {
        let mut registry = ActionRegistry::new().unwrap();
        registry.set_available(12);
        assert_eq!(registry.available(), MAX_ACTIONS);
    }

    #[tokio::test]
    async fn test_refresh_seeds_once_and_falls_back_on_nak() {
        let mock = Builder::new()
            .write(b"(CON:0:0)")
            .read(b"(ACK:0:V1[ACT1])")
            .write(b"(GET:ACT1STATE:0)")
            .read(b"(ACK:ACT1STATE:ON)")
            .write(b"(GET:ACT1STATE:0)")
            .read(b"(NAK:ACT1STATE:BUSY)")
            .build();
        let mut link = RoofLink::with_press_delay(Transport::new(IoChannel::new(mock)), Duration::ZERO);
        let info = assert_ok!(link.initial_contact().await);

        let mut registry = ActionRegistry::new().unwrap();
        registry.restore_enabled(&[false]);
        registry.set_available(info.action_count);

        registry.refresh(&mut link).await;
        let slot = registry.slot(0).unwrap();
        assert!(slot.active());
        assert!(slot.enabled());

        registry.refresh(&mut link).await;
        let slot = registry.slot(0).unwrap();
        assert_eq!(slot.active(), Response::fallback().switch_state());
        assert!(!slot.active());
        // A failed read does not overwrite the seeded request.
        assert!(slot.enabled());
    }
}
