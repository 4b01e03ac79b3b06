// src/protocol/handshake.rs - Parsing of the contact handshake reply
use crate::error::{ProtocolError, RoofError};
use crate::protocol::frame::Response;

/// Most auxiliary action slots a controller may declare.
pub const MAX_ACTIONS: usize = 8;

/// What the controller reports about itself in reply to `(CON:0:0)`.
///
/// The reply value looks like `V1.3-0[ACT4]`: a free-form version string,
/// optionally followed by a bracketed action count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactInfo {
    pub version: String,
    pub action_count: usize,
}

impl ContactInfo {
    pub fn from_response(response: Response) -> Result<Self, RoofError> {
        let response = response.into_ack()?;
        if !response.is_contact() {
            return Err(ProtocolError::InvalidField {
                field: "target",
                reason: format!("expected a contact reply, got {response}"),
            }
            .into());
        }
        Ok(Self::parse(response.value()))
    }

    /// Splits the reply text into version and action count. Any suffix other
    /// than `[ACT<n>]` with `n` in `1..=8` declares zero actions.
    pub fn parse(text: &str) -> Self {
        let Some((version, suffix)) = text.split_once('[') else {
            return Self {
                version: text.trim().to_string(),
                action_count: 0,
            };
        };
        let action_count = suffix
            .trim()
            .strip_prefix("ACT")
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|count| count.trim().parse::<usize>().ok())
            .filter(|count| (1..=MAX_ACTIONS).contains(count))
            .unwrap_or(0);
        Self {
            version: version.trim().to_string(),
            action_count,
        }
    }
}
