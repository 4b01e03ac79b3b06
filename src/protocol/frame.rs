//! Frame codec for the roof controller's text protocol.
//!
//! Every message is a single frame of the form `(VERB:TARGET:VALUE)`. The host
//! sends `CON`, `GET` and `SET` frames; the controller answers with `ACK` or
//! `NAK`. Inbound bytes are validated incrementally by [`FrameScanner`] so a
//! reader can give up on garbage as soon as it is recognisable, rather than
//! waiting out the full timeout window.

use std::fmt;

use crate::error::{ProtocolError, RoofError};

/// Longest verb field accepted in either direction.
pub const MAX_COMMAND_LEN: usize = 15;
/// Longest target identifier the host will put on the wire.
pub const MAX_TARGET_LEN: usize = 15;
/// Longest target field accepted from the controller. NAK replies may carry
/// an error token here instead of the echoed command target.
pub const MAX_INBOUND_TARGET_LEN: usize = 31;
/// Longest value field accepted from the controller, sized for NAK error text.
pub const MAX_VALUE_LEN: usize = 127;
/// Outbound frames never exceed this many bytes.
pub const MAX_OUTBOUND_FRAME: usize = 63;
/// Inbound frames never exceed this many bytes.
pub const MAX_INBOUND_FRAME: usize = 255;

/// Target used by the contact handshake.
pub const CONTACT_TARGET: &str = "0";

const FRAME_START: u8 = b'(';
const FRAME_END: u8 = b')';
const DELIMITER: u8 = b':';

/// Verbs the host sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Contact check, only ever sent with the `0` target.
    Con,
    Get,
    Set,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Con => "CON",
            Verb::Get => "GET",
            Verb::Set => "SET",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "CON" => Some(Verb::Con),
            "GET" => Some(Verb::Get),
            "SET" => Some(Verb::Set),
            _ => None,
        }
    }
}

/// Verbs the controller answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reply {
    Ack,
    Nak,
}

impl Reply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Ack => "ACK",
            Reply::Nak => "NAK",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "ACK" => Some(Reply::Ack),
            "NAK" => Some(Reply::Nak),
            _ => None,
        }
    }
}

/// Values the host sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Zero,
    On,
    Off,
}

impl Value {
    pub fn as_str(&self) -> &'static str {
        match self {
            Value::Zero => "0",
            Value::On => "ON",
            Value::Off => "OFF",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "0" => Some(Value::Zero),
            "ON" => Some(Value::On),
            "OFF" => Some(Value::Off),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(on: bool) -> Self {
        if on { Value::On } else { Value::Off }
    }
}

/// A device-side identifier, length checked and free of frame delimiters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target(String);

impl Target {
    pub fn new(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProtocolError::InvalidField {
                field: "target",
                reason: "target identifier is empty".to_string(),
            });
        }
        if name.len() > MAX_TARGET_LEN {
            return Err(ProtocolError::TooLong { len: name.len(), max: MAX_TARGET_LEN });
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !c.is_ascii_graphic() || matches!(c, '(' | ')' | ':'))
        {
            return Err(ProtocolError::InvalidField {
                field: "target",
                reason: format!("character {bad:?} is not allowed in {name:?}"),
            });
        }
        Ok(Self(name))
    }

    pub fn contact() -> Self {
        Self(CONTACT_TARGET.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One encoded frame, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Formats `(VERB:TARGET:VALUE)`, failing if the result would not fit the
/// outbound cap.
pub fn encode(verb: Verb, target: &Target, value: Value) -> Result<Frame, ProtocolError> {
    let text = format!("({}:{}:{})", verb.as_str(), target, value.as_str());
    if text.len() > MAX_OUTBOUND_FRAME {
        return Err(ProtocolError::TooLong { len: text.len(), max: MAX_OUTBOUND_FRAME });
    }
    Ok(Frame(text))
}

/// A host request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: Verb,
    target: Target,
    value: Value,
}

impl Command {
    pub fn new(verb: Verb, target: Target, value: Value) -> Self {
        Self { verb, target, value }
    }

    /// `(CON:0:0)`
    pub fn contact() -> Self {
        Self::new(Verb::Con, Target::contact(), Value::Zero)
    }

    /// `(GET:<target>:0)`
    pub fn query(target: Target) -> Self {
        Self::new(Verb::Get, target, Value::Zero)
    }

    /// `(SET:<target>:ON|OFF)`
    pub fn actuate(target: Target, on: bool) -> Self {
        Self::new(Verb::Set, target, Value::from(on))
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn value(&self) -> Value {
        self.value
    }

    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        encode(self.verb, &self.target, self.value)
    }

    /// Parses a host request frame. Used by the simulated controller, which
    /// sits on the other end of the line.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let fields = scan_fields(bytes)?;
        let malformed = || ProtocolError::Malformed { raw: fields.raw.clone() };
        let verb = Verb::parse(&fields.verb).ok_or_else(malformed)?;
        let value = Value::parse(&fields.value).ok_or_else(malformed)?;
        let target = Target::new(fields.target.clone())?;
        Ok(Self { verb, target, value })
    }
}

/// A controller reply. Only produced by [`decode`] or [`Response::fallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    reply: Reply,
    target: String,
    value: String,
}

impl Response {
    /// The neutral `NAK:NONE:OFF` reply substituted for malformed input.
    pub fn fallback() -> Self {
        Self {
            reply: Reply::Nak,
            target: "NONE".to_string(),
            value: "OFF".to_string(),
        }
    }

    pub fn reply(&self) -> Reply {
        self.reply
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_ack(&self) -> bool {
        self.reply == Reply::Ack
    }

    /// A reply to the contact probe: the value is free-form text, not ON/OFF.
    pub fn is_contact(&self) -> bool {
        self.target == CONTACT_TARGET
    }

    /// Reads the value as a switch. Anything but `ON` is off, so the fallback
    /// reply always reads as off.
    pub fn switch_state(&self) -> bool {
        self.reply == Reply::Ack && self.value == "ON"
    }

    /// Converts a `NAK` into [`RoofError::NegativeAck`].
    pub fn into_ack(self) -> Result<Self, RoofError> {
        match self.reply {
            Reply::Ack => Ok(self),
            Reply::Nak => Err(RoofError::NegativeAck {
                target: self.target,
                reason: self.value,
            }),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{}:{})", self.reply.as_str(), self.target, self.value)
    }
}

/// Decodes one controller reply. Malformed input yields
/// [`ProtocolError::Malformed`]; switch reads that fail take the value of
/// [`Response::fallback`].
pub fn decode(bytes: &[u8]) -> Result<Response, ProtocolError> {
    let fields = scan_fields(bytes)?;
    let reply = Reply::parse(&fields.verb).ok_or_else(|| ProtocolError::Malformed {
        raw: fields.raw.clone(),
    })?;
    Ok(Response {
        reply,
        target: fields.target,
        value: fields.value,
    })
}

/// Progress of a [`FrameScanner`] after each byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Incomplete,
    Complete,
    Malformed,
}

/// Incremental well-formedness tracker for inbound frames.
///
/// Bytes before the opening `(` are counted but not kept. Once the scanner
/// reports `Complete` or `Malformed` it ignores further input until
/// [`FrameScanner::reset`].
#[derive(Debug, Clone)]
pub struct FrameScanner {
    received: Vec<u8>,
    start: Option<usize>,
    delimiters: usize,
    field_len: usize,
    status: ScanStatus,
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScanner {
    pub fn new() -> Self {
        Self {
            received: Vec::with_capacity(MAX_INBOUND_FRAME),
            start: None,
            delimiters: 0,
            field_len: 0,
            status: ScanStatus::Incomplete,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn status(&self) -> ScanStatus {
        self.status
    }

    /// Bytes from the opening delimiter onwards.
    pub fn frame(&self) -> &[u8] {
        match self.start {
            Some(start) => &self.received[start..],
            None => &[],
        }
    }

    /// Lossy rendering of everything received, for logs and errors.
    pub fn raw(&self) -> String {
        String::from_utf8_lossy(&self.received).into_owned()
    }

    pub fn push(&mut self, byte: u8) -> ScanStatus {
        if self.status != ScanStatus::Incomplete {
            return self.status;
        }
        self.received.push(byte);
        let start_found = self.start.is_some();

        let mut end_found = false;
        match byte {
            FRAME_START if start_found => return self.fail(),
            FRAME_START => self.start = Some(self.received.len() - 1),
            _ if !start_found => {}
            DELIMITER => {
                self.delimiters += 1;
                self.field_len = 0;
            }
            FRAME_END => end_found = true,
            _ => self.field_len += 1,
        }

        let field_budget = match self.delimiters {
            0 => MAX_COMMAND_LEN,
            1 => MAX_INBOUND_TARGET_LEN,
            _ => MAX_VALUE_LEN,
        };
        // The field budgets reject any frame well before the cap; the cap
        // only bounds the buffer should the budgets ever be widened.
        let rejected = (!end_found && self.received.len() >= MAX_INBOUND_FRAME)
            || (self.received.len() >= 2 && self.start.is_none())
            || self.field_len > field_budget
            || self.delimiters > 2
            || (end_found && self.delimiters != 2);

        if rejected {
            return self.fail();
        }
        if end_found {
            self.status = ScanStatus::Complete;
        }
        self.status
    }

    fn fail(&mut self) -> ScanStatus {
        self.status = ScanStatus::Malformed;
        self.status
    }
}

struct Fields {
    raw: String,
    verb: String,
    target: String,
    value: String,
}

fn scan_fields(bytes: &[u8]) -> Result<Fields, ProtocolError> {
    let mut scanner = FrameScanner::new();
    let mut status = ScanStatus::Incomplete;
    for &byte in bytes {
        status = scanner.push(byte);
        if status != ScanStatus::Incomplete {
            break;
        }
    }
    let raw = scanner.raw();
    if status != ScanStatus::Complete {
        return Err(ProtocolError::Malformed { raw });
    }

    let frame = scanner.frame();
    // The scanner guarantees a leading '(' and trailing ')' around two ':'.
    let inner = std::str::from_utf8(&frame[1..frame.len() - 1])
        .map_err(|_| ProtocolError::Malformed { raw: raw.clone() })?;
    let mut parts = inner.splitn(3, ':');
    let (Some(verb), Some(target), Some(value)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProtocolError::Malformed { raw });
    };
    if verb.is_empty() || target.is_empty() {
        return Err(ProtocolError::Malformed { raw });
    }
    Ok(Fields {
        verb: verb.to_string(),
        target: target.to_string(),
        value: value.to_string(),
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str) -> Target {
        Target::new(name).unwrap()
    }

    #[test]
    fn test_encode_query() {
        let frame = Command::query(target("OPENED")).encode().unwrap();
        assert_eq!(frame.as_str(), "(GET:OPENED:0)");
        assert_eq!(Command::contact().encode().unwrap().as_str(), "(CON:0:0)");
        assert_eq!(
            Command::actuate(target("AUXSET"), false).encode().unwrap().as_str(),
            "(SET:AUXSET:OFF)"
        );
    }

    #[test]
    fn test_command_round_trip() {
        for verb in [Verb::Con, Verb::Get, Verb::Set] {
            for value in [Value::Zero, Value::On, Value::Off] {
                let cmd = Command::new(verb, target("ACT3CMD"), value);
                let frame = cmd.encode().unwrap();
                assert_eq!(Command::decode(frame.as_bytes()).unwrap(), cmd);
            }
        }
    }

    #[test]
    fn test_target_validation() {
        assert!(matches!(
            Target::new("A_VERY_LONG_TARGET_NAME"),
            Err(ProtocolError::TooLong { len: 23, max: MAX_TARGET_LEN })
        ));
        assert!(Target::new("").is_err());
        assert!(Target::new("OPEN:ON").is_err());
        assert!(Target::new("OPEN)").is_err());
        assert!(Target::new("HAS SPACE").is_err());
    }

    #[test]
    fn test_decode_ack() {
        let response = decode(b"(ACK:ROOF_OPENED_SWITCH:ON)").unwrap();
        assert_eq!(response.reply(), Reply::Ack);
        assert_eq!(response.target(), "ROOF_OPENED_SWITCH");
        assert_eq!(response.value(), "ON");
        assert!(response.switch_state());
    }

    #[test]
    fn test_decode_nak_is_a_valid_frame() {
        let response = decode(b"(NAK:SET_ROOF_OPEN:BUSY)").unwrap();
        assert_eq!(response.reply(), Reply::Nak);
        assert!(!response.switch_state());
        match response.into_ack() {
            Err(RoofError::NegativeAck { target, reason }) => {
                assert_eq!(target, "SET_ROOF_OPEN");
                assert_eq!(reason, "BUSY");
            }
            other => panic!("expected negative ack, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_reply_verb() {
        assert!(matches!(decode(b"(GET:OPENED:0)"), Err(ProtocolError::Malformed { .. })));
    }

    #[test]
    fn test_decode_truncated_frame() {
        assert!(matches!(decode(b"(ACK:OPENED:O"), Err(ProtocolError::Malformed { .. })));
        assert!(matches!(decode(b""), Err(ProtocolError::Malformed { .. })));
    }

    #[test]
    fn test_scanner_rejects_missing_start_after_two_bytes() {
        let mut scanner = FrameScanner::new();
        assert_eq!(scanner.push(b'A'), ScanStatus::Incomplete);
        assert_eq!(scanner.push(b'C'), ScanStatus::Malformed);
        // Stays rejected.
        assert_eq!(scanner.push(b'('), ScanStatus::Malformed);
    }

    #[test]
    fn test_scanner_tolerates_one_leading_byte() {
        let response = decode(b"\n(ACK:CLOSED:OFF)").unwrap();
        assert_eq!(response.target(), "CLOSED");
        assert!(!response.switch_state());
    }

    #[test]
    fn test_scanner_rejects_wrong_delimiter_count() {
        assert!(decode(b"(ACK:OPENED)").is_err());
        assert!(decode(b"(ACK:OPENED:ON:EXTRA)").is_err());
        assert!(decode(b"(ACK:OPEN(ED:ON)").is_err());
    }

    #[test]
    fn test_scanner_field_budgets() {
        let long_verb = format!("({}:X:ON)", "A".repeat(MAX_COMMAND_LEN + 1));
        assert!(decode(long_verb.as_bytes()).is_err());

        let long_target = format!("(ACK:{}:ON)", "T".repeat(MAX_INBOUND_TARGET_LEN + 1));
        assert!(decode(long_target.as_bytes()).is_err());

        let long_value = format!("(NAK:OPEN:{})", "v".repeat(MAX_VALUE_LEN));
        assert!(decode(long_value.as_bytes()).is_ok());
    }

    fn widest_frame_body() -> String {
        format!(
            "({}:{}:{}",
            "A".repeat(MAX_COMMAND_LEN),
            "T".repeat(MAX_INBOUND_TARGET_LEN),
            "v".repeat(MAX_VALUE_LEN)
        )
    }

    #[test]
    fn test_widest_frame_fits_under_inbound_cap() {
        let frame = format!("{})", widest_frame_body());
        assert!(frame.len() < MAX_INBOUND_FRAME);

        let mut scanner = FrameScanner::new();
        for &byte in frame.as_bytes() {
            scanner.push(byte);
        }
        assert_eq!(scanner.status(), ScanStatus::Complete);
    }

    #[test]
    fn test_unterminated_frame_rejected_before_inbound_cap() {
        let mut scanner = FrameScanner::new();
        let mut pushed = 0;
        let body = widest_frame_body().into_bytes();
        for byte in body.into_iter().chain(std::iter::repeat(b'v')).take(10 * MAX_INBOUND_FRAME) {
            pushed += 1;
            if scanner.push(byte) != ScanStatus::Incomplete {
                break;
            }
        }
        assert_eq!(scanner.status(), ScanStatus::Malformed);
        // One byte past the value budget.
        assert_eq!(pushed, MAX_COMMAND_LEN + MAX_INBOUND_TARGET_LEN + MAX_VALUE_LEN + 4);
        assert!(pushed < MAX_INBOUND_FRAME);
    }

    #[test]
    fn test_decode_never_panics_on_arbitrary_bytes() {
        let inputs: [&[u8]; 8] = [
            b"(",
            b")",
            b"((",
            b"(::)",
            b"(ACK::)",
            b"(\xff\xfe:A:B)",
            b"(ACK:0:)",
            b"::::::::",
        ];
        for input in inputs {
            let _ = decode(input);
        }
        assert!(decode(b"(ACK:0:)").is_ok());
        assert!(decode(b"(\xff\xfe:A:B)").is_err());
    }

    #[test]
    fn test_fallback_response() {
        let fallback = Response::fallback();
        assert_eq!(fallback.to_string(), "(NAK:NONE:OFF)");
        assert!(!fallback.switch_state());
    }
}
