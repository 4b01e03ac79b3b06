// src/protocol/mod.rs - Wire protocol spoken with the roof controller
pub mod frame;
pub mod handshake;

pub use frame::{
    decode, encode, Command, Frame, FrameScanner, Reply, Response, ScanStatus, Target, Value,
    Verb,
};
pub use handshake::ContactInfo;
