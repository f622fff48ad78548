//! Relayed protocol envelopes and the frames that carry them.

pub mod frames;
pub mod message;

pub use message::{Message, MessageKind, PROTOCOL_VERSION};
