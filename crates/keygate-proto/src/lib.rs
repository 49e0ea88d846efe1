//! Wire grammar for the keygate session broker.
//!
//! Requests are a single op byte followed by tagged fields and a `0xFF`
//! terminator; replies are a kind byte followed by text or a serialized
//! session. [`MessageDecoder`] reassembles requests across arbitrary read
//! boundaries; [`Reply`] covers the response direction for both the server
//! and client-side tooling.

pub mod decoder;
pub mod errors;
pub mod message;
pub mod reply;

pub use decoder::MessageDecoder;
pub use errors::{ProtocolError, Result};
pub use message::{FieldSet, FieldTag, FieldValue, Message, Op, PartialMessage};
pub use reply::{RecordWire, Reply, SessionWire};

/// Terminator byte for requests and record replies.
pub const FIELD_END: u8 = 0xFF;
