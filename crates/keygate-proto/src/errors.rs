//! Protocol error types.

use crate::message::{FieldTag, PartialMessage};

/// Convenience alias for protocol results.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while decoding the wire format.
///
/// Request framing errors (`BadOp`, `BadTag`, `BadText`) carry whatever was
/// decoded before the violation so the caller can log it. They also discard
/// the decoder's buffer: once the grammar is broken there is no resync point,
/// and the connection must be closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The first byte of a message is not a known operation.
    #[error("bad message operator {value:#04x}")]
    BadOp {
        /// The offending byte.
        value: u8,
        /// What had been decoded before the violation.
        partial: Box<PartialMessage>,
    },

    /// A field tag byte is not in the grammar.
    #[error("bad field tag {value:#04x}")]
    BadTag {
        /// The offending byte.
        value: u8,
        /// What had been decoded before the violation.
        partial: Box<PartialMessage>,
    },

    /// A text field holds bytes that are not valid UTF-8.
    #[error("field {tag:?} is not valid UTF-8")]
    BadText {
        /// The field whose value was rejected.
        tag: FieldTag,
        /// What had been decoded before the violation.
        partial: Box<PartialMessage>,
    },

    /// A reply buffer ended before the structure was complete.
    #[error("truncated reply")]
    TruncatedReply,

    /// A reply kind byte is not message, error, or record.
    #[error("bad reply kind {0:#04x}")]
    BadReplyKind(u8),

    /// A record reply violated the session layout.
    #[error("malformed record reply: {0}")]
    BadRecordReply(&'static str),
}
