//! Incremental request decoder.
//!
//! The stream gives no length prefix, so the decoder walks the grammar byte
//! by byte and suspends whenever a value is incomplete. Progress is committed
//! only at field boundaries: a tag whose value has not fully arrived is
//! re-read from the tag byte on the next attempt, which keeps resumption
//! trivially correct under arbitrary chunking.

use bytes::{Buf, BytesMut};

use crate::FIELD_END;
use crate::errors::{ProtocolError, Result};
use crate::message::{FieldSet, FieldTag, FieldValue, Message, Op, PartialMessage, ValueKind};

#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for an op byte.
    Initial,
    /// Op byte consumed; reading fields until the terminator.
    Field(Op),
}

/// Reassembles request messages from a chunked byte stream.
///
/// Feed raw reads with [`Self::feed`], then drain completed messages with
/// [`Self::try_next`]. A framing error discards everything buffered; the
/// stream cannot be resynchronized and the connection should be closed.
#[derive(Debug)]
pub struct MessageDecoder {
    buf: BytesMut,
    /// Cursor past the committed prefix of the current message.
    pos: usize,
    state: State,
    fields: FieldSet,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            pos: 0,
            state: State::Initial,
            fields: FieldSet::default(),
        }
    }

    /// Appends a chunk of raw stream bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes buffered but not yet consumed by a complete message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decodes the next complete message, if the buffer holds one.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Call repeatedly after
    /// each [`Self::feed`]: a single chunk may complete several messages.
    ///
    /// # Errors
    ///
    /// Returns a framing error on an unknown op byte, an unknown field tag,
    /// or non-UTF-8 text; the buffer is discarded and the partially decoded
    /// message is attached to the error.
    pub fn try_next(&mut self) -> Result<Option<Message>> {
        let op = match self.state {
            State::Field(op) => op,
            State::Initial => {
                let Some(&byte) = self.buf.get(self.pos) else {
                    return Ok(None);
                };
                let Some(op) = Op::from_byte(byte) else {
                    let partial = self.discard(None);
                    return Err(ProtocolError::BadOp { value: byte, partial });
                };
                self.pos += 1;
                self.state = State::Field(op);
                op
            },
        };

        while let Some(&byte) = self.buf.get(self.pos) {
            if byte == FIELD_END {
                self.pos += 1;
                self.buf.advance(self.pos);
                self.pos = 0;
                self.state = State::Initial;
                let fields = std::mem::take(&mut self.fields);
                return Ok(Some(Message { op, fields }));
            }

            let Some(tag) = FieldTag::from_byte(byte) else {
                let partial = self.discard(Some(op));
                return Err(ProtocolError::BadTag { value: byte, partial });
            };

            let start = self.pos + 1;
            let (value, consumed) = match tag.kind() {
                ValueKind::Text => {
                    let Some(len) = self.buf[start..].iter().position(|&b| b == 0x00) else {
                        return Ok(None);
                    };
                    let raw = self.buf[start..start + len].to_vec();
                    match String::from_utf8(raw) {
                        Ok(text) => (FieldValue::Text(text), len + 1),
                        Err(_) => {
                            let partial = self.discard(Some(op));
                            return Err(ProtocolError::BadText { tag, partial });
                        },
                    }
                },
                ValueKind::Int32 => {
                    let Some(raw) = self.buf.get(start..start + 4) else {
                        return Ok(None);
                    };
                    let mut bytes = [0_u8; 4];
                    bytes.copy_from_slice(raw);
                    (FieldValue::Int(i32::from_le_bytes(bytes)), 4)
                },
                ValueKind::Time => {
                    let Some(raw) = self.buf.get(start..start + 8) else {
                        return Ok(None);
                    };
                    let mut bytes = [0_u8; 8];
                    bytes.copy_from_slice(raw);
                    (FieldValue::Time(i64::from_le_bytes(bytes)), 8)
                },
            };

            self.fields.set(tag, value);
            self.pos = start + consumed;
        }

        Ok(None)
    }

    /// Abandons the current message and everything buffered behind it.
    fn discard(&mut self, op: Option<Op>) -> Box<PartialMessage> {
        let fields = std::mem::take(&mut self.fields);
        self.buf.clear();
        self.pos = 0;
        self.state = State::Initial;
        Box::new(PartialMessage { op, fields })
    }
}
