//! Reply encoding and decoding.
//!
//! Replies are one kind byte followed by either NUL-terminated text (message
//! and error kinds) or a serialized session (record kind). The server only
//! encodes; decoding exists for tests and client tooling.

use bytes::BufMut;

use crate::FIELD_END;
use crate::errors::{ProtocolError, Result};
use crate::message::FieldTag;

/// Reply kind byte: informational text.
pub const KIND_MESSAGE: u8 = 0x00;
/// Reply kind byte: operation error text.
pub const KIND_ERROR: u8 = 0x01;
/// Reply kind byte: serialized session.
pub const KIND_RECORD: u8 = 0x02;

/// The identity payload of an active session on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWire {
    /// User id, always >= 1 here.
    pub uid: i32,
    /// Login name.
    pub user: String,
    /// Display name.
    pub display: String,
    /// Expiration, epoch seconds.
    pub expire: i64,
    /// Lifetime in seconds.
    pub lifetime: i32,
}

/// A session as serialized in a record reply.
///
/// `record` is present only when the session was active at serialization
/// time; an inactive session ships just its key and any redirect/tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionWire {
    /// Session key.
    pub key: String,
    /// Identity fields, active sessions only.
    pub record: Option<RecordWire>,
    /// Post-auth redirect target, if set.
    pub redirect: Option<String>,
    /// Opaque client annotation, if set.
    pub tag: Option<String>,
}

/// A reply to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Success text, e.g. "record created".
    Message(String),
    /// Operation error text, e.g. "no such record".
    Error(String),
    /// A serialized session (lookup result).
    Record(SessionWire),
}

impl Reply {
    /// Encodes the reply onto `dst`.
    pub fn encode(&self, dst: &mut impl BufMut) {
        match self {
            Self::Message(text) => put_kind_text(dst, KIND_MESSAGE, text),
            Self::Error(text) => put_kind_text(dst, KIND_ERROR, text),
            Self::Record(session) => {
                dst.put_u8(KIND_RECORD);
                session.encode(dst);
            },
        }
    }

    /// Decodes one reply from the front of `src`.
    ///
    /// Returns the reply and the number of bytes it occupied, so callers can
    /// walk a stream of replies.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::TruncatedReply`] when `src` ends before the reply
    /// does (read more and retry); [`ProtocolError::BadReplyKind`] or
    /// [`ProtocolError::BadRecordReply`] on malformed input.
    pub fn decode(src: &[u8]) -> Result<(Self, usize)> {
        let Some(&kind) = src.first() else {
            return Err(ProtocolError::TruncatedReply);
        };
        match kind {
            KIND_MESSAGE => {
                let (text, used) = take_text(&src[1..])?;
                Ok((Self::Message(text), 1 + used))
            },
            KIND_ERROR => {
                let (text, used) = take_text(&src[1..])?;
                Ok((Self::Error(text), 1 + used))
            },
            KIND_RECORD => {
                let (session, used) = SessionWire::decode(&src[1..])?;
                Ok((Self::Record(session), 1 + used))
            },
            other => Err(ProtocolError::BadReplyKind(other)),
        }
    }
}

impl SessionWire {
    /// Serialized session layout: key, then the identity block when active,
    /// then optional redirect and tag, then the terminator.
    pub fn encode(&self, dst: &mut impl BufMut) {
        put_text(dst, FieldTag::Key, &self.key);
        if let Some(record) = &self.record {
            dst.put_u8(FieldTag::Uid.to_byte());
            dst.put_i32_le(record.uid);
            put_text(dst, FieldTag::User, &record.user);
            put_text(dst, FieldTag::Display, &record.display);
            dst.put_u8(FieldTag::Expire.to_byte());
            dst.put_i64_le(record.expire);
            dst.put_u8(FieldTag::Lifetime.to_byte());
            dst.put_i32_le(record.lifetime);
        }
        if let Some(redirect) = &self.redirect {
            put_text(dst, FieldTag::Redirect, redirect);
        }
        if let Some(tag) = &self.tag {
            put_text(dst, FieldTag::Tag, tag);
        }
        dst.put_u8(FIELD_END);
    }

    fn decode(src: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor { src, pos: 0 };

        if cursor.take_byte()? != FieldTag::Key.to_byte() {
            return Err(ProtocolError::BadRecordReply("expected key field first"));
        }
        let key = cursor.take_text()?;

        let mut record = None;
        let mut redirect = None;
        let mut tag = None;

        loop {
            let byte = cursor.take_byte()?;
            if byte == FIELD_END {
                break;
            }
            match FieldTag::from_byte(byte) {
                Some(FieldTag::Uid) => {
                    // The identity block is all-or-nothing and fixed order.
                    let uid = cursor.take_i32()?;
                    cursor.expect_tag(FieldTag::User)?;
                    let user = cursor.take_text()?;
                    cursor.expect_tag(FieldTag::Display)?;
                    let display = cursor.take_text()?;
                    cursor.expect_tag(FieldTag::Expire)?;
                    let expire = cursor.take_i64()?;
                    cursor.expect_tag(FieldTag::Lifetime)?;
                    let lifetime = cursor.take_i32()?;
                    record = Some(RecordWire { uid, user, display, expire, lifetime });
                },
                Some(FieldTag::Redirect) => redirect = Some(cursor.take_text()?),
                Some(FieldTag::Tag) => tag = Some(cursor.take_text()?),
                _ => return Err(ProtocolError::BadRecordReply("unexpected field tag")),
            }
        }

        Ok((Self { key, record, redirect, tag }, cursor.pos))
    }
}

fn put_kind_text(dst: &mut impl BufMut, kind: u8, text: &str) {
    dst.put_u8(kind);
    dst.put_slice(text.as_bytes());
    dst.put_u8(0x00);
}

fn put_text(dst: &mut impl BufMut, tag: FieldTag, value: &str) {
    dst.put_u8(tag.to_byte());
    dst.put_slice(value.as_bytes());
    dst.put_u8(0x00);
}

fn take_text(src: &[u8]) -> Result<(String, usize)> {
    let Some(len) = src.iter().position(|&b| b == 0x00) else {
        return Err(ProtocolError::TruncatedReply);
    };
    match std::str::from_utf8(&src[..len]) {
        Ok(text) => Ok((text.to_owned(), len + 1)),
        Err(_) => Err(ProtocolError::BadRecordReply("text is not valid UTF-8")),
    }
}

struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take_byte(&mut self) -> Result<u8> {
        let Some(&byte) = self.src.get(self.pos) else {
            return Err(ProtocolError::TruncatedReply);
        };
        self.pos += 1;
        Ok(byte)
    }

    fn expect_tag(&mut self, tag: FieldTag) -> Result<()> {
        if self.take_byte()? == tag.to_byte() {
            Ok(())
        } else {
            Err(ProtocolError::BadRecordReply("identity block out of order"))
        }
    }

    fn take_text(&mut self) -> Result<String> {
        let (text, used) = take_text(&self.src[self.pos..])?;
        self.pos += used;
        Ok(text)
    }

    fn take_i32(&mut self) -> Result<i32> {
        let Some(raw) = self.src.get(self.pos..self.pos + 4) else {
            return Err(ProtocolError::TruncatedReply);
        };
        let mut bytes = [0_u8; 4];
        bytes.copy_from_slice(raw);
        self.pos += 4;
        Ok(i32::from_le_bytes(bytes))
    }

    fn take_i64(&mut self) -> Result<i64> {
        let Some(raw) = self.src.get(self.pos..self.pos + 8) else {
            return Err(ProtocolError::TruncatedReply);
        };
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(raw);
        self.pos += 8;
        Ok(i64::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(reply: &Reply) -> Reply {
        let mut buf = Vec::new();
        reply.encode(&mut buf);
        let (decoded, used) = Reply::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        decoded
    }

    #[test]
    fn message_reply_layout() {
        let mut buf = Vec::new();
        Reply::Message("record created".into()).encode(&mut buf);
        assert_eq!(buf[0], KIND_MESSAGE);
        assert_eq!(&buf[1..15], b"record created");
        assert_eq!(buf[15], 0x00);
    }

    #[test]
    fn error_reply_round_trips() {
        let reply = Reply::Error("no such record".into());
        assert_eq!(round_trip(&reply), reply);
    }

    #[test]
    fn active_session_carries_identity_block() {
        let reply = Reply::Record(SessionWire {
            key: "abc".into(),
            record: Some(RecordWire {
                uid: 7,
                user: "bob".into(),
                display: "Bob".into(),
                expire: 1_700_000_060,
                lifetime: 60,
            }),
            redirect: Some("/home".into()),
            tag: Some("web".into()),
        });
        assert_eq!(round_trip(&reply), reply);
    }

    #[test]
    fn inactive_session_is_key_only() {
        let session = SessionWire {
            key: "abc".into(),
            record: None,
            redirect: None,
            tag: None,
        };
        let mut buf = Vec::new();
        Reply::Record(session.clone()).encode(&mut buf);
        // kind, key tag, "abc", NUL, terminator
        assert_eq!(buf, vec![0x02, 0x00, b'a', b'b', b'c', 0x00, 0xFF]);
        let (decoded, _) = Reply::decode(&buf).unwrap();
        assert_eq!(decoded, Reply::Record(session));
    }

    #[test]
    fn truncated_reply_asks_for_more() {
        let mut buf = Vec::new();
        Reply::Message("pending".into()).encode(&mut buf);
        for end in 0..buf.len() {
            let err = Reply::decode(&buf[..end]).unwrap_err();
            assert_eq!(err, ProtocolError::TruncatedReply);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = Reply::decode(&[0x07, 0x00]).unwrap_err();
        assert_eq!(err, ProtocolError::BadReplyKind(0x07));
    }

    #[test]
    fn two_replies_decode_in_sequence() {
        let mut buf = Vec::new();
        Reply::Message("record created".into()).encode(&mut buf);
        Reply::Error("no such record".into()).encode(&mut buf);
        let (first, used) = Reply::decode(&buf).unwrap();
        let (second, rest) = Reply::decode(&buf[used..]).unwrap();
        assert_eq!(first, Reply::Message("record created".into()));
        assert_eq!(second, Reply::Error("no such record".into()));
        assert_eq!(used + rest, buf.len());
    }
}
