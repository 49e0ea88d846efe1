//! Request messages: operations, field tags, and the typed field set.

use bytes::BufMut;

use crate::FIELD_END;

/// Request operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Fetch a session by key.
    Lookup = 0x00,
    /// Apply fields to an existing session.
    Commit = 0x01,
    /// Create (or reclaim) a session under a key.
    Create = 0x02,
    /// Alias one session's record to another's.
    Transfer = 0x03,
}

impl Op {
    /// Parses an op byte. Unknown values are a framing violation.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Lookup),
            0x01 => Some(Self::Commit),
            0x02 => Some(Self::Create),
            0x03 => Some(Self::Transfer),
            _ => None,
        }
    }

    /// Wire encoding of this op.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Value shape carried by a field tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// NUL-terminated UTF-8 text.
    Text,
    /// Little-endian `i32`.
    Int32,
    /// Little-endian `i64` epoch seconds.
    Time,
}

/// Field tags.
///
/// The tag space is closed: every tag the grammar admits is listed here, and
/// routing a value to its slot in [`FieldSet`] is an exhaustive match rather
/// than a name lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldTag {
    /// Session key.
    Key = 0x00,
    /// User id.
    Uid = 0x01,
    /// Login name.
    User = 0x02,
    /// Display name.
    Display = 0x03,
    /// Expiration, epoch seconds.
    Expire = 0x04,
    /// Post-auth redirect target.
    Redirect = 0x05,
    /// Transfer source key.
    Src = 0x06,
    /// Transfer destination key.
    Dst = 0x07,
    /// Opaque client annotation.
    Tag = 0x08,
    /// Session lifetime in seconds.
    Lifetime = 0x09,
}

impl FieldTag {
    /// Parses a tag byte. Unknown values are a framing violation.
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Key),
            0x01 => Some(Self::Uid),
            0x02 => Some(Self::User),
            0x03 => Some(Self::Display),
            0x04 => Some(Self::Expire),
            0x05 => Some(Self::Redirect),
            0x06 => Some(Self::Src),
            0x07 => Some(Self::Dst),
            0x08 => Some(Self::Tag),
            0x09 => Some(Self::Lifetime),
            _ => None,
        }
    }

    /// Wire encoding of this tag.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// The value shape that follows this tag on the wire.
    pub fn kind(self) -> ValueKind {
        match self {
            Self::Key
            | Self::User
            | Self::Display
            | Self::Redirect
            | Self::Src
            | Self::Dst
            | Self::Tag => ValueKind::Text,
            Self::Uid | Self::Lifetime => ValueKind::Int32,
            Self::Expire => ValueKind::Time,
        }
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Text payload.
    Text(String),
    /// `i32` payload (uid, lifetime).
    Int(i32),
    /// `i64` payload (expire).
    Time(i64),
}

/// The fields of a request, one typed slot per tag.
///
/// Repeated tags overwrite: the last occurrence wins, matching the stream
/// semantics of the format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    /// Session key.
    pub key: Option<String>,
    /// User id.
    pub uid: Option<i32>,
    /// Login name.
    pub user: Option<String>,
    /// Display name.
    pub display: Option<String>,
    /// Expiration, epoch seconds.
    pub expire: Option<i64>,
    /// Post-auth redirect target.
    pub redirect: Option<String>,
    /// Transfer source key.
    pub src: Option<String>,
    /// Transfer destination key.
    pub dst: Option<String>,
    /// Opaque client annotation.
    pub tag: Option<String>,
    /// Session lifetime in seconds.
    pub lifetime: Option<i32>,
}

impl FieldSet {
    /// Stores `value` in the slot for `tag`.
    ///
    /// # Invariants
    ///
    /// The decoder derives the value from `tag.kind()`, so a kind mismatch
    /// cannot be constructed from the wire.
    pub fn set(&mut self, tag: FieldTag, value: FieldValue) {
        match (tag, value) {
            (FieldTag::Key, FieldValue::Text(v)) => self.key = Some(v),
            (FieldTag::Uid, FieldValue::Int(v)) => self.uid = Some(v),
            (FieldTag::User, FieldValue::Text(v)) => self.user = Some(v),
            (FieldTag::Display, FieldValue::Text(v)) => self.display = Some(v),
            (FieldTag::Expire, FieldValue::Time(v)) => self.expire = Some(v),
            (FieldTag::Redirect, FieldValue::Text(v)) => self.redirect = Some(v),
            (FieldTag::Src, FieldValue::Text(v)) => self.src = Some(v),
            (FieldTag::Dst, FieldValue::Text(v)) => self.dst = Some(v),
            (FieldTag::Tag, FieldValue::Text(v)) => self.tag = Some(v),
            (FieldTag::Lifetime, FieldValue::Int(v)) => self.lifetime = Some(v),
            (tag, value) => debug_assert!(false, "kind mismatch: {tag:?} <- {value:?}"),
        }
    }

    /// True when no field has been set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Encodes the set fields in tag order.
    pub fn encode(&self, dst: &mut impl BufMut) {
        if let Some(v) = &self.key {
            put_text(dst, FieldTag::Key, v);
        }
        if let Some(v) = self.uid {
            dst.put_u8(FieldTag::Uid.to_byte());
            dst.put_i32_le(v);
        }
        if let Some(v) = &self.user {
            put_text(dst, FieldTag::User, v);
        }
        if let Some(v) = &self.display {
            put_text(dst, FieldTag::Display, v);
        }
        if let Some(v) = self.expire {
            dst.put_u8(FieldTag::Expire.to_byte());
            dst.put_i64_le(v);
        }
        if let Some(v) = &self.redirect {
            put_text(dst, FieldTag::Redirect, v);
        }
        if let Some(v) = &self.src {
            put_text(dst, FieldTag::Src, v);
        }
        if let Some(v) = &self.dst {
            put_text(dst, FieldTag::Dst, v);
        }
        if let Some(v) = &self.tag {
            put_text(dst, FieldTag::Tag, v);
        }
        if let Some(v) = self.lifetime {
            dst.put_u8(FieldTag::Lifetime.to_byte());
            dst.put_i32_le(v);
        }
    }
}

fn put_text(dst: &mut impl BufMut, tag: FieldTag, value: &str) {
    dst.put_u8(tag.to_byte());
    dst.put_slice(value.as_bytes());
    dst.put_u8(0x00);
}

/// A complete decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The requested operation.
    pub op: Op,
    /// The fields carried with it.
    pub fields: FieldSet,
}

impl Message {
    /// Encodes the message, terminator included.
    ///
    /// Used by client tooling and tests; the server only decodes requests.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.op.to_byte());
        self.fields.encode(dst);
        dst.put_u8(FIELD_END);
    }
}

/// The state of a message abandoned mid-decode, attached to framing errors
/// for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialMessage {
    /// The operation, if the op byte had been read.
    pub op: Option<Op>,
    /// Fields decoded before the violation.
    pub fields: FieldSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_bytes_round_trip() {
        for op in [Op::Lookup, Op::Commit, Op::Create, Op::Transfer] {
            assert_eq!(Op::from_byte(op.to_byte()), Some(op));
        }
        assert_eq!(Op::from_byte(0x04), None);
        assert_eq!(Op::from_byte(0xFF), None);
    }

    #[test]
    fn tag_bytes_round_trip() {
        for byte in 0x00..=0x09 {
            let tag = FieldTag::from_byte(byte);
            assert_eq!(tag.map(FieldTag::to_byte), Some(byte));
        }
        assert_eq!(FieldTag::from_byte(0x0A), None);
        assert_eq!(FieldTag::from_byte(0xFF), None);
    }

    #[test]
    fn set_routes_by_tag() {
        let mut fields = FieldSet::default();
        fields.set(FieldTag::Key, FieldValue::Text("abc".into()));
        fields.set(FieldTag::Uid, FieldValue::Int(7));
        fields.set(FieldTag::Expire, FieldValue::Time(1_700_000_000));
        assert_eq!(fields.key.as_deref(), Some("abc"));
        assert_eq!(fields.uid, Some(7));
        assert_eq!(fields.expire, Some(1_700_000_000));
        assert!(fields.user.is_none());
    }

    #[test]
    fn repeated_tag_overwrites() {
        let mut fields = FieldSet::default();
        fields.set(FieldTag::User, FieldValue::Text("first".into()));
        fields.set(FieldTag::User, FieldValue::Text("second".into()));
        assert_eq!(fields.user.as_deref(), Some("second"));
    }

    #[test]
    fn encode_emits_terminator() {
        let msg = Message {
            op: Op::Lookup,
            fields: FieldSet {
                key: Some("k".into()),
                ..FieldSet::default()
            },
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf);
        assert_eq!(buf, vec![0x00, 0x00, b'k', 0x00, 0xFF]);
    }
}
