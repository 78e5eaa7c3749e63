//! RESP frame types.
//!
//! The [`Frame`] enum represents a single decoded reply or an outgoing
//! command. Bulk strings use `Bytes` so keys pulled out of
//! `CLUSTER GETKEYSINSLOT` replies can be handed straight to `MIGRATE`
//! without copying.

use bytes::Bytes;

/// A single RESP protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string reply, e.g. `+OK\r\n`.
    Simple(String),

    /// Error reply, e.g. `-LOADING Redis is loading the dataset\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Ordered array of frames.
    Array(Vec<Frame>),

    /// Null value. Decoded from RESP3 `_\r\n` as well as the RESP2
    /// null bulk string (`$-1`) and null array (`*-1`).
    Null,

    /// Ordered map of key-value frame pairs (RESP3 only).
    Map(Vec<(Frame, Frame)>),
}

impl Frame {
    /// Builds a command frame: an array of bulk strings.
    pub fn command<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Frame::Array(parts.into_iter().map(|p| Frame::Bulk(p.into())).collect())
    }

    /// Returns `true` if this frame is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Returns `true` for a `+OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Simple(s) if s == "OK")
    }

    /// Returns the textual content of a simple or bulk string.
    ///
    /// Bulk payloads are decoded lossily; node listings and INFO output
    /// are ASCII in practice.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Frame::Simple(s) => Some(s.clone()),
            Frame::Bulk(b) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    /// Returns the integer value, accepting numeric strings as well.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            Frame::Simple(_) | Frame::Bulk(_) => self.as_text()?.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns the raw bytes of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            Frame::Bulk(b) => Some(b.clone()),
            Frame::Simple(s) => Some(Bytes::from(s.clone())),
            _ => None,
        }
    }

    /// Returns the error message if this is an error reply.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Frame::Error(msg) => Some(msg),
            _ => None,
        }
    }
}
