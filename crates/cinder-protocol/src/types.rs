//! Reply frames and command lines.
//!
//! [`Frame`] is the opaque reply type shared by the storage engine, the
//! router and the peer transport. A reply produced on one node travels to
//! another node unchanged, so the enum is serde-serializable.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A command line: element 0 is the command name (case-insensitive),
/// the rest are positional arguments.
pub type CmdLine = Vec<Bytes>;

/// Builds a command line from string-like parts.
///
/// ```
/// use cinder_protocol::cmd_line;
///
/// let line = cmd_line(["SET", "foo", "bar"]);
/// assert_eq!(line.len(), 3);
/// assert_eq!(&line[0][..], b"SET");
/// ```
pub fn cmd_line<I, S>(parts: I) -> CmdLine
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    parts
        .into_iter()
        .map(|p| Bytes::copy_from_slice(p.as_ref()))
        .collect()
}

/// Returns the lower-cased command name of a command line, if any.
pub fn command_name(args: &[Bytes]) -> Option<String> {
    args.first()
        .map(|name| String::from_utf8_lossy(name).to_ascii_lowercase())
}

/// A single reply value.
///
/// Mirrors the RESP3 value types: simple strings, errors, integers,
/// bulk data, arrays, null and maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Short status reply, e.g. `OK`.
    Simple(String),

    /// Error reply. The first word is the error code (`ERR`, `TRYAGAIN`, ...).
    Error(String),

    /// 64-bit signed integer.
    Integer(i64),

    /// Binary-safe string.
    Bulk(Bytes),

    /// Ordered array of frames.
    Array(Vec<Frame>),

    /// Null value.
    Null,

    /// Ordered map of key-value frame pairs.
    Map(Vec<(Frame, Frame)>),
}

impl Frame {
    /// The `OK` status reply.
    pub fn ok() -> Self {
        Frame::Simple("OK".into())
    }

    /// Builds an error reply from a message that already carries its code.
    pub fn error(msg: impl Into<String>) -> Self {
        Frame::Error(msg.into())
    }

    /// Builds a bulk reply from anything convertible to `Bytes`.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(data.into())
    }

    /// Returns `true` if this frame is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Returns `true` if this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Returns the error message, if this is an error reply.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Frame::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_equality() {
        assert_eq!(Frame::ok(), Frame::Simple("OK".into()));
        assert_ne!(Frame::Simple("OK".into()), Frame::Simple("ERR".into()));
        assert_eq!(Frame::Integer(42), Frame::Integer(42));
        assert_eq!(Frame::Null, Frame::Null);
    }

    #[test]
    fn error_helpers() {
        let err = Frame::error("ERR boom");
        assert!(err.is_error());
        assert_eq!(err.error_message(), Some("ERR boom"));
        assert!(!Frame::ok().is_error());
        assert_eq!(Frame::ok().error_message(), None);
    }

    #[test]
    fn integer_helper() {
        assert_eq!(Frame::Integer(7).as_integer(), Some(7));
        assert_eq!(Frame::Null.as_integer(), None);
    }

    #[test]
    fn command_name_is_lowercased() {
        let line = cmd_line(["MSet", "a", "1"]);
        assert_eq!(command_name(&line).as_deref(), Some("mset"));
        assert_eq!(command_name(&[]), None);
    }
}
