//! cinder-protocol: reply frames and the framing used on the wire.
//!
//! Client-facing protocol parsing is not part of cinder; clients and peers
//! both speak length-prefixed bincode messages.
//!
//! # quick start
//!
//! ```
//! use cinder_protocol::{cmd_line, Frame};
//!
//! let line = cmd_line(["GET", "foo"]);
//! assert_eq!(line.len(), 2);
//! assert!(Frame::Null.is_null());
//! ```

pub mod types;
pub mod wire;

pub use types::{cmd_line, command_name, CmdLine, Frame};
pub use wire::{read_frame, round_trip, write_frame, MAX_FRAME_SIZE};
