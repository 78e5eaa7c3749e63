//! shardctl-protocol: RESP wire codec for talking to cluster nodes.
//!
//! Commands go out as arrays of bulk strings; replies come back as RESP2
//! (what most servers speak by default) or RESP3 frames. Both decode into
//! the same [`Frame`] type.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use shardctl_protocol::{parse_frame, Frame};
//!
//! let (frame, consumed) = parse_frame(b"$-1\r\n").unwrap().unwrap();
//! assert_eq!(frame, Frame::Null);
//! assert_eq!(consumed, 5);
//!
//! let mut buf = BytesMut::new();
//! Frame::command(["CLUSTER", "NODES"]).serialize(&mut buf);
//! assert_eq!(&buf[..], b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nNODES\r\n");
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::parse_frame;
pub use types::Frame;
