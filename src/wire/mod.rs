//! Loopback wire protocol: a length-prefixed frame codec and the socket
//! server built on top of it (§6, §4.11).

pub mod framing;
pub mod mux;

pub use framing::{FrameCodec, FRAME_MAGIC, MAX_FRAME_LEN};
pub use mux::{ConnectionId, Mux, ServerRequest, ServerResponse, StreamId};
