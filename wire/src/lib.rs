//! Wire framing and the typed message codec for a Nakamoto-style P2P
//! protocol: turns a byte stream into [`framer::RawMessage`] frames, and
//! those frames into [`message::Message`] values. Everything above this —
//! the handshake, sync, and relay state machines — lives in the pool crate.
#![warn(missing_docs)]

pub mod framer;
pub mod header;
pub mod inventory;
pub mod message;
pub mod netaddr;
pub mod varint;

pub use framer::{FrameError, FrameSink, Framer, RawMessage, MAX_MESSAGE};
pub use header::BlockHeader;
pub use inventory::{InvType, Inventory};
pub use message::{DecodeError, Message, RejectCode, VersionMessage};
pub use netaddr::NetAddr;
