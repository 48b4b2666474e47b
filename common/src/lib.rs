//! Types shared by the wire and peer-pool crates: network parameters, the
//! monotonic local clock, hash newtypes, and a small random-sampling
//! collection. Nothing here knows about sockets, consensus validation, or
//! persistence — those stay in the collaborator traits the pool crate
//! defines.
#![warn(missing_docs)]

pub mod collections;
pub mod hash;
pub mod network;
pub mod time;

pub use hash::{sha256d, BlockHash, Txid};
pub use network::{Height, Network};
pub use time::{AdjustedClock, Clock, LocalDuration, LocalTime};
