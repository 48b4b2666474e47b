//! The command surface host applications use to drive the pool from
//! outside the event loop: asking for peers, forcing a connection, queuing
//! a broadcast. Mirrors the teacher's own `Command` enum in shape, trimmed
//! to the operations this pool actually implements.
use peerpool_common::BlockHash;
use peerpool_wire::Message;

use crate::PeerId;

/// A request from the host application to the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// List currently connected peers.
    GetPeers,
    /// Report the current sync tip.
    GetTip,
    /// Force a connection attempt to the given address.
    Connect(PeerId),
    /// Disconnect a specific peer.
    Disconnect(PeerId),
    /// Broadcast a message to every connected peer.
    Broadcast(Message),
    /// Submit a raw transaction for relay.
    SubmitTransaction(Vec<u8>),
    /// Request the full block for a given hash be fetched, bypassing the
    /// usual inv-driven discovery.
    RequestBlock(BlockHash),
}
