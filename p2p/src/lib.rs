//! Peer pool and per-peer protocol state machine for a Nakamoto-style P2P
//! node: the wire-level plumbing that discovers peers, negotiates sessions,
//! syncs headers and blocks, relays transactions and new blocks, and
//! protects the node from misbehaving peers. Consensus validation,
//! persistence, and sockets themselves stay on the other side of the
//! `collaborators` traits.
#![warn(missing_docs)]

use std::net::SocketAddr;

pub mod bloom;
pub mod chain_sync;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod error;
pub mod nonce;
pub mod output;
pub mod peer;
pub mod pool;
pub mod registry;

/// A peer's identity as far as this crate is concerned: its socket address.
/// Connections are never multiplexed per address, so this doubles as the
/// registry key.
pub type PeerId = SocketAddr;

pub use bloom::BloomFilter;
pub use chain_sync::HeaderSyncChain;
pub use collaborators::{AddressManager, Candidate, Chain, ChainEntry, Loop, Mempool, Rng, WriteResult};
pub use command::Command;
pub use config::{BlockMode, Config, Limits, OnlyNet, Whitelist};
pub use error::{DisconnectReason, VerifyError};
pub use nonce::NonceRegistry;
pub use output::{Event, Io, Outbox};
pub use peer::{Peer, PeerState};
pub use pool::Pool;
pub use registry::PeerRegistry;
