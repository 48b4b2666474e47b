//! Trait-only seams for everything this crate treats as an external
//! service: the socket/event loop, the chain, the mempool, the address
//! manager, and the source of randomness. No implementation lives here —
//! a host binary supplies one of each. Keeping these as traits (rather than
//! concrete structs) is what lets the pool stay free of socket code,
//! consensus validation, and persistence, per the scope this crate is built
//! to.
use peerpool_common::{BlockHash, Height, Txid};
use peerpool_wire::BlockHeader;

use crate::error::VerifyError;
use crate::PeerId;

/// The result of asking the loop to write bytes to a peer's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The write failed; the socket should be considered dead.
    Error,
    /// The socket's send buffer is full; the write was not accepted.
    WouldBlock,
    /// The bytes were queued for sending.
    Queued,
}

/// The non-blocking socket/event loop this crate is embedded in. Binding,
/// DNS resolution, and thread/task scheduling all live on the other side of
/// this trait.
pub trait Loop {
    /// Write bytes to a peer's socket, non-blocking.
    fn write(&mut self, addr: PeerId, bytes: &[u8]) -> WriteResult;
    /// Bytes currently queued but not yet flushed to the peer's socket.
    fn buffered(&self, addr: PeerId) -> usize;
}

/// A chain entry: a header plus the height it was accepted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    /// The header.
    pub header: BlockHeader,
    /// Its height in the best chain.
    pub height: Height,
}

/// The consensus chain service: validation, storage, and the header index.
/// Entirely opaque to this crate beyond this interface — block/transaction
/// validation rules are never implemented here.
pub trait Chain {
    /// Current best-chain height.
    fn height(&self) -> Height;
    /// Current best-chain tip.
    fn tip(&self) -> ChainEntry;
    /// Whether the chain considers itself caught up.
    fn synced(&self) -> bool;
    /// Look up a chain entry by hash.
    fn by_hash(&self, hash: &BlockHash) -> Option<ChainEntry>;
    /// A block locator built from the given tip, or the chain's own tip.
    fn get_locator(&self, from: Option<BlockHash>) -> Vec<BlockHash>;
    /// Find the common ancestor a locator implies.
    fn find_locator(&self, locator: &[BlockHash]) -> Option<ChainEntry>;
    /// Submit a block for validation and storage.
    fn add(&mut self, header: BlockHeader, peer: PeerId) -> Result<(), VerifyError>;
    /// Whether this hash is already known, valid or not.
    fn has_hash(&self, hash: &BlockHash) -> bool;
    /// Whether this hash is a known orphan (valid header, unknown parent).
    fn has_orphan(&self, hash: &BlockHash) -> bool;
    /// The deepest known ancestor of an orphan chain.
    fn get_orphan_root(&self, hash: &BlockHash) -> Option<BlockHash>;
    /// Whether this hash was previously marked invalid.
    fn has_invalid(&self, hash: &BlockHash) -> bool;
    /// Sync progress in `[0.0, 1.0]`.
    fn progress(&self) -> f64;
    /// Fetch a full block's header and raw transaction bytes, to serve a
    /// `getdata`/`getblocktxn` request. `None` if the block isn't stored
    /// (pruned, unknown, or still just a header).
    fn get_raw_block(&self, hash: &BlockHash) -> Option<(BlockHeader, Vec<Vec<u8>>)>;
}

/// The mempool service: the set of unconfirmed transactions this node
/// knows about and is willing to relay.
pub trait Mempool {
    /// Look up a transaction by id.
    fn get(&self, txid: &Txid) -> Option<Vec<u8>>;
    /// Whether a transaction is present.
    fn has(&self, txid: &Txid) -> bool;
    /// Whether a transaction was previously rejected and cached as such.
    fn has_reject(&self, txid: &Txid) -> bool;
    /// Whether a transaction is a known orphan (missing an input).
    fn has_orphan(&self, txid: &Txid) -> bool;
    /// Inputs a transaction is missing, if any.
    fn missing(&self, raw_tx: &[u8]) -> Vec<Txid>;
    /// Submit a raw transaction for validation and acceptance.
    fn add(&mut self, raw_tx: &[u8], peer: PeerId) -> Result<Txid, VerifyError>;
    /// All transaction ids currently held.
    fn iter(&self) -> Box<dyn Iterator<Item = Txid> + '_>;
}

/// A candidate peer address, as handed back by the address manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// The candidate's address.
    pub addr: PeerId,
    /// Service bits last advertised for this address.
    pub services: u64,
}

/// The address-manager service: storage, scoring, and selection of peer
/// candidates. Persistence and the tried/new table split are entirely its
/// own concern; this crate only ever calls through this interface.
pub trait AddressManager {
    /// Pick a candidate to dial, if any are available.
    fn get(&mut self) -> Option<Candidate>;
    /// Record a newly learned address, tagged with where it came from.
    fn add(&mut self, addr: PeerId, services: u64, source: PeerId);
    /// Record that we just attempted to dial this address.
    fn mark_attempt(&mut self, addr: PeerId);
    /// Record that a connection to this address succeeded.
    fn mark_success(&mut self, addr: PeerId);
    /// Record that this address's handshake actually completed.
    fn mark_ack(&mut self, addr: PeerId);
    /// Ban an address.
    fn ban(&mut self, addr: PeerId);
    /// Whether an address is currently banned.
    fn is_banned(&self, addr: &PeerId) -> bool;
    /// Mark an address as one of our own listening addresses.
    fn mark_local(&mut self, addr: PeerId);
    /// Whether an address is one of our own.
    fn is_local(&self, addr: &PeerId) -> bool;
    /// Total known addresses.
    fn size(&self) -> usize;
}

/// A source of randomness, threaded through as a trait per the design note
/// that it must stay a per-pool resource rather than process-global state.
/// `fastrand::Rng` implements this directly, which is what `Config`
/// constructs by default.
pub trait Rng {
    /// A uniformly random 32-bit value.
    fn next_u32(&mut self) -> u32;
    /// A uniformly random 64-bit value.
    fn next_u64(&mut self) -> u64;
}

impl Rng for fastrand::Rng {
    fn next_u32(&mut self) -> u32 {
        self.u32(..)
    }

    fn next_u64(&mut self) -> u64 {
        self.u64(..)
    }
}
