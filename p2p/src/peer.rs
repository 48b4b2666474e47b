//! The per-peer protocol state machine: everything that happens between one
//! TCP connection and the pool — handshake, keep-alive, queueing, flush,
//! stall detection, and ban score. This is the largest single piece of the
//! pool, matching the share the design gives it.
use std::collections::{HashMap, VecDeque};

use peerpool_common::{BlockHash, LocalDuration, LocalTime, Txid};
use peerpool_wire::{BlockHeader, Inventory, Message};

use crate::bloom::BloomFilter;
use crate::config::{Config, BlockMode};
use crate::error::DisconnectReason;
use crate::output::Outbox;
use crate::PeerId;

/// How often a connected peer is pinged.
pub const PING_INTERVAL: LocalDuration = LocalDuration::from_secs(30);
/// How often queued inventory announcements are flushed.
pub const ANNOUNCE_INTERVAL: LocalDuration = LocalDuration::from_secs(5);
/// How often stall detection runs.
pub const STALL_CHECK_INTERVAL: LocalDuration = LocalDuration::from_secs(5);
/// Maximum time a peer may remain outside `CONNECTED` before it's closed.
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);
/// Maximum queued inventory announcements before a forced flush.
pub const ANNOUNCE_QUEUE_LIMIT: usize = 500;
/// Maximum outbound buffered bytes before the connection is considered
/// stalled and closed.
pub const MAX_OUTBOUND_BUFFER: usize = 30 * 1024 * 1024;

const ADDR_FILTER_ELEMENTS: usize = 5_000;
const ADDR_FILTER_FP_RATE: f64 = 0.001;
const INV_FILTER_ELEMENTS: usize = 50_000;
const INV_FILTER_FP_RATE: f64 = 0.000_001;

/// The state a peer connection moves through, in order, on the way to
/// `Connected`, with `Dead` reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Socket connect in flight (outbound only).
    Connecting,
    /// Waiting for the peer's `version` message.
    WaitVersion,
    /// `version` exchanged, waiting for `verack`.
    WaitVerack,
    /// Handshake complete; normal operation.
    Connected,
    /// Connection torn down; all further input is ignored.
    Dead,
}

/// Bookkeeping for a BIP152 compact block this peer sent that's missing
/// some transactions.
#[derive(Debug, Clone)]
pub struct CompactBlockState {
    /// The compact block's header.
    pub header: BlockHeader,
    /// Indexes of transactions still needed to complete the block.
    pub missing: Vec<u64>,
    /// When this compact block round-trip was started.
    pub requested_at: LocalTime,
}

/// One connected (or connecting) remote peer.
#[derive(Debug)]
pub struct Peer {
    /// Numeric id, assigned by the pool at connection time.
    pub id: u64,
    /// The peer's address.
    pub addr: PeerId,
    /// Whether we dialed this peer (`true`) or it dialed us.
    pub outbound: bool,
    /// Whether this is the pool's designated loader peer.
    pub loader: bool,
    /// Current protocol state.
    pub state: PeerState,
    /// The nonce we advertised in our own `version` to this peer.
    pub local_nonce: u64,
    /// Service bits the peer advertised.
    pub services: u64,
    /// Protocol version the peer advertised.
    pub version: i32,
    /// Best height the peer reported.
    pub height: i32,
    /// Peer's free-form user agent string.
    pub user_agent: String,
    /// Whether the peer wants unfiltered inventory relay.
    pub relay: bool,
    /// Whether the peer asked for header-only block announcements.
    pub prefers_headers: bool,
    /// Negotiated compact-block mode, if any (`None` until `sendcmpct`).
    pub compact_mode: Option<u8>,
    /// Whether the peer supports compact blocks carrying witness data.
    pub compact_witness: bool,
    /// Minimum fee rate (sat/kB) the peer wants to see relayed to it.
    pub fee_rate: Option<u64>,

    /// When the connection was initiated.
    pub connect_time: LocalTime,
    /// Last time we sent anything.
    pub last_send: Option<LocalTime>,
    /// Last time we received anything.
    pub last_recv: Option<LocalTime>,
    /// Last time we sent a ping.
    pub last_ping: Option<LocalTime>,
    /// Last time we received a matching pong.
    pub last_pong: Option<LocalTime>,
    /// Lowest observed ping round-trip.
    pub min_ping: Option<LocalDuration>,
    /// When we last asked this peer for blocks (`getblocks`).
    pub gb_time: Option<LocalTime>,
    /// When we last asked this peer for headers (`getheaders`).
    pub gh_time: Option<LocalTime>,
    /// When, as loader, we last made sync progress.
    pub block_time: Option<LocalTime>,
    /// Outstanding ping challenge nonce; `0` means none outstanding.
    pub ping_nonce: u64,

    /// Accumulated misbehavior score.
    pub ban_score: u32,
    /// Whether this peer is actively driving sync.
    pub syncing: bool,
    /// Whether we've sent this peer our own address.
    pub sent_addr: bool,
    /// Whether we're waiting on a `getaddr` we sent.
    pub getting_addr: bool,
    /// Whether this peer has sent us a `getaddr`.
    pub sent_getaddr: bool,

    /// De-duplication filter over addresses announced to this peer.
    pub addr_filter: BloomFilter,
    /// De-duplication filter over inventory announced to this peer.
    pub inv_filter: BloomFilter,

    /// Outstanding block requests, by hash, with their deadline.
    pub block_requests: HashMap<BlockHash, LocalTime>,
    /// Outstanding transaction requests, by hash, with their deadline.
    pub tx_requests: HashMap<Txid, LocalTime>,
    /// In-flight compact blocks, by hash.
    pub compact_requests: HashMap<BlockHash, CompactBlockState>,

    /// Queued outbound inventory announcements.
    pub inv_queue: VecDeque<Inventory>,
    /// Queued outbound blocks/transactions to serve on request.
    pub serve_queue: VecDeque<Message>,

    last_announce_flush: LocalTime,
    last_stall_check: LocalTime,
}

impl Peer {
    /// Construct a new peer in the state appropriate to its direction:
    /// outbound peers start `Connecting` (the socket dial is still in
    /// flight), inbound peers start `WaitVersion` immediately.
    pub fn new(id: u64, addr: PeerId, outbound: bool, local_nonce: u64, now: LocalTime) -> Self {
        Self {
            id,
            addr,
            outbound,
            loader: false,
            state: if outbound { PeerState::Connecting } else { PeerState::WaitVersion },
            local_nonce,
            services: 0,
            version: 0,
            height: 0,
            user_agent: String::new(),
            relay: true,
            prefers_headers: false,
            compact_mode: None,
            compact_witness: false,
            fee_rate: None,
            connect_time: now,
            last_send: None,
            last_recv: None,
            last_ping: None,
            last_pong: None,
            min_ping: None,
            gb_time: None,
            gh_time: None,
            block_time: None,
            ping_nonce: 0,
            ban_score: 0,
            syncing: false,
            sent_addr: false,
            getting_addr: false,
            sent_getaddr: false,
            addr_filter: BloomFilter::new(ADDR_FILTER_ELEMENTS, ADDR_FILTER_FP_RATE, id as u32),
            inv_filter: BloomFilter::new(INV_FILTER_ELEMENTS, INV_FILTER_FP_RATE, id as u32),
            block_requests: HashMap::new(),
            tx_requests: HashMap::new(),
            compact_requests: HashMap::new(),
            inv_queue: VecDeque::new(),
            serve_queue: VecDeque::new(),
            last_announce_flush: now,
            last_stall_check: now,
        }
    }

    /// The socket connect attempt succeeded; an outbound peer moves on to
    /// waiting for the remote's `version`.
    pub fn attempted(&mut self) {
        if self.state == PeerState::Connecting {
            self.state = PeerState::WaitVersion;
        }
    }

    /// Whether this peer has completed its handshake.
    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    /// Whether this peer is past the point of processing any input.
    pub fn is_dead(&self) -> bool {
        self.state == PeerState::Dead
    }

    /// Validate a received `version` against the handshake rules, in the
    /// order specified: nonce collision (both directions), then, for
    /// outbound peers only, minimum version, required services,
    /// checkpoint-sync version floor, witness service bit, and a soft
    /// compact-block-witness warning. An inbound peer is only ever closed
    /// for a self-connection; this crate dials outbound connections to
    /// peers it chooses, so the version/service/checkpoint/witness floor
    /// only makes sense to enforce on the peers we picked.
    /// Any hard failure is returned as the `DisconnectReason` that should
    /// close the connection; the caller is responsible for actually
    /// closing it.
    #[allow(clippy::too_many_arguments)]
    pub fn validate_handshake(
        nonce_collision: bool,
        self_connect_allowed: bool,
        outbound: bool,
        peer_version: i32,
        peer_services: u64,
        checkpoints_enabled: bool,
        required_services: u64,
        bip152_enabled: bool,
        compact_witness: bool,
    ) -> Result<(), DisconnectReason> {
        if nonce_collision && !self_connect_allowed {
            return Err(DisconnectReason::SelfConnection);
        }
        if !outbound {
            return Ok(());
        }
        if peer_version < crate::config::MIN_VERSION {
            return Err(DisconnectReason::PeerProtocolVersion);
        }
        if peer_services & required_services != required_services {
            return Err(DisconnectReason::PeerServices);
        }
        if checkpoints_enabled && peer_version < crate::config::HEADERS_VERSION {
            return Err(DisconnectReason::PeerProtocolVersion);
        }
        if peer_services & peerpool_wire::netaddr::services::WITNESS == 0 {
            return Err(DisconnectReason::PeerServices);
        }
        if bip152_enabled && !compact_witness {
            log::warn!(target: "p2p", "peer does not support compact-block witness data");
        }
        Ok(())
    }

    /// Queue a message for delivery to this peer.
    pub fn send(&mut self, outbox: &mut Outbox, message: &Message, now: LocalTime) {
        outbox.message(self.addr, message);
        self.last_send = Some(now);
    }

    /// Record that a message was just received from this peer.
    pub fn mark_received(&mut self, now: LocalTime) {
        self.last_recv = Some(now);
    }

    /// Queue an inventory announcement, deduplicated through the inventory
    /// filter. Block announcements bypass the periodic flush entirely and
    /// go out immediately, matching the "or immediately for block
    /// announcements" flush rule.
    pub fn announce(&mut self, inv: Inventory, outbox: &mut Outbox, now: LocalTime) {
        if self.inv_filter.contains(&inv.hash) {
            return;
        }
        self.inv_filter.insert(&inv.hash);
        if inv.inv_type == peerpool_wire::InvType::Block {
            self.send(outbox, &Message::Inv(vec![inv]), now);
            return;
        }
        self.inv_queue.push_back(inv);
        if self.inv_queue.len() >= ANNOUNCE_QUEUE_LIMIT {
            self.flush_announcements(outbox, now);
        }
    }

    /// Flush any queued inventory announcements as a single `inv` message.
    pub fn flush_announcements(&mut self, outbox: &mut Outbox, now: LocalTime) {
        if self.inv_queue.is_empty() {
            return;
        }
        let batch: Vec<_> = self.inv_queue.drain(..).collect();
        self.send(outbox, &Message::Inv(batch), now);
    }

    /// Flush anything queued in the serve queue (blocks/transactions the
    /// peer requested via `getdata`).
    pub fn flush_serve_queue(&mut self, outbox: &mut Outbox, now: LocalTime) {
        while let Some(message) = self.serve_queue.pop_front() {
            self.send(outbox, &message, now);
        }
    }

    /// Register a pending block request and send the `getdata` for it.
    /// Returns `false` (and does nothing) if the per-peer in-flight cap is
    /// already reached.
    pub fn request_block(&mut self, hash: BlockHash, now: LocalTime, deadline: LocalTime, outbox: &mut Outbox, max_in_flight: usize) -> bool {
        if self.block_requests.len() >= max_in_flight {
            return false;
        }
        self.block_requests.insert(hash, deadline);
        self.send(outbox, &Message::GetData(vec![Inventory::block(hash)]), now);
        true
    }

    /// Register a pending transaction request and send the `getdata` for
    /// it.
    pub fn request_tx(&mut self, txid: Txid, now: LocalTime, deadline: LocalTime, outbox: &mut Outbox, max_in_flight: usize) -> bool {
        if self.tx_requests.len() >= max_in_flight {
            return false;
        }
        self.tx_requests.insert(txid, deadline);
        self.send(outbox, &Message::GetData(vec![Inventory::tx(txid)]), now);
        true
    }

    /// Add to the ban score; returns whether the peer has now crossed the
    /// ban threshold (score never decreases, per invariant).
    pub fn increase_ban(&mut self, delta: u32, threshold: u32) -> bool {
        self.ban_score = self.ban_score.saturating_add(delta);
        self.ban_score >= threshold
    }

    /// Tear down the connection. Idempotent: calling this on an already
    /// `Dead` peer does nothing.
    pub fn close(&mut self, outbox: &mut Outbox, reason: DisconnectReason) {
        if self.state == PeerState::Dead {
            return;
        }
        self.state = PeerState::Dead;
        outbox.disconnect(self.addr, reason);
    }

    /// Run the per-tick duties: handshake-timeout check, ping scheduling,
    /// periodic announce/serve-queue flush, stall detection, and the
    /// outbound-buffer drain check. `buffered` is the loop-reported byte
    /// count still queued on this peer's socket.
    pub fn tick(
        &mut self,
        now: LocalTime,
        config: &Config,
        buffered: usize,
        synced: bool,
        rng: &mut impl crate::collaborators::Rng,
        outbox: &mut Outbox,
    ) {
        if self.is_dead() {
            return;
        }

        if self.state != PeerState::Connected {
            if now > self.connect_time + HANDSHAKE_TIMEOUT {
                self.close(outbox, DisconnectReason::ConnectionStall);
            }
            return;
        }

        if now >= self.last_ping.unwrap_or(LocalTime::default()) + PING_INTERVAL
            && self.ping_nonce == 0
        {
            let nonce = rng.next_u64();
            self.ping_nonce = nonce;
            self.last_ping = Some(now);
            self.send(outbox, &Message::Ping(nonce), now);
        }

        if now >= self.last_announce_flush + ANNOUNCE_INTERVAL {
            self.flush_announcements(outbox, now);
            self.last_announce_flush = now;
        }

        if now >= self.last_stall_check + STALL_CHECK_INTERVAL {
            self.last_stall_check = now;
            if let Some(reason) = self.detect_stall(now, synced) {
                self.close(outbox, reason);
                return;
            }
        }

        self.flush_serve_queue(outbox, now);

        if buffered > MAX_OUTBOUND_BUFFER {
            self.close(outbox, DisconnectReason::ResourceExhausted("outbound buffer over cap"));
        }
    }

    /// Stall detection, exactly as specified: inventory/headers/loader
    /// stalls, then per-request and per-compact-block deadlines, then the
    /// broader send/recv/ping liveness window.
    fn detect_stall(&self, now: LocalTime, synced: bool) -> Option<DisconnectReason> {
        if !synced {
            if let Some(gb_time) = self.gb_time {
                if now > gb_time + LocalDuration::from_secs(30) {
                    return Some(DisconnectReason::PeerTimeout("inventory stall"));
                }
            }
        }
        if let Some(gh_time) = self.gh_time {
            if now > gh_time + LocalDuration::from_secs(60) {
                return Some(DisconnectReason::PeerTimeout("headers stall"));
            }
        }
        if self.loader && !synced {
            if let Some(block_time) = self.block_time {
                if now > block_time + LocalDuration::from_secs(120) {
                    return Some(DisconnectReason::PeerTimeout("loader block stall"));
                }
            }
        }
        if synced || !self.syncing {
            let request_deadline = LocalDuration::from_secs(120);
            if self.block_requests.values().any(|&deadline| now > deadline + request_deadline) {
                return Some(DisconnectReason::PeerTimeout("block request stall"));
            }
            if self.tx_requests.values().any(|&deadline| now > deadline + request_deadline) {
                return Some(DisconnectReason::PeerTimeout("tx request stall"));
            }
            let compact_deadline = LocalDuration::from_secs(30);
            if self
                .compact_requests
                .values()
                .any(|state| now > state.requested_at + compact_deadline)
            {
                return Some(DisconnectReason::PeerTimeout("compact block stall"));
            }
        }
        if now > self.connect_time + LocalDuration::from_secs(60) {
            if self.last_send.is_none() || self.last_recv.is_none() {
                return Some(DisconnectReason::PeerTimeout("never sent or received"));
            }
            let window = LocalDuration::from_mins(20);
            let mult: u64 = if self.min_ping.is_some() { 1 } else { 4 };
            if let Some(last_send) = self.last_send {
                if now > last_send + window {
                    return Some(DisconnectReason::PeerTimeout("send window exceeded"));
                }
            }
            if let Some(last_recv) = self.last_recv {
                if now > last_recv + window * mult {
                    return Some(DisconnectReason::PeerTimeout("recv window exceeded"));
                }
            }
            if self.ping_nonce != 0 {
                if let Some(last_ping) = self.last_ping {
                    if now > last_ping + window {
                        return Some(DisconnectReason::PeerTimeout("ping window exceeded"));
                    }
                }
            }
        }
        None
    }

    /// Handle a `ping`. Pre-BIP31 peers (version < 60000) send pings with
    /// no expectation of a reply; everything else gets an echoing `pong`.
    pub fn receive_ping(&mut self, nonce: u64, outbox: &mut Outbox, now: LocalTime) {
        if self.version < 60_000 {
            return;
        }
        self.send(outbox, &Message::Pong(nonce), now);
    }

    /// Handle a `pong`. Updates `last_pong` and `min_ping` if the nonce
    /// matches our outstanding challenge; mismatches are logged, not
    /// scored.
    pub fn receive_pong(&mut self, nonce: u64, now: LocalTime) {
        if self.ping_nonce == 0 || nonce != self.ping_nonce {
            log::debug!(target: "p2p", "peer {} sent an unsolicited or mismatched pong", self.id);
            return;
        }
        self.last_pong = Some(now);
        if let Some(last_ping) = self.last_ping {
            let rtt = now - last_ping;
            self.min_ping = Some(self.min_ping.map_or(rtt, |m| m.min(rtt)));
        }
        self.ping_nonce = 0;
    }

    /// Whether this peer, as currently known, is eligible to drive sync:
    /// connected, advertising the required services, and either already
    /// synced or the designated loader.
    pub fn is_syncable(&self, we_are_synced: bool, required_services: u64) -> bool {
        self.is_connected()
            && self.services & required_services == required_services
            && (we_are_synced || self.loader)
    }

    /// Whether, given the configured mode, this peer should be sent blocks
    /// as compact blocks rather than full blocks.
    pub fn wants_compact_blocks(&self, mode: BlockMode) -> bool {
        matches!(mode, BlockMode::Compact) && self.compact_mode == Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn addr() -> PeerId {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 8333))
    }

    #[test]
    fn outbound_peer_starts_connecting_inbound_starts_wait_version() {
        let out = Peer::new(1, addr(), true, 1, LocalTime::default());
        let inb = Peer::new(2, addr(), false, 2, LocalTime::default());
        assert_eq!(out.state, PeerState::Connecting);
        assert_eq!(inb.state, PeerState::WaitVersion);
    }

    #[test]
    fn ban_score_saturates_and_never_decreases() {
        let mut peer = Peer::new(1, addr(), true, 1, LocalTime::default());
        assert!(!peer.increase_ban(50, 100));
        assert_eq!(peer.ban_score, 50);
        assert!(peer.increase_ban(60, 100));
        assert_eq!(peer.ban_score, 110);
    }

    #[test]
    fn close_is_idempotent() {
        let mut peer = Peer::new(1, addr(), true, 1, LocalTime::default());
        let mut outbox = Outbox::new(peerpool_common::Network::Regtest);
        peer.close(&mut outbox, DisconnectReason::Command);
        peer.close(&mut outbox, DisconnectReason::Command);
        assert_eq!(outbox.count(), 1);
    }

    #[test]
    fn handshake_rejects_self_connection_unless_allowed() {
        let err = Peer::validate_handshake(true, false, true, 70015, peerpool_wire::netaddr::services::NETWORK, false, 0, false, false);
        assert_eq!(err, Err(DisconnectReason::SelfConnection));
        let ok = Peer::validate_handshake(true, true, false, 70015, peerpool_wire::netaddr::services::NETWORK, false, 0, false, false);
        assert_eq!(ok, Ok(()));
    }

    #[test]
    fn handshake_rejects_old_protocol_versions() {
        let err = Peer::validate_handshake(false, true, true, 1, peerpool_wire::netaddr::services::NETWORK, false, 0, false, false);
        assert_eq!(err, Err(DisconnectReason::PeerProtocolVersion));
    }

    #[test]
    fn inbound_handshake_skips_the_outbound_only_checks() {
        let ok = Peer::validate_handshake(false, true, false, 1, 0, true, peerpool_wire::netaddr::services::NETWORK, false, false);
        assert_eq!(ok, Ok(()));
    }

    #[test]
    fn outbound_handshake_requires_the_witness_bit() {
        let err = Peer::validate_handshake(
            false,
            true,
            true,
            70015,
            peerpool_wire::netaddr::services::NETWORK,
            false,
            peerpool_wire::netaddr::services::NETWORK,
            false,
            false,
        );
        assert_eq!(err, Err(DisconnectReason::PeerServices));
        let ok = Peer::validate_handshake(
            false,
            true,
            true,
            70015,
            peerpool_wire::netaddr::services::NETWORK | peerpool_wire::netaddr::services::WITNESS,
            false,
            peerpool_wire::netaddr::services::NETWORK,
            false,
            false,
        );
        assert_eq!(ok, Ok(()));
    }

    #[test]
    fn ping_before_bip31_is_not_answered() {
        let mut peer = Peer::new(1, addr(), true, 1, LocalTime::default());
        peer.version = 50_000;
        let mut outbox = Outbox::new(peerpool_common::Network::Regtest);
        peer.receive_ping(7, &mut outbox, LocalTime::default());
        assert_eq!(outbox.count(), 0);
    }

    #[test]
    fn matching_pong_clears_challenge_and_updates_min_ping() {
        let mut peer = Peer::new(1, addr(), true, 1, LocalTime::default());
        peer.ping_nonce = 99;
        peer.last_ping = Some(LocalTime::from_secs(10));
        peer.receive_pong(99, LocalTime::from_secs(11));
        assert_eq!(peer.ping_nonce, 0);
        assert_eq!(peer.min_ping, Some(LocalDuration::from_secs(1)));
    }

    #[test]
    fn headers_stall_closes_after_sixty_seconds() {
        let mut peer = Peer::new(1, addr(), true, 1, LocalTime::default());
        peer.state = PeerState::Connected;
        peer.gh_time = Some(LocalTime::from_secs(0));
        let reason = peer.detect_stall(LocalTime::from_secs(61), true);
        assert_eq!(reason, Some(DisconnectReason::PeerTimeout("headers stall")));
    }
}
