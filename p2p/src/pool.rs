//! The pool: the single state machine tying every peer, the header-sync
//! chain, and the outbox together. Mirrors the shape of the teacher's own
//! `StateMachine` — a struct that touches the outside world only through
//! the `collaborators` traits and the `Outbox` it drains as an
//! `Iterator<Item = Io>` after every call. Nothing in this module blocks,
//! spawns a thread, or opens a socket.
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use peerpool_common::{BlockHash, LocalDuration, LocalTime, Txid};
use peerpool_wire::{
    BlockHeader, FrameError, FrameSink, Framer, InvType, Inventory, Message, NetAddr, RawMessage,
    VersionMessage,
};

use crate::chain_sync::HeaderSyncChain;
use crate::collaborators::{AddressManager, Chain, Loop, Mempool, Rng};
use crate::command::Command;
use crate::config::{Config, OnlyNet};
use crate::error::{DisconnectReason, VerifyError};
use crate::nonce::NonceRegistry;
use crate::output::{Event, Io, Outbox};
use crate::peer::{Peer, PeerState};
use crate::registry::PeerRegistry;
use crate::PeerId;

/// How often the pool tries to bring outbound connections up to its target.
const OUTBOUND_FILL_INTERVAL: LocalDuration = LocalDuration::from_secs(3);
/// Per-request deadline stagger, so a burst of requests issued in the same
/// tick don't all expire at exactly the same instant.
const REQUEST_STAGGER: LocalDuration = LocalDuration::from_millis(100);
/// Base deadline for a block or transaction request.
const REQUEST_DEADLINE: LocalDuration = LocalDuration::from_secs(120);
/// Ban-score delta applied for each frame the wire parser had to discard.
const PARSE_ERROR_BAN_SCORE: u32 = 10;
/// Ban-score delta for a message sent outside the state that permits it.
const PROTOCOL_VIOLATION_BAN_SCORE: u32 = 10;
/// A compact block whose missing transactions haven't arrived within this
/// long falls back to a full-block request rather than waiting for
/// `peer::detect_stall`'s harder 30-second disconnect threshold.
const COMPACT_FALLBACK: LocalDuration = LocalDuration::from_secs(10);
/// How many blocks behind the tip a `getblocktxn` request may still name.
const MAX_GETBLOCKTXN_DEPTH: u32 = 15;

const LOCAL_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// The peer pool: every connected/connecting peer, the header-sync chain,
/// pool-wide in-flight request bookkeeping, and the collaborators it drives.
/// Generic over the four collaborator traits so a host can plug in its own
/// chain, mempool, address manager, and RNG without this crate depending on
/// their concrete types.
pub struct Pool<C, M, A, R> {
    config: Config,
    chain: C,
    mempool: M,
    addrman: A,
    rng: R,
    registry: PeerRegistry,
    nonces: NonceRegistry,
    outbox: Outbox,
    framers: HashMap<PeerId, Framer>,
    sync_chain: Option<HeaderSyncChain>,
    synced: bool,
    next_id: u64,
    last_outbound_fill: LocalTime,
    block_map: HashMap<BlockHash, PeerId>,
    tx_map: HashMap<Txid, PeerId>,
    compact_map: HashSet<BlockHash>,
}

impl<C: Chain, M: Mempool, A: AddressManager, R: Rng> Pool<C, M, A, R> {
    /// Construct a pool around the given collaborators. Call [`Pool::open`]
    /// once the host is ready to start driving it.
    pub fn new(config: Config, chain: C, mempool: M, addrman: A, rng: R, now: LocalTime) -> Self {
        let outbox = Outbox::new(config.network);
        Self {
            config,
            chain,
            mempool,
            addrman,
            rng,
            registry: PeerRegistry::new(),
            nonces: NonceRegistry::new(),
            outbox,
            framers: HashMap::new(),
            sync_chain: None,
            synced: false,
            next_id: 1,
            last_outbound_fill: now,
            block_map: HashMap::new(),
            tx_map: HashMap::new(),
            compact_map: HashSet::new(),
        }
    }

    /// Latch the pool's sync status from the chain, start the header-sync
    /// chain if checkpoint gating is enabled, and schedule the first tick.
    pub fn open(&mut self, now: LocalTime) {
        self.synced = self.chain.synced();
        if self.config.checkpoints_enabled {
            let tip = self.chain.tip();
            self.sync_chain =
                HeaderSyncChain::new(tip.header.block_hash(), tip.height, self.config.network.checkpoints());
        }
        self.last_outbound_fill = now;
        self.outbox.set_timer(OUTBOUND_FILL_INTERVAL);
    }

    /// Currently registered peers, in connection order.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.registry.iter()
    }

    /// Register a freshly accepted inbound connection.
    pub fn accept(&mut self, addr: PeerId, now: LocalTime) {
        if self.registry.len() >= self.config.max_inbound + self.config.max_outbound {
            return;
        }
        if self.addrman.is_banned(&addr) {
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        let nonce = self.nonces.alloc(&mut self.rng);
        let peer = Peer::new(id, addr, false, nonce, now);
        if self.registry.add(peer).is_ok() {
            self.framers.insert(addr, Framer::new(self.config.network.magic()));
        } else {
            self.nonces.remove(nonce);
        }
    }

    /// Register and dial a new outbound connection.
    pub fn dial(&mut self, addr: PeerId, now: LocalTime) {
        if self.registry.has(&addr) || self.addrman.is_local(&addr) {
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        let nonce = self.nonces.alloc(&mut self.rng);
        let peer = Peer::new(id, addr, true, nonce, now);
        if self.registry.add(peer).is_ok() {
            self.framers.insert(addr, Framer::new(self.config.network.magic()));
            self.addrman.mark_attempt(addr);
            self.outbox.connect(addr);
        } else {
            self.nonces.remove(nonce);
        }
    }

    /// The loop reports a dialed socket as connected: send our own `version`.
    pub fn connected(&mut self, addr: PeerId, now: LocalTime) {
        let version = self.make_version(addr, now);
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.attempted();
            peer.send(&mut self.outbox, &Message::Version(version), now);
        }
        self.addrman.mark_success(addr);
    }

    /// The loop reports a peer's socket as gone.
    pub fn disconnected(&mut self, addr: PeerId, now: LocalTime) {
        self.close_peer(addr, DisconnectReason::Other("connection closed"), now);
    }

    /// Tear down a peer's connection for the given reason and forget it.
    pub fn close_peer(&mut self, addr: PeerId, reason: DisconnectReason, now: LocalTime) {
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.close(&mut self.outbox, reason.clone());
        }
        self.forget(addr, reason, now);
    }

    /// Bump a peer's ban score; closes and bans the address if it crosses
    /// the configured threshold. Whitelisted addresses are exempt.
    pub fn misbehave(&mut self, addr: PeerId, delta: u32, now: LocalTime) {
        if delta == 0 || self.config.whitelist.contains(&addr) {
            return;
        }
        let threshold = self.config.limits.ban_threshold;
        let crossed = self.registry.get_mut(&addr).map(|p| p.increase_ban(delta, threshold));
        if crossed == Some(true) {
            self.outbox.event(Event::PeerBanned { addr });
            self.addrman.ban(addr);
            self.close_peer(addr, DisconnectReason::PeerMisbehaving("ban score threshold exceeded"), now);
        }
    }

    /// Feed freshly received bytes for a peer through its framer, and
    /// dispatch every message recognized. Parse errors score the peer's ban
    /// score; they never stop the rest of the buffer from being processed.
    pub fn received(&mut self, addr: PeerId, bytes: &[u8], now: LocalTime) {
        if !self.registry.has(&addr) {
            return;
        }
        let magic = self.config.network.magic();
        let framer = self.framers.entry(addr).or_insert_with(|| Framer::new(magic));
        let mut collector = Collector::default();
        framer.feed(bytes, &mut collector);
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.mark_received(now);
        }
        for _ in &collector.errors {
            self.misbehave(addr, PARSE_ERROR_BAN_SCORE, now);
            if !self.registry.has(&addr) {
                return;
            }
        }
        for raw in collector.messages {
            match Message::decode(&raw.command, &raw.payload) {
                Ok(message) => {
                    self.dispatch(addr, message, now);
                    if !self.registry.has(&addr) {
                        return;
                    }
                }
                Err(_) => {
                    self.misbehave(addr, PARSE_ERROR_BAN_SCORE, now);
                    if !self.registry.has(&addr) {
                        return;
                    }
                }
            }
        }
    }

    /// Drive a host command (a request from outside the event loop).
    pub fn command(&mut self, command: Command, now: LocalTime) {
        match command {
            Command::GetPeers => {}
            Command::GetTip => {
                self.outbox.event(Event::HeightChanged { height: self.chain.height() });
            }
            Command::Connect(addr) => self.dial(addr, now),
            Command::Disconnect(addr) => self.close_peer(addr, DisconnectReason::Command, now),
            Command::Broadcast(message) => {
                let addrs: Vec<PeerId> =
                    self.registry.iter().filter(|p| p.is_connected()).map(|p| p.addr).collect();
                for addr in addrs {
                    if let Some(peer) = self.registry.get_mut(&addr) {
                        peer.send(&mut self.outbox, &message, now);
                    }
                }
            }
            Command::SubmitTransaction(raw) => {
                if let Ok(txid) = self.mempool.add(&raw, LOCAL_ADDR) {
                    self.announce_tx(txid, LOCAL_ADDR, now);
                }
            }
            Command::RequestBlock(hash) => self.request_block_global(hash, now),
        }
    }

    /// Run the per-tick duties: per-peer `tick`, dead-peer reaping, compact
    /// block fallback, and outbound connection refilling.
    pub fn tick(&mut self, now: LocalTime, loop_: &impl Loop) {
        self.synced = self.chain.synced();
        let synced = self.synced;
        let config = self.config.clone();
        let addrs: Vec<PeerId> = self.registry.iter().map(|p| p.addr).collect();
        for addr in addrs {
            let buffered = loop_.buffered(addr);
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.tick(now, &config, buffered, synced, &mut self.rng, &mut self.outbox);
            }
        }
        self.reap_dead_peers(now);
        self.reap_compact_timeouts(now);
        if now >= self.last_outbound_fill + OUTBOUND_FILL_INTERVAL {
            self.last_outbound_fill = now;
            self.fill_outbound(now);
        }
        self.outbox.set_timer(crate::peer::STALL_CHECK_INTERVAL);
    }

    fn make_version(&mut self, addr: PeerId, now: LocalTime) -> VersionMessage {
        // Reuse the nonce already allocated for this peer at connection time
        // rather than minting a second one: a live peer owns exactly one
        // nonce in `self.nonces`, and this is the value `nonces.has` checks
        // an echoed nonce against to detect self-connection.
        let nonce = self.registry.get(&addr).map_or(0, |p| p.local_nonce);
        // The host's own externally-visible address isn't known to this
        // crate; the zero address stands in, matching what many lightweight
        // nodes fill the `version` address fields with.
        let receiver = NetAddr::new(addr, 0);
        let sender = NetAddr::new(addr, 0);
        VersionMessage {
            version: crate::config::PROTOCOL_VERSION,
            services: self.config.required_services,
            timestamp: (now.as_millis() / 1000) as i64,
            receiver,
            sender,
            nonce,
            user_agent: "/peerpool:0.1.0/".to_string(),
            start_height: self.chain.height() as i32,
            relay: true,
        }
    }

    fn forget(&mut self, addr: PeerId, reason: DisconnectReason, now: LocalTime) {
        let Some(peer) = self.registry.remove(&addr) else { return };
        self.framers.remove(&addr);
        self.nonces.remove(peer.local_nonce);
        self.block_map.retain(|_, v| *v != addr);
        self.tx_map.retain(|_, v| *v != addr);
        for hash in peer.compact_requests.keys() {
            self.compact_map.remove(hash);
        }
        self.outbox.event(Event::PeerDisconnected { addr, reason });
        let _ = now;
    }

    fn reap_dead_peers(&mut self, now: LocalTime) {
        let dead: Vec<PeerId> = self.registry.iter().filter(|p| p.is_dead()).map(|p| p.addr).collect();
        for addr in dead {
            self.forget(addr, DisconnectReason::ConnectionStall, now);
        }
    }

    /// A compact block still missing transactions after `COMPACT_FALLBACK`
    /// falls back to a full-block request rather than waiting for the
    /// harder stall timeout to disconnect the peer outright.
    fn reap_compact_timeouts(&mut self, now: LocalTime) {
        let mut expired = Vec::new();
        for peer in self.registry.iter() {
            for (hash, state) in &peer.compact_requests {
                if now > state.requested_at + COMPACT_FALLBACK {
                    expired.push((peer.addr, *hash));
                }
            }
        }
        for (addr, hash) in expired {
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.compact_requests.remove(&hash);
            }
            self.compact_map.remove(&hash);
            self.misbehave(addr, PARSE_ERROR_BAN_SCORE, now);
            self.request_block_global(hash, now);
        }
    }

    fn pick_candidate(&mut self) -> Option<PeerId> {
        for _ in 0..8 {
            let candidate = self.addrman.get()?;
            if self.registry.has(&candidate.addr) {
                continue;
            }
            if self.config.required_services != 0
                && candidate.services & self.config.required_services != self.config.required_services
            {
                continue;
            }
            match self.config.only_net {
                OnlyNet::Ipv4 if !candidate.addr.is_ipv4() => continue,
                OnlyNet::Ipv6 if !candidate.addr.is_ipv6() => continue,
                _ => {}
            }
            return Some(candidate.addr);
        }
        None
    }

    fn fill_outbound(&mut self, now: LocalTime) {
        if self.registry.loader().is_none() {
            let candidate = self.registry.iter().find(|p| p.outbound && p.is_connected()).map(|p| p.addr);
            if let Some(addr) = candidate {
                self.registry.set_loader(addr);
                self.send_sync(addr, now);
            }
        }
        while self.registry.outbound() < self.config.max_outbound {
            let Some(addr) = self.pick_candidate() else { break };
            self.dial(addr, now);
        }
    }

    fn pick_request_peer(&self) -> Option<PeerId> {
        if let Some(loader) = self.registry.loader() {
            if self.registry.get(&loader).is_some_and(Peer::is_connected) {
                return Some(loader);
            }
        }
        self.registry.iter().find(|p| p.is_connected()).map(|p| p.addr)
    }

    fn request_block_global(&mut self, hash: BlockHash, now: LocalTime) {
        if self.chain.has_hash(&hash) || self.block_map.contains_key(&hash) {
            return;
        }
        let Some(addr) = self.pick_request_peer() else { return };
        let deadline = now + REQUEST_DEADLINE + REQUEST_STAGGER * (self.block_map.len() as u64);
        if let Some(peer) = self.registry.get_mut(&addr) {
            if peer.request_block(hash, now, deadline, &mut self.outbox, self.config.limits.max_blocks_in_flight) {
                self.block_map.insert(hash, addr);
            }
        }
    }

    fn request_tx_global(&mut self, txid: Txid, now: LocalTime) {
        if self.mempool.has(&txid) || self.tx_map.contains_key(&txid) {
            return;
        }
        let Some(addr) = self.pick_request_peer() else { return };
        let deadline = now + REQUEST_DEADLINE + REQUEST_STAGGER * (self.tx_map.len() as u64);
        if let Some(peer) = self.registry.get_mut(&addr) {
            if peer.request_tx(txid, now, deadline, &mut self.outbox, self.config.limits.max_txs_in_flight) {
                self.tx_map.insert(txid, addr);
            }
        }
    }

    /// Headers while checkpoint-gated sync is still in progress, full-block
    /// `getblocks` once the header chain has caught up past the final
    /// checkpoint (or checkpoint gating was never enabled at all).
    fn send_sync(&mut self, addr: PeerId, now: LocalTime) {
        let locator = self.chain.get_locator(None);
        let checkpoint_gated = self.sync_chain.is_some();
        let message = if checkpoint_gated {
            Message::GetHeaders {
                version: crate::config::PROTOCOL_VERSION as u32,
                locator_hashes: locator,
                stop_hash: self.chain.tip().header.block_hash(),
            }
        } else {
            Message::GetBlocks {
                version: crate::config::PROTOCOL_VERSION as u32,
                locator_hashes: locator,
                stop_hash: BlockHash::ZERO,
            }
        };
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.syncing = true;
            peer.block_time = Some(now);
            if checkpoint_gated {
                peer.gh_time = Some(now);
            } else {
                peer.gb_time = Some(now);
            }
            peer.send(&mut self.outbox, &message, now);
        }
    }

    fn resync(&mut self, force: bool, now: LocalTime) {
        if self.chain.synced() && !force {
            return;
        }
        if let Some(loader) = self.registry.loader() {
            self.send_sync(loader, now);
        }
    }

    fn send_getblocks_to(&mut self, addr: PeerId, stop_hash: BlockHash, now: LocalTime) {
        let locator = self.chain.get_locator(None);
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.gb_time = Some(now);
            peer.send(
                &mut self.outbox,
                &Message::GetBlocks {
                    version: crate::config::PROTOCOL_VERSION as u32,
                    locator_hashes: locator,
                    stop_hash,
                },
                now,
            );
        }
    }

    /// The hashContinue trick: resume a `getblocks`-mode sync from a hash
    /// the peer just told us we already have, rather than waiting for it
    /// to show up in another unsolicited `inv`.
    fn continue_getblocks(&mut self, addr: PeerId, from: BlockHash, now: LocalTime) {
        let locator = self.chain.get_locator(Some(from));
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.gb_time = Some(now);
            peer.send(
                &mut self.outbox,
                &Message::GetBlocks {
                    version: crate::config::PROTOCOL_VERSION as u32,
                    locator_hashes: locator,
                    stop_hash: BlockHash::ZERO,
                },
                now,
            );
        }
    }

    fn dispatch(&mut self, addr: PeerId, message: Message, now: LocalTime) {
        let state = match self.registry.get(&addr) {
            Some(peer) => peer.state,
            None => return,
        };
        if state != PeerState::Connected {
            let expected = matches!(
                (&state, &message),
                (PeerState::WaitVersion, Message::Version(_)) | (PeerState::WaitVerack, Message::Verack)
            );
            if !expected {
                self.misbehave(addr, PROTOCOL_VIOLATION_BAN_SCORE, now);
                return;
            }
        }
        match message {
            Message::Version(v) => self.handle_version(addr, v, now),
            Message::Verack => self.handle_verack(addr, now),
            Message::Addr(entries) => self.handle_addr(addr, entries, now),
            Message::Inv(inv) => self.handle_inv(addr, inv, now),
            Message::GetData(inv) => self.handle_getdata(addr, inv, now),
            Message::NotFound(inv) => self.handle_notfound(addr, inv),
            Message::GetHeaders { locator_hashes, stop_hash, .. } => {
                self.handle_getheaders(addr, locator_hashes, stop_hash, now)
            }
            Message::GetBlocks { locator_hashes, stop_hash, .. } => {
                self.handle_getblocks(addr, locator_hashes, stop_hash, now)
            }
            Message::Headers(headers) => self.handle_headers(addr, headers, now),
            Message::Block { header, transactions } => self.handle_block(addr, header, transactions, now),
            Message::Tx(raw) => self.handle_tx(addr, raw, now),
            Message::MemPool => self.handle_mempool(addr, now),
            Message::Reject { .. } => {}
            Message::FeeFilter(rate) => {
                if let Some(peer) = self.registry.get_mut(&addr) {
                    peer.fee_rate = Some(rate);
                }
            }
            Message::SendHeaders => {
                if let Some(peer) = self.registry.get_mut(&addr) {
                    peer.prefers_headers = true;
                }
            }
            Message::SendCmpct { announce, version } => {
                if let Some(peer) = self.registry.get_mut(&addr) {
                    peer.compact_mode = if announce && version == 1 { Some(1) } else { None };
                }
            }
            Message::CmpctBlock { header, nonce, short_ids, prefilled } => {
                self.handle_cmpctblock(addr, header, nonce, short_ids, prefilled, now)
            }
            Message::GetBlockTxn { block_hash, indexes } => self.handle_getblocktxn(addr, block_hash, indexes, now),
            Message::BlockTxn { block_hash, transactions } => self.handle_blocktxn(addr, block_hash, transactions, now),
            Message::Ping(nonce) => {
                if let Some(peer) = self.registry.get_mut(&addr) {
                    peer.receive_ping(nonce, &mut self.outbox, now);
                }
            }
            Message::Pong(nonce) => {
                if let Some(peer) = self.registry.get_mut(&addr) {
                    peer.receive_pong(nonce, now);
                }
            }
            Message::Unknown { .. } => {}
        }
    }

    fn handle_version(&mut self, addr: PeerId, v: VersionMessage, now: LocalTime) {
        let (outbound, state) = match self.registry.get(&addr) {
            Some(p) => (p.outbound, p.state),
            None => return,
        };
        if state != PeerState::WaitVersion {
            self.misbehave(addr, 1, now);
            return;
        }
        let nonce_collision = self.nonces.has(v.nonce);
        if let Err(reason) = Peer::validate_handshake(
            nonce_collision,
            self.config.self_connect,
            outbound,
            v.version,
            v.services,
            self.config.checkpoints_enabled,
            self.config.required_services,
            self.config.bip152_enabled,
            false,
        ) {
            self.close_peer(addr, reason, now);
            return;
        }
        let reply = if !outbound { Some(self.make_version(addr, now)) } else { None };
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.version = v.version;
            peer.services = v.services;
            peer.user_agent = v.user_agent;
            peer.height = v.start_height;
            peer.relay = v.relay;
            peer.mark_received(now);
            if let Some(reply) = reply {
                peer.send(&mut self.outbox, &Message::Version(reply), now);
            }
            peer.send(&mut self.outbox, &Message::Verack, now);
            peer.state = PeerState::WaitVerack;
        }
    }

    fn handle_verack(&mut self, addr: PeerId, now: LocalTime) {
        let Some(peer) = self.registry.get_mut(&addr) else { return };
        if peer.state != PeerState::WaitVerack {
            return;
        }
        peer.state = PeerState::Connected;
        peer.mark_received(now);
        let outbound = peer.outbound;
        self.addrman.mark_ack(addr);
        self.outbox.event(Event::PeerConnected { addr, outbound });
        if outbound && self.registry.loader().is_none() {
            self.registry.set_loader(addr);
            self.send_sync(addr, now);
        }
        if self.config.bip152_enabled {
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.compact_mode = Some(1);
                peer.send(&mut self.outbox, &Message::SendCmpct { announce: true, version: 1 }, now);
            }
        }
    }

    fn handle_addr(&mut self, addr: PeerId, entries: Vec<(u32, NetAddr)>, now: LocalTime) {
        if entries.len() > self.config.limits.max_addr {
            self.misbehave(addr, 100, now);
            return;
        }
        for (_, net_addr) in entries {
            if !is_routable(net_addr.addr) || self.addrman.is_banned(&net_addr.addr) {
                continue;
            }
            self.addrman.add(net_addr.addr, net_addr.services, addr);
            self.relay_address(net_addr, now);
        }
    }

    /// Relay a learned address to two peers chosen deterministically by
    /// hashing its bytes, the same way addresses get unsolicited relay
    /// rather than broadcasting to every peer.
    fn relay_address(&mut self, net_addr: NetAddr, now: LocalTime) {
        let connected: Vec<PeerId> = self.registry.iter().filter(|p| p.is_connected()).map(|p| p.addr).collect();
        if connected.is_empty() {
            return;
        }
        let bytes = addr_bytes(net_addr.addr);
        for seed in [0u32, 1u32] {
            let hash = murmur3::murmur3_32(&mut Cursor::new(&bytes), seed)
                .expect("hashing an in-memory byte slice cannot fail");
            let target = connected[(hash as usize) % connected.len()];
            if let Some(peer) = self.registry.get_mut(&target) {
                if !peer.addr_filter.contains(&bytes) {
                    peer.addr_filter.insert(&bytes);
                    let timestamp = (now.as_millis() / 1000) as u32;
                    peer.send(&mut self.outbox, &Message::Addr(vec![(timestamp, net_addr)]), now);
                }
            }
        }
    }

    fn handle_inv(&mut self, addr: PeerId, inv: Vec<Inventory>, now: LocalTime) {
        if inv.len() > self.config.limits.max_inv {
            self.misbehave(addr, 100, now);
            return;
        }
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.mark_received(now);
        }
        // During checkpoint-gated headers sync, the loader is the only
        // legitimate source of new data; ignore inventory from everyone
        // (and from the loader too, since headers still drive discovery).
        if self.sync_chain.as_ref().is_some_and(|c| !c.is_complete()) {
            return;
        }
        let is_loader = self.registry.loader() == Some(addr);
        let mut saw_block = false;
        // The hashContinue trick: if the batch's last entry names a block
        // we already have, the peer is signaling there's more beyond what
        // fit in this inv — pick up from there rather than waiting for it
        // to be announced again.
        let continue_from = inv.last().and_then(|item| {
            matches!(item.inv_type, InvType::Block | InvType::WitnessBlock)
                .then(|| item.as_block_hash())
                .filter(|hash| self.chain.has_hash(hash))
        });
        for item in inv {
            match item.inv_type {
                InvType::Block | InvType::WitnessBlock => {
                    let hash = item.as_block_hash();
                    if !self.synced && !is_loader {
                        continue;
                    }
                    saw_block = true;
                    if self.chain.has_hash(&hash) || self.chain.has_invalid(&hash) {
                        continue;
                    }
                    if self.chain.has_orphan(&hash) {
                        if let Some(root) = self.chain.get_orphan_root(&hash) {
                            self.send_getblocks_to(addr, root, now);
                        }
                        continue;
                    }
                    self.request_block_global(hash, now);
                }
                InvType::Tx | InvType::WitnessTx => {
                    let txid = item.as_txid();
                    if self.mempool.has(&txid) || self.mempool.has_reject(&txid) {
                        continue;
                    }
                    self.request_tx_global(txid, now);
                }
                _ => {}
            }
        }
        if let Some(hash) = continue_from {
            self.continue_getblocks(addr, hash, now);
        }
        if saw_block && is_loader {
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.gb_time = Some(now);
            }
        }
    }

    fn handle_getdata(&mut self, addr: PeerId, inv: Vec<Inventory>, now: LocalTime) {
        if inv.len() > self.config.limits.max_inv {
            self.misbehave(addr, 100, now);
            return;
        }
        let mut not_found = Vec::new();
        for item in &inv {
            match item.inv_type {
                InvType::Block | InvType::WitnessBlock | InvType::CompactBlock => {
                    let hash = item.as_block_hash();
                    match self.chain.get_raw_block(&hash) {
                        Some((header, transactions)) => {
                            if let Some(peer) = self.registry.get_mut(&addr) {
                                peer.serve_queue.push_back(Message::Block { header, transactions });
                            }
                        }
                        None => not_found.push(*item),
                    }
                }
                InvType::Tx | InvType::WitnessTx => {
                    let txid = item.as_txid();
                    match self.mempool.get(&txid) {
                        Some(raw) => {
                            if let Some(peer) = self.registry.get_mut(&addr) {
                                peer.serve_queue.push_back(Message::Tx(raw));
                            }
                        }
                        None => not_found.push(*item),
                    }
                }
                _ => not_found.push(*item),
            }
        }
        if let Some(peer) = self.registry.get_mut(&addr) {
            if !not_found.is_empty() {
                peer.send(&mut self.outbox, &Message::NotFound(not_found), now);
            }
            peer.flush_serve_queue(&mut self.outbox, now);
        }
    }

    fn handle_notfound(&mut self, addr: PeerId, inv: Vec<Inventory>) {
        for item in inv {
            match item.inv_type {
                InvType::Block | InvType::WitnessBlock => {
                    let hash = item.as_block_hash();
                    if self.block_map.get(&hash) == Some(&addr) {
                        self.block_map.remove(&hash);
                    }
                    if let Some(peer) = self.registry.get_mut(&addr) {
                        peer.block_requests.remove(&hash);
                    }
                }
                InvType::Tx | InvType::WitnessTx => {
                    let txid = item.as_txid();
                    if self.tx_map.get(&txid) == Some(&addr) {
                        self.tx_map.remove(&txid);
                    }
                    if let Some(peer) = self.registry.get_mut(&addr) {
                        peer.tx_requests.remove(&txid);
                    }
                }
                _ => {}
            }
        }
    }

    /// `Chain` only resolves locators against its own tip, not an arbitrary
    /// walkable range by height, so this can only ever answer "here is the
    /// tip" rather than serve an arbitrary forward batch. A real headers
    /// server needs a persisted, height-indexed chain; out of scope for
    /// this collaborator interface.
    fn handle_getheaders(&mut self, addr: PeerId, locator_hashes: Vec<BlockHash>, stop_hash: BlockHash, now: LocalTime) {
        let tip = self.chain.tip();
        let tip_hash = tip.header.block_hash();
        let at_tip = self.chain.find_locator(&locator_hashes).is_some_and(|e| e.header.block_hash() == tip_hash);
        let headers = if at_tip || tip_hash == stop_hash { Vec::new() } else { vec![tip.header] };
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.send(&mut self.outbox, &Message::Headers(headers), now);
        }
    }

    fn handle_getblocks(&mut self, addr: PeerId, locator_hashes: Vec<BlockHash>, _stop_hash: BlockHash, now: LocalTime) {
        let tip_hash = self.chain.tip().header.block_hash();
        let at_tip = self.chain.find_locator(&locator_hashes).is_some_and(|e| e.header.block_hash() == tip_hash);
        if at_tip {
            return;
        }
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.send(&mut self.outbox, &Message::Inv(vec![Inventory::block(tip_hash)]), now);
        }
    }

    fn handle_headers(&mut self, addr: PeerId, headers: Vec<BlockHeader>, now: LocalTime) {
        if headers.len() > peerpool_wire::message::MAX_HEADERS_PER_MESSAGE {
            self.misbehave(addr, 100, now);
            return;
        }
        if headers.is_empty() {
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.syncing = false;
            }
            return;
        }
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.gh_time = Some(now);
            peer.mark_received(now);
        }
        for header in &headers {
            if !header.meets_pow_limit() {
                self.misbehave(addr, 100, now);
                return;
            }
        }
        if let Some(sync_chain) = &mut self.sync_chain {
            for header in &headers {
                let (_, tail_height) = sync_chain.tail();
                if sync_chain.push(header.prev_blockhash, header.block_hash(), tail_height + 1).is_err() {
                    self.misbehave(addr, 100, now);
                    return;
                }
            }
        }
        let sync_complete = self.sync_chain.as_ref().is_some_and(|c| c.is_complete());
        for header in headers {
            if let Err(err) = self.chain.add(header, addr) {
                self.misbehave(addr, err.ban_score_delta(), now);
                return;
            }
        }
        // header_next: walk the sync chain forward in MAX_INV-sized batches,
        // handing each batch's hashes to request_block as they're verified.
        let next_batch = self.sync_chain.as_mut().map(|c| c.next_batch(self.config.limits.max_inv));
        if sync_complete {
            self.sync_chain = None;
            self.outbox.event(Event::HeaderSyncComplete { height: self.chain.height() });
        }
        if let Some(batch) = next_batch {
            for hash in batch {
                self.request_block_global(hash, now);
            }
        }
        self.outbox.event(Event::HeightChanged { height: self.chain.height() });
        if let Some(peer) = self.registry.get_mut(&addr) {
            if peer.loader {
                peer.block_time = Some(now);
            }
        }
        self.resync(false, now);
    }

    fn handle_block(&mut self, addr: PeerId, header: BlockHeader, transactions: Vec<Vec<u8>>, now: LocalTime) {
        let hash = header.block_hash();
        if self.block_map.get(&hash) == Some(&addr) {
            self.block_map.remove(&hash);
        }
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.block_requests.remove(&hash);
            peer.block_time = Some(now);
            peer.mark_received(now);
        }
        let _ = transactions;
        match self.chain.add(header, addr) {
            Ok(()) => {
                self.announce_block_to_all(hash, addr, now);
                self.outbox.event(Event::HeightChanged { height: self.chain.height() });
            }
            Err(err) => {
                self.reject(addr, "block", &err, hash.as_bytes().to_vec());
                self.misbehave(addr, err.ban_score_delta(), now);
            }
        }
    }

    fn handle_tx(&mut self, addr: PeerId, raw: Vec<u8>, now: LocalTime) {
        match self.mempool.add(&raw, addr) {
            Ok(txid) => {
                if self.tx_map.get(&txid) == Some(&addr) {
                    self.tx_map.remove(&txid);
                }
                if let Some(peer) = self.registry.get_mut(&addr) {
                    peer.tx_requests.remove(&txid);
                }
                self.announce_tx(txid, addr, now);
            }
            Err(err) => {
                let data = peerpool_common::sha256d(&raw).to_vec();
                self.reject(addr, "tx", &err, data);
                self.misbehave(addr, err.ban_score_delta(), now);
            }
        }
    }

    /// Sends a `reject` for a failed `block`/`tx` verification, per the
    /// verify error's own code and reason.
    fn reject(&mut self, addr: PeerId, message: &str, err: &VerifyError, data: Vec<u8>) {
        self.outbox.message(
            addr,
            &Message::Reject {
                message: message.to_string(),
                code: err.reject_code(),
                reason: err.reason().to_string(),
                data,
            },
        );
    }

    fn handle_mempool(&mut self, addr: PeerId, now: LocalTime) {
        let ids: Vec<Txid> = self.mempool.iter().collect();
        for txid in ids {
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.announce(Inventory::tx(txid), &mut self.outbox, now);
            }
        }
    }

    fn handle_cmpctblock(
        &mut self,
        addr: PeerId,
        header: BlockHeader,
        _nonce: u64,
        short_ids: Vec<[u8; 6]>,
        prefilled: Vec<(u64, Vec<u8>)>,
        now: LocalTime,
    ) {
        let hash = header.block_hash();
        if self.compact_map.contains(&hash) {
            return;
        }
        if !header.meets_pow_limit() {
            self.misbehave(addr, 100, now);
            return;
        }
        let negotiated = self.registry.get(&addr).is_some_and(|p| p.compact_mode.is_some());
        if !negotiated {
            self.misbehave(addr, 20, now);
            return;
        }
        let in_flight = self.registry.get(&addr).map_or(0, |p| p.compact_requests.len());
        if in_flight >= self.config.limits.max_compact_in_flight {
            return;
        }
        // Matching short ids against a real mempool index by siphash is out
        // of scope for this collaborator interface, so every id not carried
        // prefilled is always treated as missing and fetched explicitly.
        let missing: Vec<u64> =
            (0..short_ids.len() as u64).filter(|i| !prefilled.iter().any(|(idx, _)| idx == i)).collect();
        self.compact_map.insert(hash);
        if missing.is_empty() {
            match self.chain.add(header, addr) {
                Ok(()) => self.announce_block_to_all(hash, addr, now),
                Err(err) => self.misbehave(addr, err.ban_score_delta(), now),
            }
            self.compact_map.remove(&hash);
            return;
        }
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.compact_requests.insert(
                hash,
                crate::peer::CompactBlockState { header, missing: missing.clone(), requested_at: now },
            );
            peer.send(&mut self.outbox, &Message::GetBlockTxn { block_hash: hash, indexes: missing }, now);
        }
    }

    fn handle_blocktxn(&mut self, addr: PeerId, block_hash: BlockHash, transactions: Vec<Vec<u8>>, now: LocalTime) {
        let Some(peer) = self.registry.get_mut(&addr) else { return };
        let Some(state) = peer.compact_requests.remove(&block_hash) else { return };
        let header = state.header;
        // A `blocktxn` that doesn't carry every transaction this node asked
        // for is a broken fill-in, not a valid one: score it and fall back
        // to fetching the whole block plainly rather than trying to
        // reassemble a partial compact block.
        if transactions.len() != state.missing.len() {
            self.compact_map.remove(&block_hash);
            self.misbehave(addr, PARSE_ERROR_BAN_SCORE, now);
            self.request_block_global(block_hash, now);
            return;
        }
        match self.chain.add(header, addr) {
            Ok(()) => {
                self.compact_map.remove(&block_hash);
                self.announce_block_to_all(block_hash, addr, now);
            }
            Err(err) => self.misbehave(addr, err.ban_score_delta(), now),
        }
    }

    fn handle_getblocktxn(&mut self, addr: PeerId, block_hash: BlockHash, indexes: Vec<u64>, now: LocalTime) {
        let tip_height = self.chain.height();
        let too_deep = match self.chain.by_hash(&block_hash) {
            Some(entry) => tip_height.saturating_sub(entry.height) > MAX_GETBLOCKTXN_DEPTH,
            None => true,
        };
        let served = if too_deep { None } else { self.chain.get_raw_block(&block_hash) };
        let Some((_, transactions)) = served else {
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.send(&mut self.outbox, &Message::NotFound(vec![Inventory::block(block_hash)]), now);
            }
            return;
        };
        let selected: Vec<Vec<u8>> = indexes.iter().filter_map(|&i| transactions.get(i as usize).cloned()).collect();
        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.serve_queue.push_back(Message::BlockTxn { block_hash, transactions: selected });
            peer.flush_serve_queue(&mut self.outbox, now);
        }
    }

    fn announce_block_to_all(&mut self, hash: BlockHash, from: PeerId, now: LocalTime) {
        let header = self.chain.by_hash(&hash).map(|e| e.header);
        let addrs: Vec<PeerId> =
            self.registry.iter().filter(|p| p.addr != from && p.is_connected()).map(|p| p.addr).collect();
        for addr in addrs {
            let Some(peer) = self.registry.get_mut(&addr) else { continue };
            if let Some(header) = header {
                if peer.wants_compact_blocks(self.config.block_mode) {
                    peer.send(
                        &mut self.outbox,
                        &Message::CmpctBlock { header, nonce: 0, short_ids: Vec::new(), prefilled: Vec::new() },
                        now,
                    );
                    continue;
                }
                if peer.prefers_headers {
                    peer.send(&mut self.outbox, &Message::Headers(vec![header]), now);
                    continue;
                }
            }
            peer.announce(Inventory::block(hash), &mut self.outbox, now);
        }
    }

    fn announce_tx(&mut self, txid: Txid, from: PeerId, now: LocalTime) {
        let addrs: Vec<PeerId> = self
            .registry
            .iter()
            .filter(|p| p.addr != from && p.is_connected() && p.relay)
            .map(|p| p.addr)
            .collect();
        for addr in addrs {
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.announce(Inventory::tx(txid), &mut self.outbox, now);
            }
        }
    }
}

impl<C: Chain, M: Mempool, A: AddressManager, R: Rng> Iterator for Pool<C, M, A, R> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

#[derive(Default)]
struct Collector {
    messages: Vec<RawMessage>,
    errors: Vec<FrameError>,
}

impl FrameSink for Collector {
    fn on_message(&mut self, message: RawMessage) {
        self.messages.push(message);
    }

    fn on_parse_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

fn addr_bytes(addr: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    out.extend_from_slice(&ipv6_mapped_octets(addr.ip()));
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

fn ipv6_mapped_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn is_routable(addr: SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => {
            !v4.is_private() && !v4.is_loopback() && !v4.is_unspecified() && !v4.is_broadcast() && !v4.is_link_local()
        }
        IpAddr::V6(v6) => !v6.is_loopback() && !v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerpool_common::{Height, Network};
    use std::cell::RefCell;
    use std::collections::HashMap as Map;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::rc::Rc;

    use crate::collaborators::{Candidate, ChainEntry};

    fn peer_addr(port: u16) -> PeerId {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port))
    }

    #[derive(Clone)]
    struct FakeChain {
        tip: ChainEntry,
        height: Height,
        entries: Rc<RefCell<Map<BlockHash, ChainEntry>>>,
        synced: bool,
    }

    impl FakeChain {
        fn new() -> Self {
            let tip = ChainEntry {
                header: BlockHeader { version: 1, prev_blockhash: BlockHash::ZERO, merkle_root: [0; 32], time: 0, bits: 0x1d00_ffff, nonce: 0 },
                height: 0,
            };
            Self { tip, height: 0, entries: Rc::new(RefCell::new(Map::new())), synced: true }
        }
    }

    impl Chain for FakeChain {
        fn height(&self) -> Height {
            self.height
        }
        fn tip(&self) -> ChainEntry {
            self.tip
        }
        fn synced(&self) -> bool {
            self.synced
        }
        fn by_hash(&self, hash: &BlockHash) -> Option<ChainEntry> {
            self.entries.borrow().get(hash).copied()
        }
        fn get_locator(&self, _from: Option<BlockHash>) -> Vec<BlockHash> {
            vec![self.tip.header.block_hash()]
        }
        fn find_locator(&self, _locator: &[BlockHash]) -> Option<ChainEntry> {
            None
        }
        fn add(&mut self, header: BlockHeader, _peer: PeerId) -> Result<(), VerifyError> {
            self.entries.borrow_mut().insert(header.block_hash(), ChainEntry { header, height: self.height + 1 });
            Ok(())
        }
        fn has_hash(&self, hash: &BlockHash) -> bool {
            self.entries.borrow().contains_key(hash)
        }
        fn has_orphan(&self, _hash: &BlockHash) -> bool {
            false
        }
        fn get_orphan_root(&self, _hash: &BlockHash) -> Option<BlockHash> {
            None
        }
        fn has_invalid(&self, _hash: &BlockHash) -> bool {
            false
        }
        fn progress(&self) -> f64 {
            1.0
        }
        fn get_raw_block(&self, _hash: &BlockHash) -> Option<(BlockHeader, Vec<Vec<u8>>)> {
            None
        }
    }

    struct FakeMempool;

    impl Mempool for FakeMempool {
        fn get(&self, _txid: &Txid) -> Option<Vec<u8>> {
            None
        }
        fn has(&self, _txid: &Txid) -> bool {
            false
        }
        fn has_reject(&self, _txid: &Txid) -> bool {
            false
        }
        fn has_orphan(&self, _txid: &Txid) -> bool {
            false
        }
        fn missing(&self, _raw_tx: &[u8]) -> Vec<Txid> {
            Vec::new()
        }
        fn add(&mut self, raw_tx: &[u8], _peer: PeerId) -> Result<Txid, VerifyError> {
            Ok(Txid::from_bytes(peerpool_common::sha256d(raw_tx)))
        }
        fn iter(&self) -> Box<dyn Iterator<Item = Txid> + '_> {
            Box::new(std::iter::empty())
        }
    }

    #[derive(Default)]
    struct FakeAddrman {
        banned: HashSet<PeerId>,
        locals: HashSet<PeerId>,
    }

    impl AddressManager for FakeAddrman {
        fn get(&mut self) -> Option<Candidate> {
            None
        }
        fn add(&mut self, _addr: PeerId, _services: u64, _source: PeerId) {}
        fn mark_attempt(&mut self, _addr: PeerId) {}
        fn mark_success(&mut self, _addr: PeerId) {}
        fn mark_ack(&mut self, _addr: PeerId) {}
        fn ban(&mut self, addr: PeerId) {
            self.banned.insert(addr);
        }
        fn is_banned(&self, addr: &PeerId) -> bool {
            self.banned.contains(addr)
        }
        fn mark_local(&mut self, addr: PeerId) {
            self.locals.insert(addr);
        }
        fn is_local(&self, addr: &PeerId) -> bool {
            self.locals.contains(addr)
        }
        fn size(&self) -> usize {
            0
        }
    }

    struct FakeLoop;

    impl Loop for FakeLoop {
        fn write(&mut self, _addr: PeerId, _bytes: &[u8]) -> crate::collaborators::WriteResult {
            crate::collaborators::WriteResult::Queued
        }
        fn buffered(&self, _addr: PeerId) -> usize {
            0
        }
    }

    fn new_pool() -> Pool<FakeChain, FakeMempool, FakeAddrman, fastrand::Rng> {
        let config = Config::new(Network::Regtest);
        let rng = fastrand::Rng::with_seed(1);
        let mut pool = Pool::new(config, FakeChain::new(), FakeMempool, FakeAddrman::default(), rng, LocalTime::default());
        pool.open(LocalTime::default());
        pool
    }

    #[test]
    fn dial_registers_an_outbound_peer_and_queues_a_connect() {
        let mut pool = new_pool();
        pool.dial(peer_addr(1), LocalTime::default());
        assert_eq!(pool.registry.len(), 1);
        assert!(matches!(pool.next(), Some(Io::Connect(_))));
    }

    #[test]
    fn accepting_a_banned_address_is_a_no_op() {
        let mut pool = new_pool();
        pool.addrman.ban(peer_addr(2));
        pool.accept(peer_addr(2), LocalTime::default());
        assert!(pool.registry.is_empty());
    }

    #[test]
    fn misbehave_bans_and_disconnects_at_the_threshold() {
        let mut pool = new_pool();
        pool.accept(peer_addr(3), LocalTime::default());
        pool.misbehave(peer_addr(3), 100, LocalTime::default());
        assert!(!pool.registry.has(&peer_addr(3)));
        assert!(pool.addrman.is_banned(&peer_addr(3)));
    }

    #[test]
    fn block_request_is_not_duplicated_across_two_peers() {
        let mut pool = new_pool();
        pool.accept(peer_addr(4), LocalTime::default());
        pool.accept(peer_addr(5), LocalTime::default());
        if let Some(p) = pool.registry.get_mut(&peer_addr(4)) {
            p.state = PeerState::Connected;
        }
        if let Some(p) = pool.registry.get_mut(&peer_addr(5)) {
            p.state = PeerState::Connected;
        }
        let hash = BlockHash::from_bytes([7; 32]);
        pool.request_block_global(hash, LocalTime::default());
        pool.request_block_global(hash, LocalTime::default());
        let total_requests: usize = pool.registry.iter().map(|p| p.block_requests.len()).sum();
        assert_eq!(total_requests, 1);
    }

    #[test]
    fn oversized_addr_message_scores_the_peer() {
        let mut pool = new_pool();
        pool.accept(peer_addr(6), LocalTime::default());
        if let Some(p) = pool.registry.get_mut(&peer_addr(6)) {
            p.state = PeerState::Connected;
        }
        let mut entries = Vec::new();
        for _ in 0..=pool.config.limits.max_addr {
            entries.push((0u32, NetAddr::new(peer_addr(7), 1)));
        }
        pool.handle_addr(peer_addr(6), entries, LocalTime::default());
        assert_eq!(pool.registry.get(&peer_addr(6)).unwrap().ban_score, 100);
    }

    #[test]
    fn fake_loop_reports_no_backpressure() {
        let fake_loop = FakeLoop;
        assert_eq!(fake_loop.buffered(peer_addr(8)), 0);
    }
}
