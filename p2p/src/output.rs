//! The pool's side effects, drained by the host loop. Mirrors the way the
//! teacher's `StateMachine` is itself a draining `Iterator<Item = Io>` over
//! an internal `Outbox`: nothing in this crate writes to a socket directly,
//! it only enqueues an `Io` value and lets the loop perform it.
use std::collections::VecDeque;

use peerpool_common::{LocalDuration, Network};
use peerpool_wire::{framer, Message};

use crate::error::DisconnectReason;
use crate::PeerId;

/// A notable internal event, surfaced to the host for logging/metrics
/// purposes. Distinct from `Io::Write`/`Connect`/etc., which are actions
/// the loop must perform; an `Event` is purely informational.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A peer completed its handshake and is now `CONNECTED`.
    PeerConnected {
        /// The peer's address.
        addr: PeerId,
        /// Whether we dialed it (`true`) or it dialed us.
        outbound: bool,
    },
    /// A peer was disconnected.
    PeerDisconnected {
        /// The peer's address.
        addr: PeerId,
        /// Why.
        reason: DisconnectReason,
    },
    /// A peer's ban score crossed the ban threshold.
    PeerBanned {
        /// The peer's address.
        addr: PeerId,
    },
    /// Headers-first sync reached the final checkpoint and switched modes.
    HeaderSyncComplete {
        /// Height at which checkpoint-gated sync ended.
        height: peerpool_common::Height,
    },
    /// The chain tip height the pool believes it's at changed.
    HeightChanged {
        /// The new believed height.
        height: peerpool_common::Height,
    },
}

/// A side effect the pool wants the host loop to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Io {
    /// Write a complete, framed message to a peer's socket.
    Write(PeerId, Vec<u8>),
    /// Dial a new outbound connection.
    Connect(PeerId),
    /// Tear down a peer's connection.
    Disconnect(PeerId, DisconnectReason),
    /// Ask the loop to invoke `tick` again no later than this far out.
    SetTimer(LocalDuration),
    /// An informational event.
    Event(Event),
}

/// A FIFO queue of pending `Io` actions. Every component that wants to talk
/// to the outside world — a peer flushing its send queue, the pool dialing
/// a candidate — pushes onto the same outbox; the pool drains it in order,
/// which is what gives per-peer write ordering its on-the-wire guarantee.
#[derive(Debug)]
pub struct Outbox {
    magic: u32,
    queue: VecDeque<Io>,
}

impl Outbox {
    /// Create an outbox that frames writes for the given network.
    pub fn new(network: Network) -> Self {
        Self {
            magic: network.magic(),
            queue: VecDeque::new(),
        }
    }

    /// Queue a typed message to be framed and written to a peer.
    pub fn message(&mut self, addr: PeerId, message: &Message) {
        let payload = message.encode_payload();
        let frame = framer::encode_frame(self.magic, message.command(), &payload);
        self.queue.push_back(Io::Write(addr, frame));
    }

    /// Queue a raw (already-framed) write.
    pub fn write_raw(&mut self, addr: PeerId, frame: Vec<u8>) {
        self.queue.push_back(Io::Write(addr, frame));
    }

    /// Queue an outbound connection attempt.
    pub fn connect(&mut self, addr: PeerId) {
        self.queue.push_back(Io::Connect(addr));
    }

    /// Queue a disconnection.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.queue.push_back(Io::Disconnect(addr, reason));
    }

    /// Request the loop schedule the next tick.
    pub fn set_timer(&mut self, duration: LocalDuration) {
        self.queue.push_back(Io::SetTimer(duration));
    }

    /// Queue an informational event.
    pub fn event(&mut self, event: Event) {
        self.queue.push_back(Io::Event(event));
    }

    /// Number of actions currently queued.
    pub fn count(&self) -> usize {
        self.queue.len()
    }
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.queue.pop_front()
    }
}
