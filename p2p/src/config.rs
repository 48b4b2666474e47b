//! Tunables for the pool, with the defaults named in the protocol's
//! configurable-options list. Plain structs with a `Default` impl, the way
//! the teacher's `fsm::Config`/`fsm::Limits` are — no config-file parsing
//! lives here, only the in-memory shape a host applies parsed values to.
use std::collections::HashSet;

use peerpool_common::Network;
use peerpool_wire::netaddr::services;

use crate::PeerId;

/// Protocol version this node advertises in its own `version` message.
pub const PROTOCOL_VERSION: i32 = 70016;
/// Minimum protocol version this node will accept from a peer.
pub const MIN_VERSION: i32 = 70001;
/// Minimum protocol version required to use checkpoint-gated headers sync.
pub const HEADERS_VERSION: i32 = 31800;
/// Ban-score threshold at which a peer's address is banned.
pub const BAN_THRESHOLD: u32 = 100;
/// Maximum inventory entries accepted in a single `inv`/`getdata`/`notfound`.
pub const MAX_INV: usize = 50_000;
/// Maximum outstanding block requests a single peer may have in flight.
pub const MAX_BLOCKS_IN_FLIGHT: usize = 16;
/// Maximum outstanding transaction requests a single peer may have in flight.
pub const MAX_TXS_IN_FLIGHT: usize = 10_000;
/// Maximum in-flight compact blocks a single peer may have at once.
pub const MAX_COMPACT_IN_FLIGHT: usize = 15;

/// Which block-retrieval scheme the pool prefers when announcing and
/// syncing new blocks. Resolves Open Question (c): mode 1 is a real,
/// selectable configuration value, not merely advertised and never used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockMode {
    /// Low-bandwidth: full blocks only, fetched with `getdata`.
    #[default]
    Classic,
    /// High-bandwidth: prefer BIP152 compact blocks.
    Compact,
}

/// Restricts which address families the address manager may hand back as
/// dial candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnlyNet {
    /// No restriction.
    #[default]
    Any,
    /// IPv4 candidates only.
    Ipv4,
    /// IPv6 candidates only.
    Ipv6,
}

/// Peers exempt from some misbehavior scoring, by address. A small, natural
/// extension of the ban-score system every such state machine ends up
/// carrying for local testing/trusted-peer setups.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    addrs: HashSet<PeerId>,
}

impl Whitelist {
    /// An empty whitelist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address to the whitelist.
    pub fn insert(&mut self, addr: PeerId) {
        self.addrs.insert(addr);
    }

    /// Whether an address is whitelisted.
    pub fn contains(&self, addr: &PeerId) -> bool {
        self.addrs.contains(addr)
    }
}

/// Numeric limits separated out from the rest of `Config` so tests can
/// tighten them (e.g. a tiny `MAX_INV` to exercise the oversized-batch
/// rejection path) without touching unrelated policy flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Ban-score threshold.
    pub ban_threshold: u32,
    /// Maximum entries in one `inv`/`getdata`/`notfound`.
    pub max_inv: usize,
    /// Maximum outstanding block requests per peer.
    pub max_blocks_in_flight: usize,
    /// Maximum outstanding transaction requests per peer.
    pub max_txs_in_flight: usize,
    /// Maximum in-flight compact blocks per peer.
    pub max_compact_in_flight: usize,
    /// Maximum entries in one `addr` message before it's a protocol
    /// violation.
    pub max_addr: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            ban_threshold: BAN_THRESHOLD,
            max_inv: MAX_INV,
            max_blocks_in_flight: MAX_BLOCKS_IN_FLIGHT,
            max_txs_in_flight: MAX_TXS_IN_FLIGHT,
            max_compact_in_flight: MAX_COMPACT_IN_FLIGHT,
            max_addr: 1000,
        }
    }
}

/// Pool-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The network to operate on.
    pub network: Network,
    /// Whether to accept inbound connections.
    pub listen: bool,
    /// Port to listen on; defaults to the network's canonical port.
    pub port: u16,
    /// Target number of outbound connections.
    pub max_outbound: usize,
    /// Maximum accepted inbound connections.
    pub max_inbound: usize,
    /// Whether to gate initial sync behind hard-coded checkpoints.
    pub checkpoints_enabled: bool,
    /// Whether to support BIP37 bloom filtering for this node's peers.
    pub bip37_enabled: bool,
    /// Whether to support BIP152 compact blocks.
    pub bip152_enabled: bool,
    /// Preferred block-retrieval mode when bip152 is enabled.
    pub block_mode: BlockMode,
    /// Restrict dial candidates by address family.
    pub only_net: OnlyNet,
    /// Whether onion (Tor) candidates are eligible for dialing.
    pub onion: bool,
    /// Service bits a candidate peer must advertise to be considered.
    pub required_services: u64,
    /// Whether this network tolerates connecting to ourselves.
    pub self_connect: bool,
    /// Numeric limits.
    pub limits: Limits,
    /// Exempted addresses.
    pub whitelist: Whitelist,
}

impl Config {
    /// Construct a config for the given network with every other field at
    /// its stated default.
    pub fn new(network: Network) -> Self {
        Self {
            port: network.port(),
            self_connect: network.allows_self_connect(),
            ..Self::default_for(network)
        }
    }

    fn default_for(network: Network) -> Self {
        Self {
            network,
            listen: true,
            port: network.port(),
            max_outbound: 8,
            max_inbound: 8,
            checkpoints_enabled: false,
            bip37_enabled: false,
            bip152_enabled: false,
            block_mode: BlockMode::default(),
            only_net: OnlyNet::default(),
            onion: false,
            required_services: services::NETWORK,
            self_connect: network.allows_self_connect(),
            limits: Limits::default(),
            whitelist: Whitelist::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_for(Network::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.max_outbound, 8);
        assert_eq!(config.max_inbound, 8);
        assert!(!config.checkpoints_enabled);
        assert!(!config.bip37_enabled);
        assert!(!config.bip152_enabled);
        assert_eq!(config.block_mode, BlockMode::Classic);
        assert!(!config.self_connect);
    }

    #[test]
    fn new_uses_the_networks_canonical_port() {
        let config = Config::new(Network::Testnet);
        assert_eq!(config.port, Network::Testnet.port());
    }

    #[test]
    fn regtest_allows_self_connect_by_default() {
        let config = Config::new(Network::Regtest);
        assert!(config.self_connect);
    }
}
