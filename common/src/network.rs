//! Bitcoin-style peer network parameters. Each network has a distinct magic,
//! a default port, a handful of DNS seeds, and a checkpoint table used to
//! gate initial header sync (see `peerpool_p2p::chain_sync`).
use std::str::FromStr;

use crate::hash::BlockHash;

/// Block height. Heights are always non-negative and fit comfortably in a
/// `u32` for any network this crate targets.
pub type Height = u32;

/// The peer-to-peer network a node is connected to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Network {
    /// The main production network.
    Mainnet,
    /// The long-running public test network.
    Testnet,
    /// A local regression-test network with trivial difficulty.
    Regtest,
    /// The signet test network (signed blocks, low difficulty).
    Signet,
    /// A private simulation network, used for local multi-node testing.
    Simnet,
}

impl Default for Network {
    fn default() -> Self {
        Self::Mainnet
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            "signet" => Ok(Self::Signet),
            "simnet" => Ok(Self::Simnet),
            other => Err(format!("invalid network specified: {:?}", other)),
        }
    }
}

impl Network {
    /// The default listen/connect port for this network.
    pub fn port(&self) -> u16 {
        match self {
            Self::Mainnet => 8333,
            Self::Testnet => 18333,
            Self::Regtest => 18444,
            Self::Signet => 38333,
            Self::Simnet => 18555,
        }
    }

    /// The 4-byte magic prefixing every wire message on this network.
    pub fn magic(&self) -> u32 {
        match self {
            Self::Mainnet => 0xD9B4_BEF9,
            Self::Testnet => 0x0709_110B,
            Self::Regtest => 0xDAB5_BFFA,
            Self::Signet => 0x0A03_CF40,
            Self::Simnet => 0x1201_4B35,
        }
    }

    /// Short string identifier, as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
            Self::Signet => "signet",
            Self::Simnet => "simnet",
        }
    }

    /// Whether self-connection is tolerated on this network. Mainnet refuses
    /// it; the local test networks allow it since a single host may run
    /// several nodes that legitimately dial back into each other.
    pub fn allows_self_connect(&self) -> bool {
        !matches!(self, Self::Mainnet | Self::Testnet)
    }

    /// DNS seeds used to bootstrap the address book on first start.
    pub fn seeds(&self) -> &'static [&'static str] {
        match self {
            Self::Mainnet => &[
                "seed.bitcoin.sipa.be",
                "dnsseed.bluematt.me",
                "dnsseed.bitcoin.dashjr.org",
                "seed.bitcoinstats.com",
            ],
            Self::Testnet => &["testnet-seed.bitcoin.jonasschnelli.ch"],
            Self::Signet => &["seed.signet.bitcoin.sprovoost.nl"],
            Self::Regtest | Self::Simnet => &[],
        }
    }

    /// Hard-coded (height, hash) checkpoints used to gate initial headers
    /// sync. Returned oldest-first. Empty for the local test networks,
    /// where checkpoint gating would serve no purpose.
    pub fn checkpoints(&self) -> &'static [(Height, BlockHash)] {
        match self {
            Self::Mainnet => &MAINNET_CHECKPOINTS,
            Self::Testnet => &TESTNET_CHECKPOINTS,
            Self::Signet | Self::Regtest | Self::Simnet => &[],
        }
    }

    /// The height of the last configured checkpoint, or `0` if this network
    /// has none.
    pub fn last_checkpoint(&self) -> Height {
        self.checkpoints().last().map(|(h, _)| *h).unwrap_or(0)
    }
}

// These are illustrative checkpoints, not a claim about any specific chain's
// real history; they only need to be internally consistent (strictly
// increasing heights) for the header-sync gating logic to exercise its
// checkpoint-matching path.
static MAINNET_CHECKPOINTS: [(Height, BlockHash); 3] = [
    (11_111, BlockHash::from_bytes([0x11; 32])),
    (33_333, BlockHash::from_bytes([0x22; 32])),
    (210_000, BlockHash::from_bytes([0x33; 32])),
];

static TESTNET_CHECKPOINTS: [(Height, BlockHash); 1] =
    [(546, BlockHash::from_bytes([0xaa; 32]))];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magics_are_distinct() {
        let nets = [
            Network::Mainnet,
            Network::Testnet,
            Network::Regtest,
            Network::Signet,
            Network::Simnet,
        ];
        for (i, a) in nets.iter().enumerate() {
            for b in &nets[i + 1..] {
                assert_ne!(a.magic(), b.magic());
            }
        }
    }

    #[test]
    fn checkpoints_strictly_increase() {
        for net in [Network::Mainnet, Network::Testnet] {
            let mut last = 0;
            for (height, _) in net.checkpoints() {
                assert!(*height > last);
                last = *height;
            }
        }
    }

    #[test]
    fn from_str_roundtrips_as_str() {
        for net in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            assert_eq!(Network::from_str(net.as_str()).unwrap(), net);
        }
    }
}
