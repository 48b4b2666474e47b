//! The 80-byte block header: the only piece of block-level data this crate
//! understands, since validating transactions and scripts is out of scope
//! for the peer-pool core. Headers-first sync only needs hashing, the
//! previous-block backpointer, and a compact-bits proof-of-work check.
use std::io::{self, Read, Write};

use peerpool_common::{sha256d, BlockHash};

/// A block header, as carried in `headers`, `block`, `cmpctblock`, and used
/// to build the header-sync chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block version bits.
    pub version: i32,
    /// Hash of the previous block in the chain.
    pub prev_blockhash: BlockHash,
    /// Merkle root of the block's transactions.
    pub merkle_root: [u8; 32],
    /// Block timestamp, seconds since the Unix epoch.
    pub time: u32,
    /// Compact (`nBits`) encoding of the proof-of-work target.
    pub bits: u32,
    /// The proof-of-work nonce.
    pub nonce: u32,
}

/// Wire size of a block header, excluding the trailing transaction count
/// varint that follows it in a `headers` message entry.
pub const HEADER_SIZE: usize = 80;

impl BlockHeader {
    /// This header's double-SHA256 identity hash.
    pub fn block_hash(&self) -> BlockHash {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        self.encode(&mut buf).expect("encoding into a Vec cannot fail");
        BlockHash::from_bytes(sha256d(&buf))
    }

    /// Whether this header's hash satisfies the proof-of-work target implied
    /// by its own `bits` field. Does not check that `bits` itself is the
    /// right difficulty for this height — that requires the chain's
    /// retargeting history, which stays with the external chain
    /// collaborator.
    pub fn meets_pow_limit(&self) -> bool {
        let target = expand_compact_bits(self.bits);
        let hash = self.block_hash();
        let hash_as_int = be_uint_from_internal_order(hash.as_bytes());
        hash_as_int <= target
    }

    /// Encode the 80-byte header.
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.version.to_le_bytes())?;
        w.write_all(self.prev_blockhash.as_bytes())?;
        w.write_all(&self.merkle_root)?;
        w.write_all(&self.time.to_le_bytes())?;
        w.write_all(&self.bits.to_le_bytes())?;
        w.write_all(&self.nonce.to_le_bytes())
    }

    /// Decode an 80-byte header.
    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut version = [0u8; 4];
        r.read_exact(&mut version)?;
        let mut prev = [0u8; 32];
        r.read_exact(&mut prev)?;
        let mut merkle_root = [0u8; 32];
        r.read_exact(&mut merkle_root)?;
        let mut time = [0u8; 4];
        r.read_exact(&mut time)?;
        let mut bits = [0u8; 4];
        r.read_exact(&mut bits)?;
        let mut nonce = [0u8; 4];
        r.read_exact(&mut nonce)?;
        Ok(Self {
            version: i32::from_le_bytes(version),
            prev_blockhash: BlockHash::from_bytes(prev),
            merkle_root,
            time: u32::from_le_bytes(time),
            bits: u32::from_le_bytes(bits),
            nonce: u32::from_le_bytes(nonce),
        })
    }
}

/// Expand the compact (`nBits`) target encoding into a 256-bit unsigned
/// integer, represented as a big-endian `[u8; 32]` for comparison purposes.
fn expand_compact_bits(bits: u32) -> [u8; 32] {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    let mut out = [0u8; 32];
    if exponent <= 3 {
        let mantissa = mantissa >> (8 * (3 - exponent));
        out[29..32].copy_from_slice(&mantissa.to_be_bytes()[1..]);
    } else {
        let shift = exponent - 3;
        if shift < 32 {
            let bytes = mantissa.to_be_bytes();
            let start = 32 - shift - 3;
            if start < 32 {
                let end = (start + 3).min(32);
                out[start..end].copy_from_slice(&bytes[1..1 + (end - start)]);
            }
        }
    }
    out
}

fn be_uint_from_internal_order(internal: &[u8; 32]) -> [u8; 32] {
    // Header hashes are stored/transmitted in reversed (little-endian)
    // byte order by convention; flip to big-endian for magnitude comparison.
    let mut out = *internal;
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: BlockHash::ZERO,
            merkle_root: [0x42; 32],
            time: 1_231_006_505,
            bits: 0x1d00_ffff,
            nonce: 2_083_236_893,
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample();
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        let decoded = BlockHeader::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn hash_is_deterministic() {
        let header = sample();
        assert_eq!(header.block_hash(), header.block_hash());
    }

    #[test]
    fn easiest_target_accepts_any_hash() {
        // bits = 0 expands to an all-zero target only when exponent == 0,
        // which rejects everything; use the maximal mainnet-style target
        // instead to confirm the comparison path runs without panicking.
        let mut header = sample();
        header.bits = 0x1d00_ffff;
        let _ = header.meets_pow_limit();
    }
}
