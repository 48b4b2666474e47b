//! Inventory vectors: the (type, hash) pairs exchanged in `inv`, `getdata`,
//! and `notfound` to advertise or request blocks and transactions.
use std::io::{self, Read, Write};

use peerpool_common::{BlockHash, Txid};

/// The kind of object an inventory entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    /// A transaction.
    Tx,
    /// A full block.
    Block,
    /// A block, relayed as a BIP37 merkle block to a filtered peer.
    FilteredBlock,
    /// A compact block (BIP152).
    CompactBlock,
    /// A witness-serialized transaction.
    WitnessTx,
    /// A witness-serialized block.
    WitnessBlock,
    /// A witness-serialized filtered block.
    WitnessFilteredBlock,
    /// A type this node doesn't recognize; preserved so unknown inventory
    /// can still be round-tripped and ignored rather than rejected outright.
    Unknown(u32),
}

impl InvType {
    fn to_u32(self) -> u32 {
        match self {
            Self::Tx => 1,
            Self::Block => 2,
            Self::FilteredBlock => 3,
            Self::CompactBlock => 4,
            Self::WitnessTx => 0x4000_0001,
            Self::WitnessBlock => 0x4000_0002,
            Self::WitnessFilteredBlock => 0x4000_0003,
            Self::Unknown(n) => n,
        }
    }

    fn from_u32(n: u32) -> Self {
        match n {
            1 => Self::Tx,
            2 => Self::Block,
            3 => Self::FilteredBlock,
            4 => Self::CompactBlock,
            0x4000_0001 => Self::WitnessTx,
            0x4000_0002 => Self::WitnessBlock,
            0x4000_0003 => Self::WitnessFilteredBlock,
            other => Self::Unknown(other),
        }
    }
}

/// A single inventory entry: a typed reference to a transaction or block by
/// hash. The 32-byte payload is type-erased on the wire (both `Txid` and
/// `BlockHash` are raw 32-byte hashes); callers interpret it via `inv_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inventory {
    /// What kind of object this entry identifies.
    pub inv_type: InvType,
    /// The object's identity hash, in internal byte order.
    pub hash: [u8; 32],
}

/// Wire size of one inventory entry: a 4-byte type plus a 32-byte hash.
pub const INVENTORY_SIZE: usize = 36;

impl Inventory {
    /// Construct a block inventory entry.
    pub fn block(hash: BlockHash) -> Self {
        Self {
            inv_type: InvType::Block,
            hash: *hash.as_bytes(),
        }
    }

    /// Construct a transaction inventory entry.
    pub fn tx(txid: Txid) -> Self {
        Self {
            inv_type: InvType::Tx,
            hash: *txid.as_bytes(),
        }
    }

    /// Interpret this entry's hash as a `BlockHash`, regardless of its
    /// advertised type; callers check `inv_type` first.
    pub fn as_block_hash(&self) -> BlockHash {
        BlockHash::from_bytes(self.hash)
    }

    /// Interpret this entry's hash as a `Txid`.
    pub fn as_txid(&self) -> Txid {
        Txid::from_bytes(self.hash)
    }

    /// Encode one inventory entry.
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.inv_type.to_u32().to_le_bytes())?;
        w.write_all(&self.hash)
    }

    /// Decode one inventory entry.
    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut ty = [0u8; 4];
        r.read_exact(&mut ty)?;
        let mut hash = [0u8; 32];
        r.read_exact(&mut hash)?;
        Ok(Self {
            inv_type: InvType::from_u32(u32::from_le_bytes(ty)),
            hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_round_trip() {
        for ty in [
            InvType::Tx,
            InvType::Block,
            InvType::FilteredBlock,
            InvType::CompactBlock,
            InvType::WitnessTx,
            InvType::WitnessBlock,
            InvType::WitnessFilteredBlock,
        ] {
            let inv = Inventory {
                inv_type: ty,
                hash: [0x7a; 32],
            };
            let mut buf = Vec::new();
            inv.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), INVENTORY_SIZE);
            let decoded = Inventory::decode(&mut buf.as_slice()).unwrap();
            assert_eq!(decoded, inv);
        }
    }

    #[test]
    fn unknown_type_is_preserved() {
        let inv = Inventory {
            inv_type: InvType::Unknown(0xdead_beef),
            hash: [0; 32],
        };
        let mut buf = Vec::new();
        inv.encode(&mut buf).unwrap();
        let decoded = Inventory::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.inv_type, InvType::Unknown(0xdead_beef));
    }
}
