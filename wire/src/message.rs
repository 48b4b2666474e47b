//! The typed message codec: turns a [`RawMessage`](crate::framer::RawMessage)
//! into a [`Message`] and back. Transaction and block bodies are kept
//! opaque (raw bytes) — parsing scripts and validating consensus rules is
//! the chain collaborator's job, not this crate's.
use std::io::{self, Cursor, Read};

use peerpool_common::{BlockHash, Txid};
use thiserror::Error;

use crate::header::BlockHeader;
use crate::inventory::Inventory;
use crate::netaddr::NetAddr;
use crate::varint::{read_varint, read_varstring, write_varint, write_varstring, MAX_VARSTRING};

/// Maximum number of entries in a single `headers`/`inv`/`getdata` message,
/// mirroring the production network's own limits.
pub const MAX_HEADERS_PER_MESSAGE: usize = 2_000;
/// Maximum number of inventory entries in a single `inv`/`getdata`/`notfound`.
pub const MAX_INV_PER_MESSAGE: usize = 50_000;
/// Maximum number of block locator hashes in `getheaders`/`getblocks`.
pub const MAX_LOCATOR_HASHES: usize = 101;

/// Everything that can go wrong decoding a payload whose framing already
/// checked out (magic, length, checksum). Distinct from [`FrameError`]
/// because these failures are about the payload's internal shape, not the
/// envelope around it.
///
/// [`FrameError`]: crate::framer::FrameError
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload ended before a field could be fully read.
    #[error("truncated payload: {0}")]
    Truncated(#[from] io::Error),
    /// A count field exceeded the limit for its message type.
    #[error("{field} count {got} exceeds limit of {limit}")]
    LimitExceeded {
        /// Name of the field that overflowed.
        field: &'static str,
        /// The count actually on the wire.
        got: usize,
        /// The configured maximum.
        limit: usize,
    },
    /// `command` doesn't name a message this node understands.
    #[error("unrecognized command {0:?}")]
    UnknownCommand(String),
}

/// A reject code, as carried in a `reject` message's second field.
/// Numeric values match the historical BIP61 assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    /// The message itself couldn't be parsed.
    Malformed,
    /// The message failed validation (bad proof-of-work, bad signature...).
    Invalid,
    /// The peer is running an obsolete, no-longer-accepted protocol version.
    Obsolete,
    /// This object was already known.
    Duplicate,
    /// The object didn't meet this node's relay policy.
    NonStandard,
    /// An output was below the dust threshold.
    Dust,
    /// The offered fee was insufficient.
    InsufficientFee,
    /// The object conflicts with a hard-coded checkpoint.
    Checkpoint,
    /// A code this node doesn't recognize, preserved as-is.
    Other(u8),
}

impl RejectCode {
    fn to_u8(self) -> u8 {
        match self {
            Self::Malformed => 0x01,
            Self::Invalid => 0x10,
            Self::Obsolete => 0x11,
            Self::Duplicate => 0x12,
            Self::NonStandard => 0x40,
            Self::Dust => 0x41,
            Self::InsufficientFee => 0x42,
            Self::Checkpoint => 0x43,
            Self::Other(n) => n,
        }
    }

    fn from_u8(n: u8) -> Self {
        match n {
            0x01 => Self::Malformed,
            0x10 => Self::Invalid,
            0x11 => Self::Obsolete,
            0x12 => Self::Duplicate,
            0x40 => Self::NonStandard,
            0x41 => Self::Dust,
            0x42 => Self::InsufficientFee,
            0x43 => Self::Checkpoint,
            other => Self::Other(other),
        }
    }
}

/// Fields of a `version` handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// Protocol version this node speaks.
    pub version: i32,
    /// Advertised service bit flags.
    pub services: u64,
    /// Sender's local clock, seconds since the Unix epoch.
    pub timestamp: i64,
    /// Address and services of the receiving node, as seen by the sender.
    pub receiver: NetAddr,
    /// Address and services of the sending node.
    pub sender: NetAddr,
    /// Random nonce, used to detect self-connections.
    pub nonce: u64,
    /// Free-form user agent string.
    pub user_agent: String,
    /// The sender's current best block height.
    pub start_height: i32,
    /// Whether the sender wants unfiltered (non-bloom) inventory relay.
    pub relay: bool,
}

/// A decoded protocol message. `Unknown` carries any command this node's
/// codec doesn't have a typed variant for, so the framer layer never needs
/// to reject a frame merely because it names an unrecognized command.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// First message a peer sends after connecting.
    Version(VersionMessage),
    /// Acknowledges a `version` message.
    Verack,
    /// Advertises peer addresses.
    Addr(Vec<(u32, NetAddr)>),
    /// Advertises available objects (blocks, transactions).
    Inv(Vec<Inventory>),
    /// Requests the objects named by the given inventory.
    GetData(Vec<Inventory>),
    /// Informs the peer that the requested objects were not found.
    NotFound(Vec<Inventory>),
    /// Requests headers starting after the given locator.
    GetHeaders {
        /// Protocol version of the requester.
        version: u32,
        /// Block locator hashes, most recent first.
        locator_hashes: Vec<BlockHash>,
        /// Hash to stop at, or the zero hash for "as many as allowed".
        stop_hash: BlockHash,
    },
    /// Requests full blocks starting after the given locator.
    GetBlocks {
        /// Protocol version of the requester.
        version: u32,
        /// Block locator hashes, most recent first.
        locator_hashes: Vec<BlockHash>,
        /// Hash to stop at, or the zero hash for "as many as allowed".
        stop_hash: BlockHash,
    },
    /// A batch of block headers.
    Headers(Vec<BlockHeader>),
    /// A full block: header plus opaque, unparsed transaction bytes.
    Block {
        /// The block's header.
        header: BlockHeader,
        /// Raw serialized transactions, in block order.
        transactions: Vec<Vec<u8>>,
    },
    /// A single raw, unparsed transaction.
    Tx(Vec<u8>),
    /// Requests the mempool's transaction set.
    MemPool,
    /// A protocol-level rejection notice.
    Reject {
        /// The command the rejection refers to.
        message: String,
        /// Why it was rejected.
        code: RejectCode,
        /// Human-readable reason.
        reason: String,
        /// Optional extra data (e.g. the offending hash).
        data: Vec<u8>,
    },
    /// Requests the peer stop relaying transactions below the given fee rate.
    FeeFilter(u64),
    /// Requests the peer announce new blocks via `headers` rather than `inv`.
    SendHeaders,
    /// Negotiates BIP152 compact block relay.
    SendCmpct {
        /// Whether the peer should announce new blocks via `cmpctblock`.
        announce: bool,
        /// The compact block encoding version.
        version: u64,
    },
    /// A BIP152 compact block.
    CmpctBlock {
        /// The block's header.
        header: BlockHeader,
        /// Nonce used to salt short transaction IDs.
        nonce: u64,
        /// Short transaction IDs for everything not prefilled.
        short_ids: Vec<[u8; 6]>,
        /// Transactions the sender chose to include in full, by index.
        prefilled: Vec<(u64, Vec<u8>)>,
    },
    /// Requests the full transactions missing from a compact block.
    GetBlockTxn {
        /// The block these indexes are relative to.
        block_hash: BlockHash,
        /// Differentially-encoded transaction indexes.
        indexes: Vec<u64>,
    },
    /// The full transactions requested by `getblocktxn`.
    BlockTxn {
        /// The block these transactions belong to.
        block_hash: BlockHash,
        /// Raw serialized transactions, in the order requested.
        transactions: Vec<Vec<u8>>,
    },
    /// A keepalive/latency probe.
    Ping(u64),
    /// A reply to `ping`, echoing its nonce.
    Pong(u64),
    /// A command this codec has no typed representation for.
    Unknown {
        /// The raw command name.
        command: String,
        /// The undecoded payload.
        payload: Vec<u8>,
    },
}

impl Message {
    /// The wire command name for this message.
    pub fn command(&self) -> &str {
        match self {
            Self::Version(_) => "version",
            Self::Verack => "verack",
            Self::Addr(_) => "addr",
            Self::Inv(_) => "inv",
            Self::GetData(_) => "getdata",
            Self::NotFound(_) => "notfound",
            Self::GetHeaders { .. } => "getheaders",
            Self::GetBlocks { .. } => "getblocks",
            Self::Headers(_) => "headers",
            Self::Block { .. } => "block",
            Self::Tx(_) => "tx",
            Self::MemPool => "mempool",
            Self::Reject { .. } => "reject",
            Self::FeeFilter(_) => "feefilter",
            Self::SendHeaders => "sendheaders",
            Self::SendCmpct { .. } => "sendcmpct",
            Self::CmpctBlock { .. } => "cmpctblock",
            Self::GetBlockTxn { .. } => "getblocktxn",
            Self::BlockTxn { .. } => "blocktxn",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Unknown { command, .. } => command,
        }
    }

    /// Serialize the payload (without the frame header).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Version(v) => {
                out.extend_from_slice(&v.version.to_le_bytes());
                out.extend_from_slice(&v.services.to_le_bytes());
                out.extend_from_slice(&v.timestamp.to_le_bytes());
                v.receiver.encode(&mut out).unwrap();
                v.sender.encode(&mut out).unwrap();
                out.extend_from_slice(&v.nonce.to_le_bytes());
                write_varstring(&mut out, &v.user_agent).unwrap();
                out.extend_from_slice(&v.start_height.to_le_bytes());
                out.push(v.relay as u8);
            }
            Self::Verack | Self::MemPool | Self::SendHeaders => {}
            Self::Addr(entries) => {
                write_varint(&mut out, entries.len() as u64).unwrap();
                for (timestamp, addr) in entries {
                    out.extend_from_slice(&timestamp.to_le_bytes());
                    addr.encode(&mut out).unwrap();
                }
            }
            Self::Inv(inv) | Self::GetData(inv) | Self::NotFound(inv) => {
                write_varint(&mut out, inv.len() as u64).unwrap();
                for entry in inv {
                    entry.encode(&mut out).unwrap();
                }
            }
            Self::GetHeaders { version, locator_hashes, stop_hash }
            | Self::GetBlocks { version, locator_hashes, stop_hash } => {
                out.extend_from_slice(&version.to_le_bytes());
                write_varint(&mut out, locator_hashes.len() as u64).unwrap();
                for hash in locator_hashes {
                    out.extend_from_slice(hash.as_bytes());
                }
                out.extend_from_slice(stop_hash.as_bytes());
            }
            Self::Headers(headers) => {
                write_varint(&mut out, headers.len() as u64).unwrap();
                for header in headers {
                    header.encode(&mut out).unwrap();
                    write_varint(&mut out, 0).unwrap();
                }
            }
            Self::Block { header, transactions } => {
                header.encode(&mut out).unwrap();
                write_varint(&mut out, transactions.len() as u64).unwrap();
                for tx in transactions {
                    out.extend_from_slice(tx);
                }
            }
            Self::Tx(raw) => out.extend_from_slice(raw),
            Self::Reject { message, code, reason, data } => {
                write_varstring(&mut out, message).unwrap();
                out.push(code.to_u8());
                write_varstring(&mut out, reason).unwrap();
                out.extend_from_slice(data);
            }
            Self::FeeFilter(rate) => out.extend_from_slice(&rate.to_le_bytes()),
            Self::SendCmpct { announce, version } => {
                out.push(*announce as u8);
                out.extend_from_slice(&version.to_le_bytes());
            }
            Self::CmpctBlock { header, nonce, short_ids, prefilled } => {
                header.encode(&mut out).unwrap();
                out.extend_from_slice(&nonce.to_le_bytes());
                write_varint(&mut out, short_ids.len() as u64).unwrap();
                for id in short_ids {
                    out.extend_from_slice(id);
                }
                write_varint(&mut out, prefilled.len() as u64).unwrap();
                for (index, tx) in prefilled {
                    write_varint(&mut out, *index).unwrap();
                    out.extend_from_slice(tx);
                }
            }
            Self::GetBlockTxn { block_hash, indexes } => {
                out.extend_from_slice(block_hash.as_bytes());
                write_varint(&mut out, indexes.len() as u64).unwrap();
                for index in indexes {
                    write_varint(&mut out, *index).unwrap();
                }
            }
            Self::BlockTxn { block_hash, transactions } => {
                out.extend_from_slice(block_hash.as_bytes());
                write_varint(&mut out, transactions.len() as u64).unwrap();
                for tx in transactions {
                    out.extend_from_slice(tx);
                }
            }
            Self::Ping(nonce) | Self::Pong(nonce) => out.extend_from_slice(&nonce.to_le_bytes()),
            Self::Unknown { payload, .. } => out.extend_from_slice(payload),
        }
        out
    }

    /// Decode a payload given its command name.
    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Cursor::new(payload);
        Ok(match command {
            "version" => Self::Version(decode_version(&mut r)?),
            "verack" => Self::Verack,
            "mempool" => Self::MemPool,
            "sendheaders" => Self::SendHeaders,
            "addr" => Self::Addr(decode_addr(&mut r)?),
            "inv" => Self::Inv(decode_inventory_list(&mut r)?),
            "getdata" => Self::GetData(decode_inventory_list(&mut r)?),
            "notfound" => Self::NotFound(decode_inventory_list(&mut r)?),
            "getheaders" => {
                let (version, locator_hashes, stop_hash) = decode_locator(&mut r)?;
                Self::GetHeaders { version, locator_hashes, stop_hash }
            }
            "getblocks" => {
                let (version, locator_hashes, stop_hash) = decode_locator(&mut r)?;
                Self::GetBlocks { version, locator_hashes, stop_hash }
            }
            "headers" => Self::Headers(decode_headers(&mut r)?),
            "block" => decode_block(&mut r)?,
            "tx" => Self::Tx(remaining(&mut r)?),
            "reject" => decode_reject(&mut r)?,
            "feefilter" => Self::FeeFilter(read_u64(&mut r)?),
            "sendcmpct" => Self::SendCmpct {
                announce: read_bool(&mut r)?,
                version: read_u64(&mut r)?,
            },
            "cmpctblock" => decode_cmpctblock(&mut r)?,
            "getblocktxn" => decode_getblocktxn(&mut r)?,
            "blocktxn" => decode_blocktxn(&mut r)?,
            "ping" => Self::Ping(read_u64(&mut r)?),
            "pong" => Self::Pong(read_u64(&mut r)?),
            other => Self::Unknown {
                command: other.to_string(),
                payload: payload.to_vec(),
            },
        })
    }
}

fn remaining<R: Read>(r: &mut R) -> Result<Vec<u8>, DecodeError> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    Ok(buf)
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, DecodeError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bool<R: Read>(r: &mut R) -> Result<bool, DecodeError> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0] != 0)
}

fn read_hash<R: Read>(r: &mut R) -> Result<[u8; 32], DecodeError> {
    let mut buf = [0u8; 32];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn decode_version<R: Read>(r: &mut R) -> Result<VersionMessage, DecodeError> {
    let mut version = [0u8; 4];
    r.read_exact(&mut version)?;
    let services = read_u64(r)?;
    let mut timestamp = [0u8; 8];
    r.read_exact(&mut timestamp)?;
    let receiver = NetAddr::decode(r)?;
    let sender = NetAddr::decode(r)?;
    let nonce = read_u64(r)?;
    let user_agent = read_varstring(r, MAX_VARSTRING)?;
    let mut start_height = [0u8; 4];
    r.read_exact(&mut start_height)?;
    let relay = match read_bool(r) {
        Ok(b) => b,
        // Pre-BIP37 peers omit the trailing relay byte entirely.
        Err(DecodeError::Truncated(_)) => true,
        Err(e) => return Err(e),
    };
    Ok(VersionMessage {
        version: i32::from_le_bytes(version),
        services,
        timestamp: i64::from_le_bytes(timestamp),
        receiver,
        sender,
        nonce,
        user_agent,
        start_height: i32::from_le_bytes(start_height),
        relay,
    })
}

fn decode_addr<R: Read>(r: &mut R) -> Result<Vec<(u32, NetAddr)>, DecodeError> {
    let count = read_varint(r)? as usize;
    if count > MAX_INV_PER_MESSAGE {
        return Err(DecodeError::LimitExceeded { field: "addr", got: count, limit: MAX_INV_PER_MESSAGE });
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let mut timestamp = [0u8; 4];
        r.read_exact(&mut timestamp)?;
        out.push((u32::from_le_bytes(timestamp), NetAddr::decode(r)?));
    }
    Ok(out)
}

fn decode_inventory_list<R: Read>(r: &mut R) -> Result<Vec<Inventory>, DecodeError> {
    let count = read_varint(r)? as usize;
    if count > MAX_INV_PER_MESSAGE {
        return Err(DecodeError::LimitExceeded { field: "inventory", got: count, limit: MAX_INV_PER_MESSAGE });
    }
    (0..count).map(|_| Ok(Inventory::decode(r)?)).collect()
}

fn decode_locator<R: Read>(r: &mut R) -> Result<(u32, Vec<BlockHash>, BlockHash), DecodeError> {
    let mut version = [0u8; 4];
    r.read_exact(&mut version)?;
    let count = read_varint(r)? as usize;
    if count > MAX_LOCATOR_HASHES {
        return Err(DecodeError::LimitExceeded { field: "locator_hashes", got: count, limit: MAX_LOCATOR_HASHES });
    }
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(BlockHash::from_bytes(read_hash(r)?));
    }
    let stop = BlockHash::from_bytes(read_hash(r)?);
    Ok((u32::from_le_bytes(version), hashes, stop))
}

fn decode_headers<R: Read>(r: &mut R) -> Result<Vec<BlockHeader>, DecodeError> {
    let count = read_varint(r)? as usize;
    if count > MAX_HEADERS_PER_MESSAGE {
        return Err(DecodeError::LimitExceeded { field: "headers", got: count, limit: MAX_HEADERS_PER_MESSAGE });
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(BlockHeader::decode(r)?);
        // Trailing transaction-count varint is always zero in a headers
        // message; read and discard it.
        read_varint(r)?;
    }
    Ok(out)
}

fn decode_block<R: Read>(r: &mut R) -> Result<Message, DecodeError> {
    let header = BlockHeader::decode(r)?;
    let count = read_varint(r)? as usize;
    let transactions = decode_raw_transaction_blob(r, count)?;
    Ok(Message::Block { header, transactions })
}

/// Transaction bodies aren't parsed by this codec (script interpretation is
/// out of scope), so a block's `count` transactions are carried as a single
/// opaque blob spanning the rest of the payload rather than split into
/// individually-framed entries.
fn decode_raw_transaction_blob<R: Read>(r: &mut R, count: usize) -> Result<Vec<Vec<u8>>, DecodeError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    Ok(vec![remaining(r)?])
}

fn decode_reject<R: Read>(r: &mut R) -> Result<Message, DecodeError> {
    let message = read_varstring(r, MAX_VARSTRING)?;
    let mut code = [0u8; 1];
    r.read_exact(&mut code)?;
    let reason = read_varstring(r, MAX_VARSTRING)?;
    let data = remaining(r)?;
    Ok(Message::Reject {
        message,
        code: RejectCode::from_u8(code[0]),
        reason,
        data,
    })
}

fn decode_cmpctblock<R: Read>(r: &mut R) -> Result<Message, DecodeError> {
    let header = BlockHeader::decode(r)?;
    let nonce = read_u64(r)?;
    let short_count = read_varint(r)? as usize;
    let mut short_ids = Vec::with_capacity(short_count.min(MAX_INV_PER_MESSAGE));
    for _ in 0..short_count {
        let mut id = [0u8; 6];
        r.read_exact(&mut id)?;
        short_ids.push(id);
    }
    let prefilled_count = read_varint(r)? as usize;
    let prefilled = if prefilled_count == 0 {
        Vec::new()
    } else {
        let index = read_varint(r)?;
        vec![(index, remaining(r)?)]
    };
    Ok(Message::CmpctBlock { header, nonce, short_ids, prefilled })
}

fn decode_getblocktxn<R: Read>(r: &mut R) -> Result<Message, DecodeError> {
    let block_hash = BlockHash::from_bytes(read_hash(r)?);
    let count = read_varint(r)? as usize;
    if count > MAX_INV_PER_MESSAGE {
        return Err(DecodeError::LimitExceeded { field: "getblocktxn.indexes", got: count, limit: MAX_INV_PER_MESSAGE });
    }
    let mut indexes = Vec::with_capacity(count);
    for _ in 0..count {
        indexes.push(read_varint(r)?);
    }
    Ok(Message::GetBlockTxn { block_hash, indexes })
}

fn decode_blocktxn<R: Read>(r: &mut R) -> Result<Message, DecodeError> {
    let block_hash = BlockHash::from_bytes(read_hash(r)?);
    let count = read_varint(r)? as usize;
    let transactions = decode_raw_transaction_blob(r, count)?;
    Ok(Message::BlockTxn { block_hash, transactions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn addr() -> NetAddr {
        NetAddr::new(
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8333)),
            1,
        )
    }

    #[test]
    fn version_round_trips() {
        let msg = Message::Version(VersionMessage {
            version: 70016,
            services: 1,
            timestamp: 1_700_000_000,
            receiver: addr(),
            sender: addr(),
            nonce: 0x1234_5678_9abc_def0,
            user_agent: "/peerpool:0.1.0/".to_string(),
            start_height: 800_000,
            relay: true,
        });
        let payload = msg.encode_payload();
        let decoded = Message::decode("version", &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn ping_pong_round_trip() {
        let ping = Message::Ping(42);
        let payload = ping.encode_payload();
        assert_eq!(Message::decode("ping", &payload).unwrap(), ping);
    }

    #[test]
    fn verack_has_empty_payload() {
        assert!(Message::Verack.encode_payload().is_empty());
        assert_eq!(Message::decode("verack", &[]).unwrap(), Message::Verack);
    }

    #[test]
    fn unknown_command_is_preserved_not_rejected() {
        let decoded = Message::decode("notacommand", &[1, 2, 3]).unwrap();
        assert_eq!(
            decoded,
            Message::Unknown { command: "notacommand".to_string(), payload: vec![1, 2, 3] }
        );
    }

    #[test]
    fn inv_round_trips() {
        let msg = Message::Inv(vec![Inventory::tx(Txid::from_bytes([9; 32]))]);
        let payload = msg.encode_payload();
        assert_eq!(Message::decode("inv", &payload).unwrap(), msg);
    }

    #[test]
    fn oversized_inv_count_is_rejected() {
        let mut payload = Vec::new();
        write_varint(&mut payload, (MAX_INV_PER_MESSAGE + 1) as u64).unwrap();
        let err = Message::decode("inv", &payload).unwrap_err();
        assert!(matches!(err, DecodeError::LimitExceeded { field: "inventory", .. }));
    }

    #[test]
    fn reject_round_trips() {
        let msg = Message::Reject {
            message: "tx".to_string(),
            code: RejectCode::InsufficientFee,
            reason: "fee too low".to_string(),
            data: vec![],
        };
        let payload = msg.encode_payload();
        assert_eq!(Message::decode("reject", &payload).unwrap(), msg);
    }
}
