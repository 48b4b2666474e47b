//! Byte-stream framing: turns a raw TCP stream into discrete
//! `(magic, command, payload)` frames. One `Framer` per peer connection; it
//! holds no knowledge of message semantics, only the 24-byte header shape
//! and the checksum that guards the payload.
use std::collections::VecDeque;

use peerpool_common::sha256d;
use thiserror::Error;

/// Maximum payload size this node will accept, matching the production
/// network's own block-size-driven ceiling.
pub const MAX_MESSAGE: usize = 32 * 1024 * 1024;

const HEADER_SIZE: usize = 24;
const COMMAND_SIZE: usize = 12;

/// A framing failure. The framer never panics; every malformed byte
/// sequence it can't make sense of comes back as one of these instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The 4-byte magic at the start of a header didn't match the network's.
    #[error("invalid magic: expected {expected:08x}, got {got:08x}")]
    InvalidMagic {
        /// The network's configured magic.
        expected: u32,
        /// What was actually on the wire.
        got: u32,
    },
    /// The 12-byte command field wasn't NUL-padded printable ASCII.
    #[error("invalid command bytes")]
    InvalidCommand,
    /// The declared payload length exceeds `MAX_MESSAGE`.
    #[error("message of {len} bytes exceeds the {MAX_MESSAGE} byte limit")]
    MessageTooLarge {
        /// The declared length.
        len: u32,
    },
    /// The payload's double-SHA256 prefix didn't match the header's checksum.
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// A successfully framed message: header fields plus the raw payload.
/// Interpreting the payload according to `command` is `message`'s job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// The command name, already validated as printable NUL-padded ASCII.
    pub command: String,
    /// The raw, un-decoded payload bytes.
    pub payload: Vec<u8>,
}

/// Callbacks the framer drives as it recognizes frames or rejects malformed
/// input. A parse error never stops the parser — it resynchronizes at the
/// next header boundary and keeps going, leaving any ban-scoring or
/// disconnection decision to the caller.
pub trait FrameSink {
    /// A complete, checksum-valid frame was parsed.
    fn on_message(&mut self, message: RawMessage);
    /// A frame failed validation and was discarded.
    fn on_parse_error(&mut self, error: FrameError);
}

#[derive(Debug)]
enum State {
    NeedHeader,
    NeedBody {
        command: String,
        len: u32,
        checksum: [u8; 4],
    },
}

/// A single-pass, single-peer byte-stream parser. Feed it bytes as they
/// arrive off the socket; it calls back into a `FrameSink` for every frame
/// it manages to recognize, and for every one it has to discard.
#[derive(Debug)]
pub struct Framer {
    magic: u32,
    state: State,
    buf: VecDeque<u8>,
}

impl Framer {
    /// Create a framer expecting the given network's magic bytes.
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            state: State::NeedHeader,
            buf: VecDeque::new(),
        }
    }

    /// Feed newly received bytes, driving `sink` for every frame recognized
    /// or rejected in the process.
    pub fn feed(&mut self, data: &[u8], sink: &mut impl FrameSink) {
        self.buf.extend(data.iter().copied());
        loop {
            match &self.state {
                State::NeedHeader => {
                    if self.buf.len() < HEADER_SIZE {
                        return;
                    }
                    let header: Vec<u8> = self.buf.drain(..HEADER_SIZE).collect();
                    match parse_header(&header, self.magic) {
                        Ok((command, len, checksum)) => {
                            self.state = State::NeedBody { command, len, checksum };
                        }
                        Err(err) => {
                            sink.on_parse_error(err);
                            self.state = State::NeedHeader;
                        }
                    }
                }
                State::NeedBody { command, len, checksum } => {
                    let len = *len as usize;
                    if self.buf.len() < len {
                        return;
                    }
                    let payload: Vec<u8> = self.buf.drain(..len).collect();
                    let digest = sha256d(&payload);
                    if digest[..4] != *checksum {
                        sink.on_parse_error(FrameError::ChecksumMismatch);
                    } else {
                        sink.on_message(RawMessage {
                            command: command.clone(),
                            payload,
                        });
                    }
                    self.state = State::NeedHeader;
                }
            }
        }
    }
}

fn parse_header(header: &[u8], expected_magic: u32) -> Result<(String, u32, [u8; 4]), FrameError> {
    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != expected_magic {
        return Err(FrameError::InvalidMagic {
            expected: expected_magic,
            got: magic,
        });
    }
    let command = parse_command(&header[4..4 + COMMAND_SIZE])?;
    let len = u32::from_le_bytes(header[16..20].try_into().unwrap());
    if len as usize > MAX_MESSAGE {
        return Err(FrameError::MessageTooLarge { len });
    }
    let checksum: [u8; 4] = header[20..24].try_into().unwrap();
    Ok((command, len, checksum))
}

fn parse_command(bytes: &[u8]) -> Result<String, FrameError> {
    let nul_at = bytes.iter().position(|&b| b == 0);
    let (text, padding) = match nul_at {
        Some(i) => (&bytes[..i], &bytes[i..]),
        None => return Err(FrameError::InvalidCommand),
    };
    if !padding.iter().all(|&b| b == 0) {
        return Err(FrameError::InvalidCommand);
    }
    if text.is_empty() || !text.iter().all(|&b| (0x20..=0x7e).contains(&b)) {
        return Err(FrameError::InvalidCommand);
    }
    Ok(String::from_utf8(text.to_vec()).expect("validated as printable ASCII"))
}

/// Encode a command name and payload into a complete wire frame.
pub fn encode_frame(magic: u32, command: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&magic.to_le_bytes());
    let mut command_bytes = [0u8; COMMAND_SIZE];
    let name = command.as_bytes();
    command_bytes[..name.len()].copy_from_slice(name);
    out.extend_from_slice(&command_bytes);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let digest = sha256d(payload);
    out.extend_from_slice(&digest[..4]);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = 0xD9B4_BEF9;

    #[derive(Default)]
    struct Recorder {
        messages: Vec<RawMessage>,
        errors: Vec<FrameError>,
    }

    impl FrameSink for Recorder {
        fn on_message(&mut self, message: RawMessage) {
            self.messages.push(message);
        }
        fn on_parse_error(&mut self, error: FrameError) {
            self.errors.push(error);
        }
    }

    #[test]
    fn round_trips_a_well_formed_frame() {
        let frame = encode_frame(MAGIC, "verack", &[]);
        let mut framer = Framer::new(MAGIC);
        let mut sink = Recorder::default();
        framer.feed(&frame, &mut sink);
        assert_eq!(sink.messages.len(), 1);
        assert_eq!(sink.messages[0].command, "verack");
        assert!(sink.errors.is_empty());
    }

    #[test]
    fn splits_across_multiple_feeds() {
        let frame = encode_frame(MAGIC, "ping", &8u64.to_le_bytes());
        let mut framer = Framer::new(MAGIC);
        let mut sink = Recorder::default();
        framer.feed(&frame[..10], &mut sink);
        assert!(sink.messages.is_empty());
        framer.feed(&frame[10..], &mut sink);
        assert_eq!(sink.messages.len(), 1);
    }

    #[test]
    fn rejects_wrong_magic_and_resyncs() {
        let mut frame = encode_frame(MAGIC, "verack", &[]);
        frame[0] ^= 0xff;
        let good = encode_frame(MAGIC, "verack", &[]);
        let mut framer = Framer::new(MAGIC);
        let mut sink = Recorder::default();
        framer.feed(&frame, &mut sink);
        framer.feed(&good, &mut sink);
        assert_eq!(sink.errors.len(), 1);
        assert!(matches!(sink.errors[0], FrameError::InvalidMagic { .. }));
        assert_eq!(sink.messages.len(), 1);
    }

    #[test]
    fn rejects_checksum_mismatch() {
        let mut frame = encode_frame(MAGIC, "ping", &8u64.to_le_bytes());
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut framer = Framer::new(MAGIC);
        let mut sink = Recorder::default();
        framer.feed(&frame, &mut sink);
        assert_eq!(sink.errors, vec![FrameError::ChecksumMismatch]);
        assert!(sink.messages.is_empty());
    }

    #[test]
    fn rejects_oversized_declared_length() {
        let mut header = Vec::new();
        header.extend_from_slice(&MAGIC.to_le_bytes());
        let mut command = [0u8; COMMAND_SIZE];
        command[..4].copy_from_slice(b"data");
        header.extend_from_slice(&command);
        header.extend_from_slice(&((MAX_MESSAGE as u32) + 1).to_le_bytes());
        header.extend_from_slice(&[0u8; 4]);
        let mut framer = Framer::new(MAGIC);
        let mut sink = Recorder::default();
        framer.feed(&header, &mut sink);
        assert_eq!(sink.errors.len(), 1);
        assert!(matches!(sink.errors[0], FrameError::MessageTooLarge { .. }));
    }

    #[test]
    fn rejects_non_nul_terminated_command() {
        let mut header = Vec::new();
        header.extend_from_slice(&MAGIC.to_le_bytes());
        header.extend_from_slice(&[b'x'; COMMAND_SIZE]);
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&[0u8; 4]);
        let mut framer = Framer::new(MAGIC);
        let mut sink = Recorder::default();
        framer.feed(&header, &mut sink);
        assert_eq!(sink.errors, vec![FrameError::InvalidCommand]);
    }
}
