//! Bitcoin-style variable-length integer ("compact size") and
//! variable-length string encoding, used throughout the message codec.
use std::io::{self, Read, Write};

/// Maximum length of a `version` message's user-agent string.
pub const MAX_VARSTRING: usize = 256;

/// Read a compact-size unsigned integer.
pub fn read_varint<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut prefix = [0u8; 1];
    r.read_exact(&mut prefix)?;
    match prefix[0] {
        0xff => {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf)?;
            Ok(u64::from_le_bytes(buf))
        }
        0xfe => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)?;
            Ok(u32::from_le_bytes(buf) as u64)
        }
        0xfd => {
            let mut buf = [0u8; 2];
            r.read_exact(&mut buf)?;
            Ok(u16::from_le_bytes(buf) as u64)
        }
        n => Ok(n as u64),
    }
}

/// Write a compact-size unsigned integer.
pub fn write_varint<W: Write>(w: &mut W, value: u64) -> io::Result<()> {
    if value < 0xfd {
        w.write_all(&[value as u8])
    } else if value <= 0xffff {
        w.write_all(&[0xfd])?;
        w.write_all(&(value as u16).to_le_bytes())
    } else if value <= 0xffff_ffff {
        w.write_all(&[0xfe])?;
        w.write_all(&(value as u32).to_le_bytes())
    } else {
        w.write_all(&[0xff])?;
        w.write_all(&value.to_le_bytes())
    }
}

/// Read a length-prefixed byte string, rejecting anything over `max_len`.
pub fn read_varstring<R: Read>(r: &mut R, max_len: usize) -> io::Result<String> {
    let len = read_varint(r)? as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("varstring of {} bytes exceeds maximum of {}", len, max_len),
        ));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a length-prefixed byte string.
pub fn write_varstring<W: Write>(w: &mut W, value: &str) -> io::Result<()> {
    write_varint(w, value.len() as u64)?;
    w.write_all(value.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn varint_round_trips_across_ranges() {
        for value in [0u64, 1, 252, 253, 0xffff, 0x1_0000, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value).unwrap();
            let decoded = read_varint(&mut Cursor::new(buf)).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn varstring_round_trips() {
        let mut buf = Vec::new();
        write_varstring(&mut buf, "/peerpool:0.1.0/").unwrap();
        let decoded = read_varstring(&mut Cursor::new(buf), MAX_VARSTRING).unwrap();
        assert_eq!(decoded, "/peerpool:0.1.0/");
    }

    #[test]
    fn varstring_rejects_oversized_input() {
        let mut buf = Vec::new();
        write_varstring(&mut buf, &"a".repeat(300)).unwrap();
        assert!(read_varstring(&mut Cursor::new(buf), MAX_VARSTRING).is_err());
    }
}
