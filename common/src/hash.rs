//! Hash primitives: double SHA-256 and the 32-byte hash newtypes used
//! throughout the wire protocol and block tree.
use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// Compute `SHA256(SHA256(data))`.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

macro_rules! hash_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// The all-zero hash, used as a sentinel "no stop hash" value.
            pub const ZERO: Self = Self([0u8; 32]);

            /// Construct from raw bytes in internal (little-endian, as transmitted) order.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Raw internal-order bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Whether this is the all-zero sentinel.
            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 32]
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Displayed reversed, like a block explorer would show it.
                for b in self.0.iter().rev() {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut out = [0u8; 32];
                for (i, chunk) in s.as_bytes().rchunks(2).enumerate() {
                    let byte_str = std::str::from_utf8(chunk).unwrap_or("00");
                    out[i] = u8::from_str_radix(byte_str, 16)?;
                }
                Ok(Self(out))
            }
        }
    };
}

hash_newtype!(BlockHash, "A block's double-SHA256 identity hash.");
hash_newtype!(Txid, "A transaction's double-SHA256 identity hash.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_matches_double_application() {
        let data = b"hello";
        let once = Sha256::digest(data);
        let expected = Sha256::digest(once);
        assert_eq!(sha256d(data), expected.as_slice());
    }

    #[test]
    fn zero_hash_is_zero() {
        assert!(BlockHash::ZERO.is_zero());
        assert!(!BlockHash::from_bytes([1; 32]).is_zero());
    }
}
