//! The 26-byte network address encoding used in `version`, `addr`, and
//! `addrv2`-predecessor messages: 8 bytes of service flags, 16 bytes of
//! (possibly IPv4-mapped) IPv6 address, and a 2-byte big-endian port.
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Node service bit flags, as advertised in `version` and `addr` messages.
pub mod services {
    /// The node can serve the full block chain.
    pub const NETWORK: u64 = 1 << 0;
    /// The node supports bloom filtering (BIP37).
    pub const BLOOM: u64 = 1 << 2;
    /// The node can serve segregated witness data.
    pub const WITNESS: u64 = 1 << 3;
    /// The node can serve compact block filters.
    pub const COMPACT_FILTERS: u64 = 1 << 6;
    /// The node can serve the block chain even while pruned.
    pub const NETWORK_LIMITED: u64 = 1 << 10;
}

/// A peer's network address plus the services it advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    /// Advertised service bit flags.
    pub services: u64,
    /// The peer's socket address.
    pub addr: SocketAddr,
}

impl NetAddr {
    /// Construct from a socket address and service flags.
    pub fn new(addr: SocketAddr, services: u64) -> Self {
        Self { services, addr }
    }

    /// Encode in the 26-byte wire form (no leading timestamp; callers that
    /// need the timestamped `addr`-message variant write it separately).
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.services.to_le_bytes())?;
        w.write_all(&ipv6_mapped_octets(self.addr.ip()))?;
        w.write_all(&self.addr.port().to_be_bytes())
    }

    /// Decode the 26-byte wire form.
    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut services = [0u8; 8];
        r.read_exact(&mut services)?;
        let mut octets = [0u8; 16];
        r.read_exact(&mut octets)?;
        let mut port = [0u8; 2];
        r.read_exact(&mut port)?;
        let ip = Ipv6Addr::from(octets);
        let ip = ip
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(ip));
        Ok(Self {
            services: u64::from_le_bytes(services),
            addr: SocketAddr::new(ip, u16::from_be_bytes(port)),
        })
    }
}

fn ipv6_mapped_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Size in bytes of the address-only (no timestamp) wire encoding.
pub const NETADDR_SIZE: usize = 26;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn ipv4_round_trips_through_mapped_encoding() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 8333));
        let na = NetAddr::new(addr, services::NETWORK);
        let mut buf = Vec::new();
        na.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), NETADDR_SIZE);
        let decoded = NetAddr::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, na);
    }
}
