use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A peer address handed out by the tracker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub addr: SocketAddr,
    pub peer_id: Option<Vec<u8>>,
}

impl Peer {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            addr: SocketAddr::new(ip, port),
            peer_id: None,
        }
    }

    /// Parse a peer from compact format (4 bytes IPv4 + 2 bytes port)
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        let [a, b, c, d, p0, p1] = <[u8; 6]>::try_from(data).ok()?;
        let port = u16::from_be_bytes([p0, p1]);
        if port == 0 {
            return None;
        }
        Some(Self::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port))
    }

    pub fn from_compact_list(data: &[u8]) -> Vec<Self> {
        data.chunks_exact(6).filter_map(Self::from_compact).collect()
    }
}
