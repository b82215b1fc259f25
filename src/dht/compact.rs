//! Compact node-info and peer-info encodings used in `find_node`,
//! `get_peers` responses, and the `values` list of `announce_peer`'s sibling.
//!
//! Compact node info is 26 bytes per node: a 20-byte id followed by a 4-byte
//! IPv4 address and 2-byte big-endian port. Compact peer info drops the id
//! and is just the 6-byte address/port pair.
use std::net::{Ipv4Addr, SocketAddrV4};

use byteorder::{BigEndian, ByteOrder};

use super::id::{NodeId, ID_LEN};

pub const COMPACT_NODE_LEN: usize = ID_LEN + 6;
pub const COMPACT_PEER_LEN: usize = 6;

/// Appends `node`'s compact (id, address, port) encoding to `out`.
pub fn encode_node(out: &mut Vec<u8>, id: &NodeId, addr: &SocketAddrV4) {
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(&addr.ip().octets());
    let mut port_buf = [0u8; 2];
    BigEndian::write_u16(&mut port_buf, addr.port());
    out.extend_from_slice(&port_buf);
}

/// Decodes a run of compact node-info entries. Any trailing bytes that don't
/// make up a full 26-byte entry are silently dropped, matching how lenient
/// peers are known to pad these lists.
pub fn decode_nodes(bytes: &[u8]) -> Vec<(NodeId, SocketAddrV4)> {
    bytes
        .chunks_exact(COMPACT_NODE_LEN)
        .filter_map(|chunk| {
            let id = NodeId::from_slice(&chunk[..ID_LEN])?;
            let addr = decode_addr(&chunk[ID_LEN..]);
            Some((id, addr))
        })
        .collect()
}

/// Appends `addr`'s compact 6-byte encoding to `out`.
pub fn encode_peer(out: &mut Vec<u8>, addr: &SocketAddrV4) {
    out.extend_from_slice(&addr.ip().octets());
    let mut port_buf = [0u8; 2];
    BigEndian::write_u16(&mut port_buf, addr.port());
    out.extend_from_slice(&port_buf);
}

/// Decodes a single compact 6-byte peer address. Returns `None` if `bytes`
/// is not exactly 6 bytes long.
pub fn decode_peer(bytes: &[u8]) -> Option<SocketAddrV4> {
    if bytes.len() != COMPACT_PEER_LEN {
        return None;
    }
    Some(decode_addr(bytes))
}

fn decode_addr(bytes: &[u8]) -> SocketAddrV4 {
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = BigEndian::read_u16(&bytes[4..6]);
    SocketAddrV4::new(ip, port)
}
