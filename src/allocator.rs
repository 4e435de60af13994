//! Overlay Address Allocation
//!
//! Maps a node identifier to a deterministic overlay address inside the
//! control node's prefix. There is no stored mapping: the same prefix and
//! id always produce the same address.
//!
//! The node id is offset by [`ID_OFFSET`] (keeping clear of the low,
//! conventionally reserved host values such as the control node's `::1`),
//! truncated to 32 bits, and spliced into the low 32 bits of the prefix as
//! two 16-bit groups. Ids that agree in their low 32 bits after the offset
//! collide; no collision detection is performed.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Added to every node id before it is spliced into the prefix
pub const ID_OFFSET: u64 = 8;

/// Fold a node id into the 32-bit host suffix
pub fn host_suffix(node_id: u64) -> u32 {
    (node_id.wrapping_add(ID_OFFSET) & 0xFFFF_FFFF) as u32
}

/// Allocate the overlay address for a node
pub fn allocate(prefix: &IpNet, node_id: u64) -> IpAddr {
    let suffix = host_suffix(node_id);
    match prefix {
        IpNet::V6(net) => IpAddr::V6(allocate_v6(net, suffix)),
        IpNet::V4(net) => IpAddr::V4(allocate_v4(net, suffix)),
    }
}

fn allocate_v6(net: &Ipv6Net, suffix: u32) -> Ipv6Addr {
    let base = u128::from(net.network());
    let host_bits = 128 - u32::from(net.prefix_len());
    let mask = low_mask_u128(host_bits.min(32));
    let hi = (suffix >> 16) & 0xFFFF;
    let lo = suffix & 0xFFFF;
    let spliced = (u128::from(hi) << 16) | u128::from(lo);
    Ipv6Addr::from((base & !mask) | (spliced & mask))
}

fn allocate_v4(net: &Ipv4Net, suffix: u32) -> Ipv4Addr {
    let base = u32::from(net.network());
    let host_bits = 32 - u32::from(net.prefix_len());
    let mask = if host_bits >= 32 {
        u32::MAX
    } else {
        (1u32 << host_bits) - 1
    };
    Ipv4Addr::from((base & !mask) | (suffix & mask))
}

fn low_mask_u128(bits: u32) -> u128 {
    if bits == 0 {
        0
    } else {
        u128::MAX >> (128 - bits)
    }
}

/// The single-address network for an address (`/128` or `/32`)
pub fn host_net(addr: IpAddr) -> IpNet {
    IpNet::from(addr)
}

/// Combine the host bits of `addr` with the prefix length of `network`
pub fn with_prefix_of(addr: IpAddr, network: &IpNet) -> crate::Result<IpNet> {
    IpNet::new(addr, network.prefix_len()).map_err(|e| {
        crate::Error::InvalidAddress(format!("{}/{}: {}", addr, network.prefix_len(), e))
    })
}
