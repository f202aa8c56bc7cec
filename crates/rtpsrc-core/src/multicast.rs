//! Multicast address classification

use std::net::{Ipv4Addr, Ipv6Addr};

/// Check whether `address` is a multicast IP literal
///
/// IPv6 is tried first, then IPv4 class D. Anything that is not an IP literal
/// (host names included) is treated as unicast.
pub fn is_multicast(address: &str) -> bool {
    if let Ok(v6) = address.parse::<Ipv6Addr>() {
        return v6.is_multicast();
    }

    address
        .parse::<Ipv4Addr>()
        .map(|v4| v4.is_multicast())
        .unwrap_or(false)
}
