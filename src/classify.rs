//! Private and reserved address classification.
//!
//! The guard only consumes the [`Classifier`] trait; [`PrivateRanges`] is the
//! default implementation and can be swapped for any `Fn(&str) -> bool`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

/// A pure predicate deciding whether an address must not be connected to.
///
/// Implementations must be side-effect free: the guard calls them from any
/// task, concurrently, for every connection attempt.
pub trait Classifier: Send + Sync {
    /// `address` is a hostname or an IPv4/IPv6 literal (brackets allowed).
    fn is_private(&self, address: &str) -> bool;
}

impl<F> Classifier for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_private(&self, address: &str) -> bool {
        self(address)
    }
}

/// Private, loopback, link-local, unique-local and other reserved ranges.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivateRanges;

impl Classifier for PrivateRanges {
    fn is_private(&self, address: &str) -> bool {
        match parse_ip(address) {
            Some(ip) => is_private_ip(ip),
            None => is_internal_hostname(address),
        }
    }
}

/// Classify with [`PrivateRanges`].
pub fn is_private(address: &str) -> bool {
    PrivateRanges.is_private(address)
}

/// IPv4 ranges that are not publicly routable.
const PRIVATE_V4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),       // "this" network
    (Ipv4Addr::new(10, 0, 0, 0), 8),      // RFC 1918
    (Ipv4Addr::new(100, 64, 0, 0), 10),   // carrier-grade NAT
    (Ipv4Addr::new(127, 0, 0, 0), 8),     // loopback
    (Ipv4Addr::new(169, 254, 0, 0), 16),  // link-local, cloud metadata
    (Ipv4Addr::new(172, 16, 0, 0), 12),   // RFC 1918
    (Ipv4Addr::new(192, 0, 0, 0), 24),    // IETF protocol assignments
    (Ipv4Addr::new(192, 0, 2, 0), 24),    // TEST-NET-1
    (Ipv4Addr::new(192, 88, 99, 0), 24),  // 6to4 relay anycast
    (Ipv4Addr::new(192, 168, 0, 0), 16),  // RFC 1918
    (Ipv4Addr::new(198, 18, 0, 0), 15),   // benchmarking
    (Ipv4Addr::new(198, 51, 100, 0), 24), // TEST-NET-2
    (Ipv4Addr::new(203, 0, 113, 0), 24),  // TEST-NET-3
    (Ipv4Addr::new(224, 0, 0, 0), 4),     // multicast
    (Ipv4Addr::new(240, 0, 0, 0), 4),     // reserved, broadcast
];

const PRIVATE_V6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),      // unique local
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),     // link-local
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32), // documentation
    (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8),      // multicast
];

/// Hostnames that are internal by name (checked without DNS).
const INTERNAL_HOSTNAMES: &[&str] = &[
    "localhost",
    "metadata.google.internal",
    "metadata.goog",
    "metadata.azure.internal",
    "instance-data", // AWS alternate (EC2-Classic)
];

/// Classify an already-parsed IP address.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_private_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_private_ipv6(ipv6),
    }
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    // Alibaba Cloud metadata sits in otherwise public space
    if ip == Ipv4Addr::new(100, 100, 100, 200) {
        return true;
    }

    PRIVATE_V4.iter().any(|&(network, prefix)| {
        Ipv4Net::new(network, prefix).is_ok_and(|net| net.contains(&ip))
    })
}

fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    // Loopback first: ::1 also has the IPv4-compatible shape
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }

    if let Some(ipv4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(ipv4);
    }

    if let Some(ipv4) = embedded_ipv4(ip) {
        return is_private_ipv4(ipv4);
    }

    // AWS metadata: fd00:ec2::254 (already inside fc00::/7)
    PRIVATE_V6.iter().any(|&(network, prefix)| {
        Ipv6Net::new(network, prefix).is_ok_and(|net| net.contains(&ip))
    })
}

/// The IPv4 address carried by IPv4-compatible (`::a.b.c.d`), NAT64
/// (`64:ff9b::/96`) and 6to4 (`2002::/16`) addresses.
fn embedded_ipv4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    let segments = ip.segments();
    let (high, low) = match segments {
        [0, 0, 0, 0, 0, 0, high, low] => (high, low),
        [0x64, 0xff9b, 0, 0, 0, 0, high, low] => (high, low),
        [0x2002, high, low, ..] => (high, low),
        _ => return None,
    };
    let [a, b] = high.to_be_bytes();
    let [c, d] = low.to_be_bytes();
    Some(Ipv4Addr::new(a, b, c, d))
}

/// Parse an IP literal, tolerating `[v6]` brackets and a `%zone` suffix.
fn parse_ip(address: &str) -> Option<IpAddr> {
    let trimmed = address
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(address);
    let without_zone = trimmed.split('%').next().unwrap_or(trimmed);
    without_zone.parse().ok()
}

fn is_internal_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    INTERNAL_HOSTNAMES.iter().any(|&internal| {
        host == internal
            || host
                .strip_suffix(internal)
                .is_some_and(|rest| rest.ends_with('.'))
    })
}
