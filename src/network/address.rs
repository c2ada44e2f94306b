//! Network address classification
//!
//! Strict IPv4/IPv6 validation, canonical rendering and private-range
//! detection for the addresses peers report about themselves and each other.
//! Everything here is pure; malformed input is reported as
//! [`AddressError::Malformed`] and never coerced into something valid.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Addresses that are syntactically valid but meaningless as a peer identity.
pub const IP_BLACKLIST: &[&str] = &["0.0.0.0", "127.0.0.1", "255.255.255.255", "::", "::1"];

/// IPv4 private, carrier-grade NAT and link-local blocks as (network, prefix length).
const IPV4_PRIVATE_NETWORKS: &[([u8; 4], u32)] = &[
    ([10, 0, 0, 0], 8),
    ([172, 16, 0, 0], 12),
    ([192, 168, 0, 0], 16),
    ([100, 64, 0, 0], 10),
    ([169, 254, 0, 0], 16),
];

/// Number of 16-bit groups in a fully expanded IPv6 address
const IPV6_GROUPS: usize = 8;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Malformed IP address {0}")]
    Malformed(String),
}

// =============================================================================
// Classifier
// =============================================================================

/// Strict dotted-quad check: exactly four decimal octets, each <= 255.
pub fn is_ipv4(ip: &str) -> bool {
    parse_ipv4(ip).is_some()
}

/// Strict IPv6 check: 3-8 colon-separated groups of 0-4 hex digits, at most
/// one inner empty run, optionally ending in an embedded IPv4 literal.
pub fn is_ipv6(ip: &str) -> bool {
    let lower = ip.to_ascii_lowercase();
    let parts: Vec<&str> = lower.split(':').collect();
    let len = parts.len();
    if !(3..=IPV6_GROUPS).contains(&len) {
        return false;
    }

    let embedded_ipv4 = is_ipv4(parts[len - 1]);

    let mut inner_empty = false;
    for (i, part) in parts.iter().enumerate() {
        let hex_group = part.len() <= 4 && part.chars().all(|c| c.is_ascii_hexdigit());
        let ipv4_tail = i == len - 1 && embedded_ipv4 && len < IPV6_GROUPS;
        if !(hex_group || ipv4_tail) {
            return false;
        }
        if part.is_empty() && i > 0 && i < len - 1 {
            if inner_empty {
                return false;
            }
            inner_empty = true;
        }
    }

    // Only zero groups may precede the ffff/0 marker of an embedded IPv4.
    if embedded_ipv4 && parts[..len - 2].iter().any(|p| !p.chars().all(|c| c == '0')) {
        return false;
    }

    if parts[0].is_empty() {
        return parts[1].is_empty();
    }
    if parts[len - 1].is_empty() {
        return parts[len - 2].is_empty();
    }
    if embedded_ipv4 && len < 7 {
        return inner_empty;
    }
    if len < IPV6_GROUPS {
        return inner_empty;
    }
    true
}

/// Whether the address lies in a private, CGNAT or link-local range.
pub fn is_private(ip: &str) -> Result<bool, AddressError> {
    if let Some(octets) = parse_ipv4(ip) {
        let value = u32::from_be_bytes(octets);
        return Ok(IPV4_PRIVATE_NETWORKS.iter().any(|(network, prefix)| {
            let mask = u32::MAX << (32 - prefix);
            value & mask == u32::from_be_bytes(*network)
        }));
    }

    if is_ipv6(ip) {
        let lower = ip.to_ascii_lowercase();
        let parts: Vec<&str> = lower.split(':').collect();
        let last = parts[parts.len() - 1];
        if is_ipv4(last) {
            return is_private(last);
        }
        let Ok(first) = u16::from_str_radix(parts[0], 16) else {
            return Ok(false);
        };
        // fc00::/7 unique-local, fe80::/10 link-local
        return Ok(first & 0xfe00 == 0xfc00 || first & 0xffc0 == 0xfe80);
    }

    Err(AddressError::Malformed(ip.to_string()))
}

/// Canonical form of an address.
///
/// IPv4 loses leading zeros. IPv6 is lower-cased, groups lose leading zeros
/// and the longest run of two or more zero groups collapses into `::`.
/// An IPv6 literal carrying an embedded IPv4 normalizes to that IPv4.
pub fn normalize(ip: &str) -> Result<String, AddressError> {
    if let Some(octets) = parse_ipv4(ip) {
        return Ok(format_ipv4(octets));
    }

    if !is_ipv6(ip) {
        return Err(AddressError::Malformed(ip.to_string()));
    }

    let lower = ip.to_ascii_lowercase();
    if let Some(tail) = lower.rsplit(':').next() {
        if let Some(octets) = parse_ipv4(tail) {
            return Ok(format_ipv4(octets));
        }
    }

    let groups = expand_ipv6(&lower).ok_or_else(|| AddressError::Malformed(ip.to_string()))?;
    Ok(compress_ipv6(&groups))
}

/// Normalize and reject blacklisted addresses.
pub fn sanitize(ip: &str) -> Result<String, AddressError> {
    let sane = normalize(ip)?;
    if IP_BLACKLIST.contains(&sane.as_str()) {
        return Err(AddressError::Malformed(ip.to_string()));
    }
    Ok(sane)
}

// =============================================================================
// NetAddress
// =============================================================================

/// A resolved network address attached to a connection or peer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetAddress {
    /// Sanitized IP address
    Ip(String),
    /// Placeholder for peers whose address could not be determined
    Unknown,
}

impl NetAddress {
    /// Parse and sanitize an IP address string
    pub fn parse(ip: &str) -> Result<Self, AddressError> {
        Ok(NetAddress::Ip(sanitize(ip)?))
    }

    /// Build from a socket-level IP
    pub fn from_ip(ip: IpAddr) -> Result<Self, AddressError> {
        Self::parse(&ip.to_string())
    }

    pub fn is_private(&self) -> bool {
        match self {
            NetAddress::Ip(ip) => is_private(ip).unwrap_or(false),
            NetAddress::Unknown => false,
        }
    }

    /// True for placeholders that don't name a physical host
    pub fn is_pseudo(&self) -> bool {
        matches!(self, NetAddress::Unknown)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddress::Ip(ip) => write!(f, "{}", ip),
            NetAddress::Unknown => write!(f, "<unknown>"),
        }
    }
}

// =============================================================================
// Private helpers
// =============================================================================

fn parse_ipv4(ip: &str) -> Option<[u8; 4]> {
    let mut octets = [0u8; 4];
    let mut parts = ip.split('.');
    for octet in octets.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // Strip leading zeros first so long zero-padded octets still parse.
        let digits = part.trim_start_matches('0');
        let value: u32 = if digits.is_empty() { 0 } else { digits.parse().ok()? };
        *octet = u8::try_from(value).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}

fn format_ipv4(octets: [u8; 4]) -> String {
    format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
}

/// Expand a validated IPv6 literal (without embedded IPv4) into 8 groups.
fn expand_ipv6(ip: &str) -> Option<[u16; IPV6_GROUPS]> {
    let parse_side = |side: &str| -> Option<Vec<u16>> {
        if side.is_empty() {
            return Some(Vec::new());
        }
        side.split(':')
            .map(|g| if g.is_empty() { Some(0) } else { u16::from_str_radix(g, 16).ok() })
            .collect()
    };

    let (head, tail) = match ip.split_once("::") {
        Some((head, tail)) => (parse_side(head)?, parse_side(tail)?),
        None => (parse_side(ip)?, Vec::new()),
    };

    if head.len() + tail.len() > IPV6_GROUPS {
        return None;
    }
    if !ip.contains("::") && head.len() != IPV6_GROUPS {
        return None;
    }

    let mut groups = [0u16; IPV6_GROUPS];
    groups[..head.len()].copy_from_slice(&head);
    groups[IPV6_GROUPS - tail.len()..].copy_from_slice(&tail);
    Some(groups)
}

fn compress_ipv6(groups: &[u16; IPV6_GROUPS]) -> String {
    // Longest run of zero groups; the first one wins ties.
    let mut best: Option<(usize, usize)> = None;
    let mut current: Option<(usize, usize)> = None;
    for (i, group) in groups.iter().enumerate() {
        if *group == 0 {
            current = match current {
                Some((start, len)) => Some((start, len + 1)),
                None => Some((i, 1)),
            };
        } else {
            current = None;
        }
        if let Some((start, len)) = current {
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((start, len));
            }
        }
    }

    let render = |gs: &[u16]| gs.iter().map(|g| format!("{:x}", g)).collect::<Vec<_>>().join(":");

    match best {
        Some((start, len)) if len > 1 => {
            let head = render(&groups[..start]);
            let tail = render(&groups[start + len..]);
            format!("{}::{}", head, tail)
        }
        _ => render(groups),
    }
}

// =============================================================================
// Tests
// =============================================================================
