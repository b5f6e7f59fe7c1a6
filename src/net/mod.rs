//! Outbound network guards.
//!
//! Before the gateway dials any caller-supplied host it must prove the
//! target is public. URL validation alone is not enough: DNS is resolved and
//! every record is checked, so a hostname that round-robins between a public
//! and a private address is still rejected.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;

/// Errors raised by the SSRF guard.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SsrfError {
    #[error("blocked hostname: {0}")]
    BlockedHostname(String),

    #[error("blocked address: {host} resolves to private address {addr}")]
    PrivateAddress { host: String, addr: IpAddr },

    #[error("empty hostname")]
    EmptyHostname,

    #[error("DNS resolution failed for {host}: {message}")]
    Resolution { host: String, message: String },
}

/// Hostnames that are never public, checked after normalization.
fn is_blocked_hostname(host: &str) -> bool {
    host == "localhost"
        || host.ends_with(".localhost")
        || host.ends_with(".local")
        || host.ends_with(".internal")
        || host == "metadata.google.internal"
}

/// Lowercase, strip one trailing dot, strip IPv6 brackets.
fn normalize_hostname(host: &str) -> String {
    let mut normalized = host.trim().to_lowercase();
    if let Some(stripped) = normalized.strip_suffix('.') {
        normalized = stripped.to_string();
    }
    if normalized.starts_with('[') && normalized.ends_with(']') {
        normalized = normalized[1..normalized.len() - 1].to_string();
    }
    normalized
}

fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 0 // 0.0.0.0/8
        || octets[0] == 10 // 10/8
        || octets[0] == 127 // 127/8
        || (octets[0] == 169 && octets[1] == 254) // 169.254/16
        || (octets[0] == 172 && (16..=31).contains(&octets[1])) // 172.16/12
        || (octets[0] == 192 && octets[1] == 168) // 192.168/16
        || (octets[0] == 100 && (64..=127).contains(&octets[1])) // 100.64/10 (CGNAT)
}

fn is_private_ipv6(ip: Ipv6Addr) -> bool {
    if ip == Ipv6Addr::UNSPECIFIED || ip == Ipv6Addr::LOCALHOST {
        return true;
    }
    // IPv4-mapped addresses are re-checked against the IPv4 rules.
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(v4);
    }
    let segments = ip.segments();
    (segments[0] & 0xfe00) == 0xfc00 // fc00::/7 unique local
        || (segments[0] & 0xffc0) == 0xfe80 // fe80::/10 link-local
        || (segments[0] & 0xffc0) == 0xfec0 // fec0::/10 deprecated site-local
}

/// Check whether an address falls in any blocked range.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(*v4),
        IpAddr::V6(v6) => is_private_ipv6(*v6),
    }
}

/// Syntactic guard: normalize and reject blocked hostnames and private IP
/// literals without touching the network.
///
/// Returns the normalized hostname for the DNS step.
pub fn assert_public_hostname_syntactic(host: &str) -> Result<String, SsrfError> {
    let normalized = normalize_hostname(host);
    if normalized.is_empty() {
        return Err(SsrfError::EmptyHostname);
    }
    if is_blocked_hostname(&normalized) {
        return Err(SsrfError::BlockedHostname(normalized));
    }
    if let Ok(ip) = normalized.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(SsrfError::PrivateAddress {
                host: normalized,
                addr: ip,
            });
        }
    }
    Ok(normalized)
}

/// Full guard: syntactic checks, then DNS resolution of all records with
/// every resolved address validated.
///
/// Returns the validated addresses so the caller can dial one of them
/// directly instead of re-resolving (DNS rebinding protection).
pub async fn resolve_public_addrs(host: &str) -> Result<Vec<IpAddr>, SsrfError> {
    let normalized = assert_public_hostname_syntactic(host)?;

    // IP literals were already validated; no lookup needed.
    if let Ok(ip) = normalized.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    let lookup = resolver
        .lookup_ip(normalized.as_str())
        .await
        .map_err(|e| SsrfError::Resolution {
            host: normalized.clone(),
            message: e.to_string(),
        })?;

    let addrs: Vec<IpAddr> = lookup.iter().collect();
    if addrs.is_empty() {
        return Err(SsrfError::Resolution {
            host: normalized,
            message: "no addresses".to_string(),
        });
    }
    for addr in &addrs {
        if is_private_ip(addr) {
            return Err(SsrfError::PrivateAddress {
                host: normalized,
                addr: *addr,
            });
        }
    }
    Ok(addrs)
}

/// Full guard without returning the addresses.
pub async fn assert_public_hostname(host: &str) -> Result<(), SsrfError> {
    resolve_public_addrs(host).await.map(|_| ())
}
