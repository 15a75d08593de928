//! Client identity resolution
//!
//! - Loopback normalization (`::1` / `::ffff:127.0.0.1` -> `127.0.0.1`)
//! - Client key resolution (authenticated user id overrides the IP)
//! - X-Forwarded-For trust chain (only honoured from trusted proxies)

use std::net::IpAddr;

use axum::http::HeaderMap;
use ipnet::IpNet;

/// Canonical IPv4 loopback form
pub const LOOPBACK: &str = "127.0.0.1";

/// Collapse the IPv6 loopback spellings onto the IPv4 loopback.
/// Every other input is returned unchanged.
pub fn normalize_ip(ip: &str) -> String {
    match ip {
        "::1" | "::ffff:127.0.0.1" => LOOPBACK.to_string(),
        other => other.to_string(),
    }
}

/// Resolve the tracking key: the user id when authenticated, else the normalized IP.
pub fn resolve_client_key(ip: &str, user_id: Option<&str>) -> String {
    match user_id {
        Some(user) => user.to_string(),
        None => normalize_ip(ip),
    }
}

/// Identity of the client behind a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Normalized client IP
    pub ip: String,
    /// Authenticated user id, if any
    pub user_id: Option<String>,
}

impl ClientIdentity {
    pub fn new(ip: &str, user_id: Option<String>) -> Self {
        Self {
            ip: normalize_ip(ip),
            user_id,
        }
    }

    /// Key used for failures, flags and blocks
    pub fn key(&self) -> String {
        resolve_client_key(&self.ip, self.user_id.as_deref())
    }
}

/// Authenticated user id placed in request extensions by the auth layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Parse trusted proxy entries; bare addresses become host-length networks.
pub fn parse_trusted_proxies(entries: &[String]) -> Vec<IpNet> {
    entries
        .iter()
        .filter_map(|s| {
            s.parse().ok().or_else(|| {
                s.parse::<IpAddr>().ok().and_then(|ip| match ip {
                    IpAddr::V4(v4) => ipnet::Ipv4Net::new(v4, 32).ok().map(IpNet::V4),
                    IpAddr::V6(v6) => ipnet::Ipv6Net::new(v6, 128).ok().map(IpNet::V6),
                })
            })
        })
        .collect()
}

/// Determine the client IP for a connection.
///
/// The peer address is used unless the peer is a trusted proxy, in which case
/// the right-most untrusted `X-Forwarded-For` hop wins.
pub fn extract_client_ip(peer: IpAddr, headers: &HeaderMap, trusted: &[IpNet]) -> String {
    let peer_ip = unmap_ipv4(peer);
    if trusted.is_empty() || !trusted.iter().any(|cidr| cidr.contains(&peer_ip)) {
        return normalize_ip(&peer.to_string());
    }

    let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) else {
        return normalize_ip(&peer.to_string());
    };

    let hops: Vec<&str> = xff.split(',').map(str::trim).collect();
    for hop in hops.iter().rev() {
        if let Ok(ip) = hop.parse::<IpAddr>() {
            if !trusted.iter().any(|cidr| cidr.contains(&unmap_ipv4(ip))) {
                return normalize_ip(hop);
            }
        }
    }

    // Every hop is trusted: take the originating one
    hops.first()
        .filter(|first| first.parse::<IpAddr>().is_ok())
        .map(|first| normalize_ip(first))
        .unwrap_or_else(|| normalize_ip(&peer.to_string()))
}

fn unmap_ipv4(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_loopback_variants_collapse() {
        assert_eq!(normalize_ip("::1"), "127.0.0.1");
        assert_eq!(normalize_ip("::ffff:127.0.0.1"), "127.0.0.1");
        assert_eq!(normalize_ip("127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn test_other_addresses_unchanged() {
        assert_eq!(normalize_ip("192.168.1.7"), "192.168.1.7");
        assert_eq!(normalize_ip("2001:db8::1"), "2001:db8::1");
        assert_eq!(normalize_ip("::ffff:10.0.0.1"), "::ffff:10.0.0.1");
        assert_eq!(normalize_ip(""), "");
    }

    #[test]
    fn test_user_id_overrides_ip() {
        assert_eq!(resolve_client_key("::1", Some("u1")), "u1");
        assert_eq!(resolve_client_key("::1", None), "127.0.0.1");

        let identity = ClientIdentity::new("::ffff:127.0.0.1", None);
        assert_eq!(identity.ip, "127.0.0.1");
        assert_eq!(identity.key(), "127.0.0.1");
    }

    #[test]
    fn test_forwarded_for_ignored_from_untrusted_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        let peer: IpAddr = "198.51.100.4".parse().unwrap();

        assert_eq!(extract_client_ip(peer, &headers, &[]), "198.51.100.4");

        let trusted = parse_trusted_proxies(&["10.0.0.0/8".to_string()]);
        assert_eq!(extract_client_ip(peer, &headers, &trusted), "198.51.100.4");
    }

    #[test]
    fn test_forwarded_for_from_trusted_proxy() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.2"),
        );
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        let trusted = parse_trusted_proxies(&["10.0.0.0/8".to_string(), "::1".to_string()]);

        assert_eq!(trusted.len(), 2);
        assert_eq!(extract_client_ip(peer, &headers, &trusted), "203.0.113.9");
    }

    #[test]
    fn test_loopback_peer_normalized() {
        let peer: IpAddr = "::1".parse().unwrap();
        assert_eq!(extract_client_ip(peer, &HeaderMap::new(), &[]), "127.0.0.1");
    }
}
