use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use tokio::net::lookup_host;

/// Parses one configured seed entry. Accepted forms:
/// `a.b.c.d`, `a.b.c.d:port`, `[v6::addr]:port`, and bare IPv6; entries
/// without a port get the chain's default.
pub fn parse_seed_addr(raw: &str, default_port: u16) -> Option<SocketAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.starts_with('[') {
        if let Ok(addr) = raw.parse::<SocketAddr>() {
            return Some(addr);
        }
        // bracketed but portless: "[2400:6180::1]"
        let inner = raw.strip_prefix('[')?.strip_suffix(']')?;
        let ip = inner.parse::<Ipv6Addr>().ok()?;
        return Some(SocketAddr::new(IpAddr::V6(ip), default_port));
    }

    // bare IPv4 or bare IPv6
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }

    // host:port
    raw.parse::<SocketAddr>().ok()
}

/// Resolves one DNS seed hostname into peer addresses on the default port.
pub async fn resolve_dns_seed(seed: &str, port: u16) -> io::Result<Vec<IpAddr>> {
    let addrs = lookup_host((seed, port)).await?;
    Ok(addrs.map(|addr| addr.ip()).collect())
}
