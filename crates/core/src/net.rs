//! Address helpers
//!
//! Addresses travel as strings because agents report them verbatim
//! (`:8080`, `0.0.0.0:8080`, `[::]:8080`, `example.com:443`).

use crate::{CoreError, Result};

/// Literal prefix of the private mesh network (10.126.126.0/24)
pub const OVERLAY_PREFIX: &str = "10.126.126.";

/// First port searched when allocating on an overlay hop
pub const OVERLAY_PORT_FLOOR: u16 = 10000;

/// Whether `ip` belongs to the mesh overlay.
///
/// This is a string-prefix test, not a subnet membership test:
/// `10.126.126.999` matches.
pub fn is_overlay(ip: &str) -> bool {
    ip.starts_with(OVERLAY_PREFIX)
}

/// Join a host and port, bracketing bare IPv6 literals.
///
/// An empty host yields `:port` (listen on all interfaces).
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Port component of an address such as `:8080` or `[::1]:8080`
pub fn port_of(addr: &str) -> Option<u16> {
    let (_, port) = addr.trim().rsplit_once(':')?;
    port.parse().ok()
}

/// Host component of an address, without IPv6 brackets
pub fn host_of(addr: &str) -> Option<&str> {
    let (host, _) = addr.trim().rsplit_once(':')?;
    Some(host.trim_start_matches('[').trim_end_matches(']'))
}

/// Split a comma-separated target list, validating each `host:port`
pub fn parse_remote_addrs(remote: &str) -> Result<Vec<String>> {
    let targets: Vec<String> = remote
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if targets.is_empty() {
        return Err(CoreError::InvalidAddress(remote.to_string()));
    }

    for target in &targets {
        let host_ok = host_of(target).map_or(false, |h| !h.is_empty());
        if !host_ok || port_of(target).map_or(true, |p| p == 0) {
            return Err(CoreError::InvalidAddress(target.clone()));
        }
    }

    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_overlay() {
        assert!(is_overlay("10.126.126.1"));
        assert!(is_overlay("10.126.126.254"));
        assert!(is_overlay("10.126.126.999"));
        assert!(!is_overlay("10.126.127.1"));
        assert!(!is_overlay("110.126.126.1"));
        assert!(!is_overlay("10.126.126"));
        assert!(!is_overlay(""));
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("", 20000), ":20000");
        assert_eq!(join_host_port("203.0.113.5", 443), "203.0.113.5:443");
        assert_eq!(join_host_port("2001:db8::1", 443), "[2001:db8::1]:443");
        assert_eq!(join_host_port("[::]", 80), "[::]:80");
    }

    #[test]
    fn test_port_and_host_of() {
        assert_eq!(port_of(":20000"), Some(20000));
        assert_eq!(port_of("[::]:8443"), Some(8443));
        assert_eq!(port_of("example.com"), None);
        assert_eq!(host_of("[2001:db8::1]:443"), Some("2001:db8::1"));
        assert_eq!(host_of(":80"), Some(""));
    }

    #[test]
    fn test_parse_remote_addrs() {
        let targets = parse_remote_addrs("203.0.113.5:443, 198.51.100.7:8443,").unwrap();
        assert_eq!(targets, vec!["203.0.113.5:443", "198.51.100.7:8443"]);

        assert!(parse_remote_addrs("").is_err());
        assert!(parse_remote_addrs("nohost").is_err());
        assert!(parse_remote_addrs(":443").is_err());
        assert!(parse_remote_addrs("host:0").is_err());
    }
}
