//! Host network helpers: public IP detection and flag parsing

use crate::error::{Error, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::warn;

/// Networks never considered public during auto-detection
const DEFAULT_FILTER_NETWORKS: &[&str] = &[
    // loopback
    "127.0.0.0/8",
    // RFC 1918
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    // RFC 3927
    "169.254.0.0/16",
    // RFC 6598
    "100.64.0.0/10",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// Detect the node's public address of the requested family (4 or 6).
///
/// Enumerates interface addresses and returns the first one not matched
/// by the block list. `include` adds networks to the block list,
/// `exclude` removes entries from the default set. `None` when nothing
/// qualifies; callers skip auto-detect entries in that case.
pub fn public_ip_address(family: u8, include: &str, exclude: &str) -> Option<IpAddr> {
    let addrs = match interface_addresses() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("could not read interface addresses: {}", e);
            return None;
        }
    };

    let blocked = filter_networks(include, exclude);

    addrs.into_iter().find(|addr| {
        let family_matches = match addr {
            IpAddr::V4(_) => family == 4,
            IpAddr::V6(_) => family == 6,
        };
        family_matches && !blocked.iter().any(|net| net.contains(addr))
    })
}

fn interface_addresses() -> Result<Vec<IpAddr>> {
    let ifaddrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::Detection(format!("listing interface addresses failed: {}", e)))?;

    let mut addrs = Vec::new();
    for ifaddr in ifaddrs {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            addrs.push(IpAddr::V4(sin.ip()));
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            addrs.push(IpAddr::V6(sin6.ip()));
        }
    }
    Ok(addrs)
}

/// Assemble the effective block list from the default set and the
/// operator supplied include/exclude flags.
fn filter_networks(include: &str, exclude: &str) -> Vec<IpNet> {
    let excluded: Vec<&str> = exclude.split(',').filter(|s| !s.is_empty()).collect();

    let mut networks = Vec::new();
    for cidr in DEFAULT_FILTER_NETWORKS {
        if excluded.contains(cidr) {
            continue;
        }
        match cidr.parse::<IpNet>() {
            Ok(net) => networks.push(net),
            Err(e) => warn!("skipping unparseable default filter network {}: {}", cidr, e),
        }
    }
    for cidr in include.split(',').filter(|s| !s.is_empty()) {
        match cidr.parse::<IpNet>() {
            Ok(net) => networks.push(net),
            Err(e) => warn!("skipping unparseable filter network {}: {}", cidr, e),
        }
    }
    networks
}

/// Strip the domain part from a node host name
pub fn short_host_name(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}

/// Parse the signed jump position triple (FORWARD,PREROUTING,POSTROUTING).
///
/// Malformed input falls back to position 1 per element.
pub fn parse_jump_positions(value: &str) -> (i16, i16, i16) {
    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != 3 {
        return (1, 1, 1);
    }
    let position = |part: &str| part.trim().parse::<i16>().unwrap_or(1);
    (position(parts[0]), position(parts[1]), position(parts[2]))
}

/// Parse a comma separated port list
pub fn parse_port_list(value: &str) -> Result<Vec<u16>> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.trim()
                .parse::<u16>()
                .map_err(|e| Error::Validation(format!("invalid port '{}': {}", part, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_list_blocks_rfc1918_by_default() {
        let blocked = filter_networks("", "");
        let addr: IpAddr = "192.168.1.10".parse().unwrap();
        assert!(blocked.iter().any(|net| net.contains(&addr)));

        let public: IpAddr = "1.2.3.4".parse().unwrap();
        assert!(!blocked.iter().any(|net| net.contains(&public)));
    }

    #[test]
    fn exclude_opens_a_default_network() {
        let blocked = filter_networks("", "192.168.0.0/16");
        let addr: IpAddr = "192.168.1.10".parse().unwrap();
        assert!(!blocked.iter().any(|net| net.contains(&addr)));
    }

    #[test]
    fn include_blocks_an_additional_network() {
        let blocked = filter_networks("1.2.3.0/24", "");
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        assert!(blocked.iter().any(|net| net.contains(&addr)));
    }

    #[test]
    fn short_host_name_strips_domain() {
        assert_eq!(short_host_name("node1.cluster.local"), "node1");
        assert_eq!(short_host_name("node1"), "node1");
    }

    #[test]
    fn jump_positions_parse_and_fall_back() {
        assert_eq!(parse_jump_positions("-2,-2,-2"), (-2, -2, -2));
        assert_eq!(parse_jump_positions("1,2,3"), (1, 2, 3));
        assert_eq!(parse_jump_positions("1,2"), (1, 1, 1));
        assert_eq!(parse_jump_positions("a,b,c"), (1, 1, 1));
        assert_eq!(parse_jump_positions(""), (1, 1, 1));
    }

    #[test]
    fn port_list_parses() {
        assert_eq!(parse_port_list("22,53,6443").unwrap(), vec![22, 53, 6443]);
        assert!(parse_port_list("").unwrap().is_empty());
        assert!(parse_port_list("22,nope").is_err());
    }
}
