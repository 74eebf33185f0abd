// Copyright (C) 2023 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PatternError {
    #[error("invalid CIDR block '{0}'")]
    InvalidCidr(String),
    #[error("octet ranges are only supported in the final octet: '{0}'")]
    MultiOctetRange(String),
    #[error("invalid octet range '{0}'")]
    InvalidRange(String),
    #[error("failed to resolve '{0}'")]
    Resolution(String),
}

/// A user-supplied host string, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    SingleIp(IpAddr),
    Cidr(Ipv4Network),
    PartialRange { base: [u8; 3], start: u8, end: u8 },
    Hostname(String),
    Fqdn(String),
}

/// One (display-name, address) pair produced by expansion. The name is
/// empty when the user supplied a bare address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub name: String,
    pub ip: IpAddr,
}

/// A probeable endpoint with a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl Target {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Name for SNI and the hostname check; falls back to the address.
    pub fn display(&self) -> String {
        if self.name.is_empty() {
            self.ip.to_string()
        } else {
            self.name.clone()
        }
    }
}

/// Name resolution seam; injected so tests can stub DNS.
pub trait Resolve {
    fn resolve(&self, name: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// System resolver, the production implementation.
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, name: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok((name, 0u16)
            .to_socket_addrs()?
            .map(|addr| addr.ip())
            .collect())
    }
}

pub fn parse_pattern(pattern: &str) -> Result<HostPattern, PatternError> {
    let pattern = pattern.trim();
    if let Ok(ip) = pattern.parse::<IpAddr>() {
        return Ok(HostPattern::SingleIp(ip));
    }
    if pattern.contains('/') {
        return pattern
            .parse::<Ipv4Network>()
            .map(HostPattern::Cidr)
            .map_err(|_| PatternError::InvalidCidr(pattern.to_string()));
    }
    if pattern
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == '-')
        && pattern.contains('-')
    {
        return parse_octet_range(pattern);
    }
    if pattern.contains('.') {
        Ok(HostPattern::Fqdn(pattern.to_string()))
    } else {
        Ok(HostPattern::Hostname(pattern.to_string()))
    }
}

/// `a.b.c.d-e` addressing. Only the final octet may carry a range; ranges in
/// earlier octets are rejected rather than guessed at.
fn parse_octet_range(pattern: &str) -> Result<HostPattern, PatternError> {
    let parts: Vec<&str> = pattern.split('.').collect();
    if parts.len() != 4 {
        return Err(PatternError::InvalidRange(pattern.to_string()));
    }
    if parts[..3].iter().any(|octet| octet.contains('-')) {
        return Err(PatternError::MultiOctetRange(pattern.to_string()));
    }
    let mut base = [0u8; 3];
    for (slot, octet) in base.iter_mut().zip(&parts[..3]) {
        *slot = octet
            .parse()
            .map_err(|_| PatternError::InvalidRange(pattern.to_string()))?;
    }
    let Some((start, end)) = parts[3].split_once('-') else {
        return Err(PatternError::InvalidRange(pattern.to_string()));
    };
    let start: u8 = start
        .parse()
        .map_err(|_| PatternError::InvalidRange(pattern.to_string()))?;
    let end: u8 = end
        .parse()
        .map_err(|_| PatternError::InvalidRange(pattern.to_string()))?;
    if start > end {
        return Err(PatternError::InvalidRange(pattern.to_string()));
    }
    Ok(HostPattern::PartialRange { base, start, end })
}

#[derive(Debug, Default)]
pub struct Expansion {
    pub endpoints: Vec<Endpoint>,
    pub errors: Vec<(String, PatternError)>,
}

/// Expand user patterns into endpoints.
///
/// Deduplication applies to exact pattern strings BEFORE expansion; two
/// patterns that overlap after expansion (a CIDR block and a singleton
/// inside it, say) are NOT collapsed, preserving the historical behavior.
/// CIDR blocks enumerate every address including network and broadcast.
/// Resolution failures are reported per pattern and never abort the rest;
/// output order follows input pattern order and is stable within each
/// pattern.
pub fn expand(patterns: &[String], resolver: &dyn Resolve) -> Expansion {
    let mut seen = HashSet::new();
    let mut expansion = Expansion::default();

    for pattern in patterns {
        let pattern = pattern.trim();
        if pattern.is_empty() || !seen.insert(pattern.to_string()) {
            continue;
        }
        match parse_pattern(pattern) {
            Err(err) => expansion.errors.push((pattern.to_string(), err)),
            Ok(parsed) => expand_one(parsed, pattern, resolver, &mut expansion),
        }
    }
    expansion
}

fn expand_one(
    pattern: HostPattern,
    original: &str,
    resolver: &dyn Resolve,
    expansion: &mut Expansion,
) {
    match pattern {
        HostPattern::SingleIp(ip) => expansion.endpoints.push(Endpoint {
            name: String::new(),
            ip,
        }),
        HostPattern::Cidr(net) => {
            for ip in net.iter() {
                expansion.endpoints.push(Endpoint {
                    name: String::new(),
                    ip: IpAddr::V4(ip),
                });
            }
        }
        HostPattern::PartialRange { base, start, end } => {
            for octet in start..=end {
                expansion.endpoints.push(Endpoint {
                    name: String::new(),
                    ip: IpAddr::V4(Ipv4Addr::new(base[0], base[1], base[2], octet)),
                });
            }
        }
        HostPattern::Hostname(name) | HostPattern::Fqdn(name) => {
            match resolver.resolve(&name) {
                Err(_) => expansion
                    .errors
                    .push((original.to_string(), PatternError::Resolution(name))),
                Ok(addrs) => {
                    // Dedupe within this one pattern only.
                    let mut seen = HashSet::new();
                    for ip in addrs {
                        if seen.insert(ip) {
                            expansion.endpoints.push(Endpoint {
                                name: name.clone(),
                                ip,
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Cross endpoints with the port list into probe targets.
pub fn cross_ports(endpoints: &[Endpoint], ports: &[u16]) -> Vec<Target> {
    endpoints
        .iter()
        .flat_map(|endpoint| {
            ports.iter().map(move |&port| Target {
                name: endpoint.name.clone(),
                ip: endpoint.ip,
                port,
            })
        })
        .collect()
}

#[cfg(test)]
mod test_parse {
    use super::{parse_pattern, HostPattern, PatternError};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_single_ip() {
        assert_eq!(
            parse_pattern("192.0.2.1"),
            Ok(HostPattern::SingleIp(IpAddr::V4(Ipv4Addr::new(
                192, 0, 2, 1
            ))))
        );
    }

    #[test]
    fn test_cidr() {
        assert!(matches!(
            parse_pattern("10.0.0.0/24"),
            Ok(HostPattern::Cidr(_))
        ));
        assert_eq!(
            parse_pattern("10.0.0.0/33"),
            Err(PatternError::InvalidCidr("10.0.0.0/33".to_string()))
        );
    }

    #[test]
    fn test_final_octet_range() {
        assert_eq!(
            parse_pattern("10.0.0.5-10"),
            Ok(HostPattern::PartialRange {
                base: [10, 0, 0],
                start: 5,
                end: 10
            })
        );
    }

    #[test]
    fn test_multi_octet_range_rejected() {
        assert_eq!(
            parse_pattern("10.0.1-2.5"),
            Err(PatternError::MultiOctetRange("10.0.1-2.5".to_string()))
        );
    }

    #[test]
    fn test_reversed_range_rejected() {
        assert_eq!(
            parse_pattern("10.0.0.10-5"),
            Err(PatternError::InvalidRange("10.0.0.10-5".to_string()))
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(
            parse_pattern("gateway"),
            Ok(HostPattern::Hostname("gateway".to_string()))
        );
        assert_eq!(
            parse_pattern("www.example.com"),
            Ok(HostPattern::Fqdn("www.example.com".to_string()))
        );
        // Hostnames with hyphens are names, not ranges.
        assert_eq!(
            parse_pattern("my-host.example.com"),
            Ok(HostPattern::Fqdn("my-host.example.com".to_string()))
        );
    }
}

#[cfg(test)]
mod test_expand {
    use super::{cross_ports, expand, Endpoint, Resolve};
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    struct StubResolver;

    impl Resolve for StubResolver {
        fn resolve(&self, name: &str) -> std::io::Result<Vec<IpAddr>> {
            match name {
                "www.example.com" => Ok(vec![
                    IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)),
                    IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)),
                    IpAddr::V4(Ipv4Addr::new(198, 51, 100, 8)),
                ]),
                _ => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no such host",
                )),
            }
        }
    }

    fn s(x: &str) -> String {
        x.to_string()
    }

    #[test]
    fn test_cidr_enumerates_all_addresses() {
        let expansion = expand(&[s("10.0.0.0/30")], &StubResolver);
        let ips: Vec<String> = expansion
            .endpoints
            .iter()
            .map(|e| e.ip.to_string())
            .collect();
        assert_eq!(ips, vec!["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_pattern_dedupe_is_exact_string_only() {
        let expansion = expand(
            &[s("192.0.2.1"), s("192.0.2.1"), s("192.0.2.0/30")],
            &StubResolver,
        );
        assert!(expansion.errors.is_empty());
        // The literal duplicate collapses; the CIDR overlap does not.
        let count = expansion
            .endpoints
            .iter()
            .filter(|e| e.ip.to_string() == "192.0.2.1")
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_resolution_failure_does_not_abort() {
        let expansion = expand(
            &[s("missing.example.net"), s("www.example.com")],
            &StubResolver,
        );
        assert_eq!(expansion.errors.len(), 1);
        assert_eq!(
            expansion.endpoints,
            vec![
                Endpoint {
                    name: s("www.example.com"),
                    ip: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)),
                },
                Endpoint {
                    name: s("www.example.com"),
                    ip: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 8)),
                },
            ]
        );
    }

    #[test]
    fn test_expansion_is_idempotent() {
        let first = expand(&[s("10.1.2.0/29"), s("10.1.3.1-4")], &StubResolver);
        let strings: Vec<String> = first
            .endpoints
            .iter()
            .map(|e| e.ip.to_string())
            .collect();
        let second = expand(&strings, &StubResolver);
        let as_set = |endpoints: &[Endpoint]| -> HashSet<IpAddr> {
            endpoints.iter().map(|e| e.ip).collect()
        };
        assert_eq!(as_set(&first.endpoints), as_set(&second.endpoints));
    }

    #[test]
    fn test_cross_ports() {
        let expansion = expand(&[s("10.0.0.1-2")], &StubResolver);
        let targets = cross_ports(&expansion.endpoints, &[443, 8443]);
        assert_eq!(targets.len(), 4);
        assert_eq!(targets[0].addr().to_string(), "10.0.0.1:443");
        assert_eq!(targets[3].addr().to_string(), "10.0.0.2:8443");
    }
}
