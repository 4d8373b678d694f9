//! Endpoint and fallback-address parsing
//!
//! Canonical addresses are `host:port` with IPv6 hosts bracketed as
//! `[v6]:port`. Fallback entries may omit the port, in which case the
//! session's target port is inherited at attempt time. Path segments on
//! the egress accept a `host-port` alias because `:` is awkward inside
//! URL paths.
//!
//! Parsing then re-serializing an endpoint yields the input byte for
//! byte; several callers rely on that for logging and frame payloads.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::AddrError;

/// A `(host, port)` pair with a mandatory, validated port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// DNS name or IP literal; IPv6 is stored bracket-stripped
    pub host: String,
    /// Port in 1..=65535
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether the host is an IPv4 or IPv6 literal
    #[must_use]
    pub fn is_ip_literal(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// Host as an IP address, when it is a literal
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port_str) = split_host_port(s)?;
        let port = parse_port(s, port_str)?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// A fallback entry whose port may be inherited from the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackAddr {
    pub host: String,
    pub port: Option<u16>,
}

impl FallbackAddr {
    /// Resolve into a concrete endpoint, inheriting `target_port` when
    /// this entry carries none.
    #[must_use]
    pub fn resolve(&self, target_port: u16) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port.unwrap_or(target_port))
    }
}

impl fmt::Display for FallbackAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.host.contains(':'), self.port) {
            (true, Some(p)) => write!(f, "[{}]:{}", self.host, p),
            (true, None) => write!(f, "[{}]", self.host),
            (false, Some(p)) => write!(f, "{}:{}", self.host, p),
            (false, None) => f.write_str(&self.host),
        }
    }
}

impl FromStr for FallbackAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddrError::EmptyHost(s.to_string()));
        }
        // Bracketed IPv6, with or without port
        if let Some(rest) = s.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(|| AddrError::Malformed(s.to_string()))?;
            let host = &rest[..end];
            if host.is_empty() {
                return Err(AddrError::EmptyHost(s.to_string()));
            }
            let tail = &rest[end + 1..];
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(parse_port(s, p)?),
                None if tail.is_empty() => None,
                None => return Err(AddrError::Malformed(s.to_string())),
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }
        // Bare IPv6 literal (multiple colons) has no port component
        if s.matches(':').count() > 1 {
            return Ok(Self {
                host: s.to_string(),
                port: None,
            });
        }
        match s.rsplit_once(':') {
            Some((host, port_str)) => {
                if host.is_empty() {
                    return Err(AddrError::EmptyHost(s.to_string()));
                }
                Ok(Self {
                    host: host.to_string(),
                    port: Some(parse_port(s, port_str)?),
                })
            }
            None => Ok(Self {
                host: s.to_string(),
                port: None,
            }),
        }
    }
}

/// Parse a comma-separated fallback list, skipping empty items
pub fn parse_fallback_list(s: &str) -> Result<Vec<FallbackAddr>, AddrError> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::parse)
        .collect()
}

/// Parse the `host-port` path-segment alias into a fallback entry.
///
/// The hyphen separates the port only when the suffix is a valid port
/// number, so hyphenated hostnames pass through untouched.
pub fn parse_hyphen_fallback(item: &str) -> Result<FallbackAddr, AddrError> {
    if let Some((host, port_str)) = item.rsplit_once('-') {
        if !host.is_empty() && !port_str.is_empty() && port_str.bytes().all(|b| b.is_ascii_digit())
        {
            let port = parse_port(item, port_str)?;
            return Ok(FallbackAddr {
                host: host.to_string(),
                port: Some(port),
            });
        }
    }
    item.parse()
}

/// Parse the fallback override carried in the last segment of an
/// upgrade-request path. Returns `None` when the path has no segments.
pub fn path_fallback_override(path: &str) -> Option<Vec<FallbackAddr>> {
    let segment = path.split('/').filter(|s| !s.is_empty()).next_back()?;
    let list: Result<Vec<_>, _> = segment
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(parse_hyphen_fallback)
        .collect();
    match list {
        Ok(list) if !list.is_empty() => Some(list),
        _ => None,
    }
}

/// Split a server address of the form `host:port[/path]` into an
/// endpoint and the path remainder (defaulting to `/`).
pub fn split_server_addr(addr: &str) -> Result<(Endpoint, String), AddrError> {
    let (hostport, path) = match addr.find('/') {
        Some(idx) => (&addr[..idx], addr[idx..].to_string()),
        None => (addr, "/".to_string()),
    };
    Ok((hostport.parse()?, path))
}

fn split_host_port(s: &str) -> Result<(&str, &str), AddrError> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| AddrError::Malformed(s.to_string()))?;
        let host = &rest[..end];
        if host.is_empty() {
            return Err(AddrError::EmptyHost(s.to_string()));
        }
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| AddrError::MissingPort(s.to_string()))?;
        return Ok((host, port));
    }
    if s.matches(':').count() > 1 {
        // Bare IPv6 literal; a port would be ambiguous, so require brackets
        return Err(AddrError::MissingPort(s.to_string()));
    }
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| AddrError::MissingPort(s.to_string()))?;
    if host.is_empty() {
        return Err(AddrError::EmptyHost(s.to_string()));
    }
    Ok((host, port))
}

fn parse_port(addr: &str, port: &str) -> Result<u16, AddrError> {
    match port.parse::<u32>() {
        Ok(p) if (1..=65535).contains(&p) => Ok(p as u16),
        _ => Err(AddrError::InvalidPort(addr.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port() {
        let ep: Endpoint = "example.com:443".parse().unwrap();
        assert_eq!(ep.host, "example.com");
        assert_eq!(ep.port, 443);
        assert!(!ep.is_ip_literal());
    }

    #[test]
    fn parse_ipv6_bracketed() {
        let ep: Endpoint = "[2001:db8::1]:8443".parse().unwrap();
        assert_eq!(ep.host, "2001:db8::1");
        assert_eq!(ep.port, 8443);
        assert!(ep.is_ip_literal());
    }

    #[test]
    fn display_round_trips() {
        for input in ["example.com:80", "1.2.3.4:21415", "[::1]:443"] {
            let ep: Endpoint = input.parse().unwrap();
            assert_eq!(ep.to_string(), input);
        }
    }

    #[test]
    fn rejects_bad_ports() {
        assert_eq!(
            "example.com:0".parse::<Endpoint>(),
            Err(AddrError::InvalidPort("example.com:0".into()))
        );
        assert!("example.com:65536".parse::<Endpoint>().is_err());
        assert!("example.com:-1".parse::<Endpoint>().is_err());
        assert!("example.com:http".parse::<Endpoint>().is_err());
    }

    #[test]
    fn rejects_ipv6_without_port() {
        assert!("2001:db8::1".parse::<Endpoint>().is_err());
        assert!("[2001:db8::1]".parse::<Endpoint>().is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert_eq!(
            "example.com".parse::<Endpoint>(),
            Err(AddrError::MissingPort("example.com".into()))
        );
    }

    #[test]
    fn fallback_with_and_without_port() {
        let with: FallbackAddr = "1.2.3.4:21415".parse().unwrap();
        assert_eq!(with.port, Some(21415));
        let without: FallbackAddr = "proxy.example.net".parse().unwrap();
        assert_eq!(without.port, None);
        assert_eq!(without.resolve(443).port, 443);
        assert_eq!(with.resolve(443).port, 21415);
    }

    #[test]
    fn fallback_ipv6_forms() {
        let bare: FallbackAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(bare.port, None);
        let bracketed: FallbackAddr = "[2001:db8::1]:8443".parse().unwrap();
        assert_eq!(bracketed.port, Some(8443));
    }

    #[test]
    fn fallback_list_skips_empty_items() {
        let list = parse_fallback_list("1.2.3.4:21415, ,proxy.example.net,").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].host, "1.2.3.4");
        assert_eq!(list[1].host, "proxy.example.net");
    }

    #[test]
    fn hyphen_alias_splits_numeric_suffix_only() {
        let aliased = parse_hyphen_fallback("1.2.3.4-21415").unwrap();
        assert_eq!(aliased.host, "1.2.3.4");
        assert_eq!(aliased.port, Some(21415));

        let hyphenated_host = parse_hyphen_fallback("my-proxy.example.net").unwrap();
        assert_eq!(hyphenated_host.host, "my-proxy.example.net");
        assert_eq!(hyphenated_host.port, None);
    }

    #[test]
    fn path_override_uses_last_segment() {
        let list = path_fallback_override("/tunnel/1.2.3.4-21415,proxy.example.net").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].port, Some(21415));
        assert_eq!(list[1].port, None);

        assert!(path_fallback_override("/").is_none());
        assert!(path_fallback_override("").is_none());
    }

    #[test]
    fn server_addr_splits_path() {
        let (ep, path) = split_server_addr("worker.example.dev:443/ws").unwrap();
        assert_eq!(ep.to_string(), "worker.example.dev:443");
        assert_eq!(path, "/ws");

        let (ep, path) = split_server_addr("worker.example.dev:443").unwrap();
        assert_eq!(ep.port, 443);
        assert_eq!(path, "/");
    }
}
