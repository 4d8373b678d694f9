//! Configuration types for both ends of the tunnel

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::addr::FallbackAddr;
use crate::error::ConfigError;

/// Traffic routing mode for the ingress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Everything goes through the tunnel
    Global,
    /// Addresses found in the range tables connect directly
    #[default]
    BypassCn,
    /// Everything connects directly; the egress is never contacted
    None,
}

impl RoutingMode {
    /// Parse the mode name used in config files and flags
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "global" => Ok(Self::Global),
            "bypass_cn" => Ok(Self::BypassCn),
            "none" => Ok(Self::None),
            other => Err(ConfigError::validation(format!(
                "unknown routing mode: {other}"
            ))),
        }
    }
}

/// Ingress (local proxy) configuration, immutable once started
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngressConfig {
    /// Local listen address
    pub listen_addr: String,
    /// Egress server as `host:port[/path]`
    pub server_addr: String,
    /// Dial this IP instead of resolving the server host
    pub server_ip: Option<IpAddr>,
    /// Shared token offered as the WebSocket subprotocol
    pub token: Option<String>,
    /// DoH endpoint used to fetch the ECH config list
    pub doh_url: String,
    /// Domain whose HTTPS record publishes the ECH config
    pub ech_domain: String,
    /// Split-routing mode
    pub routing_mode: RoutingMode,
    /// Permit dialing without ECH when no config can be resolved
    pub allow_no_ech: bool,
    /// Directory holding (or receiving) the range list files
    pub range_dir: PathBuf,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:30000".to_string(),
            server_addr: String::new(),
            server_ip: None,
            token: None,
            doh_url: "dns.alidns.com/dns-query".to_string(),
            ech_domain: "cloudflare-ech.com".to_string(),
            routing_mode: RoutingMode::default(),
            allow_no_ech: false,
            range_dir: PathBuf::from("."),
        }
    }
}

impl IngressConfig {
    /// Validate required fields and value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_addr.is_empty() {
            return Err(ConfigError::validation("server address is required"));
        }
        crate::addr::split_server_addr(&self.server_addr)
            .map_err(|e| ConfigError::validation(format!("server_addr: {e}")))?;
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| {
                ConfigError::validation(format!("invalid listen address: {}", self.listen_addr))
            })?;
        if self.doh_url.is_empty() {
            return Err(ConfigError::validation("doh_url must not be empty"));
        }
        if self.ech_domain.is_empty() {
            return Err(ConfigError::validation("ech_domain must not be empty"));
        }
        Ok(())
    }
}

/// Egress (worker) configuration, read from the environment
#[derive(Debug, Clone)]
pub struct EgressConfig {
    /// Listen address for the HTTP/WebSocket server
    pub listen_addr: std::net::SocketAddr,
    /// Required subprotocol token; `None` disables authentication
    pub token: Option<String>,
    /// Fallback endpoints tried after a transient upstream failure
    pub fallback_ips: Vec<FallbackAddr>,
    /// Upstream TCP connect timeout
    pub connect_timeout: Duration,
    /// Session read-progress watchdog
    pub read_timeout: Duration,
    /// Concurrent session cap
    pub max_sessions: usize,
    /// When non-empty, CONNECT targets must name one of these hosts
    pub allowed_hosts: Option<HashSet<String>>,
    /// Value echoed in `Access-Control-Allow-Origin`
    pub allow_origin: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8080).into(),
            token: None,
            fallback_ips: Vec::new(),
            connect_timeout: Duration::from_millis(5000),
            read_timeout: Duration::from_millis(180_000),
            max_sessions: 100,
            allowed_hosts: None,
            allow_origin: "*".to_string(),
        }
    }
}

impl EgressConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::validation("MAX_SESSIONS must be at least 1"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::validation("CONNECT_TIMEOUT_MS must be positive"));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::validation("READ_TIMEOUT_MS must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_mode_names() {
        assert_eq!(RoutingMode::parse("global").unwrap(), RoutingMode::Global);
        assert_eq!(
            RoutingMode::parse("bypass_cn").unwrap(),
            RoutingMode::BypassCn
        );
        assert_eq!(RoutingMode::parse("none").unwrap(), RoutingMode::None);
        assert!(RoutingMode::parse("direct").is_err());
    }

    #[test]
    fn ingress_defaults() {
        let cfg = IngressConfig::default();
        assert_eq!(cfg.listen_addr, "127.0.0.1:30000");
        assert_eq!(cfg.doh_url, "dns.alidns.com/dns-query");
        assert_eq!(cfg.ech_domain, "cloudflare-ech.com");
        assert_eq!(cfg.routing_mode, RoutingMode::BypassCn);
        assert!(!cfg.allow_no_ech);
    }

    #[test]
    fn ingress_requires_server_addr() {
        let cfg = IngressConfig::default();
        assert!(cfg.validate().is_err());

        let cfg = IngressConfig {
            server_addr: "worker.example.dev:443".to_string(),
            ..Default::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn egress_defaults_match_contract() {
        let cfg = EgressConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.read_timeout, Duration::from_millis(180_000));
        assert_eq!(cfg.max_sessions, 100);
        assert_eq!(cfg.allow_origin, "*");
        cfg.validate().unwrap();
    }
}
