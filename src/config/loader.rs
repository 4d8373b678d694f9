//! Configuration loading from files and the environment

use std::path::Path;

use tracing::debug;

use super::types::{EgressConfig, IngressConfig};
use crate::addr::parse_fallback_list;
use crate::error::ConfigError;

/// Load the ingress configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or fails
/// validation.
pub fn load_ingress_file(path: impl AsRef<Path>) -> Result<IngressConfig, ConfigError> {
    let path = path.as_ref();
    debug!("loading ingress configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: IngressConfig = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::Parse(format!("{e} at {path:?}")))?;
    config.validate()?;
    Ok(config)
}

/// Build the egress configuration from environment variables
///
/// Recognized variables: `LISTEN_ADDR`, `TOKEN`, `FALLBACK_IPS`
/// (comma-separated), `CONNECT_TIMEOUT_MS`, `READ_TIMEOUT_MS`,
/// `MAX_SESSIONS`, `ALLOWED_HOSTS` (comma-separated), `ALLOW_ORIGIN`.
/// `LOG_LEVEL` is consumed by the logging setup, not here.
pub fn load_egress_env() -> Result<EgressConfig, ConfigError> {
    let mut config = EgressConfig::default();

    if let Some(addr) = env_nonempty("LISTEN_ADDR") {
        config.listen_addr = addr
            .parse()
            .map_err(|_| ConfigError::env("LISTEN_ADDR", format!("invalid address: {addr}")))?;
    }
    if let Some(token) = env_nonempty("TOKEN") {
        config.token = Some(token);
    }
    if let Some(list) = env_nonempty("FALLBACK_IPS") {
        config.fallback_ips = parse_fallback_list(&list)
            .map_err(|e| ConfigError::env("FALLBACK_IPS", e.to_string()))?;
    }
    if let Some(ms) = env_nonempty("CONNECT_TIMEOUT_MS") {
        config.connect_timeout = parse_millis("CONNECT_TIMEOUT_MS", &ms)?;
    }
    if let Some(ms) = env_nonempty("READ_TIMEOUT_MS") {
        config.read_timeout = parse_millis("READ_TIMEOUT_MS", &ms)?;
    }
    if let Some(max) = env_nonempty("MAX_SESSIONS") {
        config.max_sessions = max
            .parse()
            .map_err(|_| ConfigError::env("MAX_SESSIONS", format!("invalid count: {max}")))?;
    }
    if let Some(hosts) = env_nonempty("ALLOWED_HOSTS") {
        let set: std::collections::HashSet<String> = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        if !set.is_empty() {
            config.allowed_hosts = Some(set);
        }
    }
    if let Some(origin) = env_nonempty("ALLOW_ORIGIN") {
        config.allow_origin = origin;
    }

    config.validate()?;
    Ok(config)
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_millis(name: &str, value: &str) -> Result<std::time::Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(std::time::Duration::from_millis)
        .map_err(|_| ConfigError::env(name, format!("invalid milliseconds: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingress_file_round_trip() {
        let json = r#"{
            "server_addr": "worker.example.dev:443/ws",
            "token": "secret",
            "routing_mode": "global"
        }"#;
        let config: IngressConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server_addr, "worker.example.dev:443/ws");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.listen_addr, "127.0.0.1:30000");
    }

    #[test]
    fn ingress_file_rejects_unknown_fields() {
        let json = r#"{"server_addr": "a:1", "bogus": true}"#;
        assert!(serde_json::from_str::<IngressConfig>(json).is_err());
    }

    #[test]
    fn millis_parser() {
        assert_eq!(
            parse_millis("X", "1500").unwrap(),
            std::time::Duration::from_millis(1500)
        );
        assert!(parse_millis("X", "soon").is_err());
    }
}
