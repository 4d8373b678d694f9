//! Error types for ech-tunnel
//!
//! Errors are categorized by subsystem and aggregated into [`TunnelError`].
//! The session layer distinguishes "normal close" conditions (peer went
//! away) from real faults; see [`crate::io::is_normal_close`].

use std::io;

use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration errors (flags, environment, config file)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Address parsing errors
    #[error("address error: {0}")]
    Addr(#[from] AddrError),

    /// DNS / DoH / ECH resolution errors
    #[error("dns error: {0}")]
    Dns(#[from] DnsError),

    /// TLS / WebSocket dial errors
    #[error("dial error: {0}")]
    Dial(#[from] DialError),

    /// Framed session errors
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Ingress proxy protocol errors
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Routing rule errors
    #[error("rule error: {0}")]
    Rule(#[from] RuleError),

    /// I/O errors not covered by other categories
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file missing or unreadable
    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid values or missing required fields
    #[error("configuration validation failed: {0}")]
    Validation(String),

    /// Environment variable error
    #[error("environment variable {name}: {reason}")]
    Env { name: String, reason: String },

    /// I/O error while reading configuration
    #[error("i/o error reading configuration: {0}")]
    Io(#[from] io::Error),
}

impl ConfigError {
    pub fn env(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Env {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
}

/// Endpoint and fallback-list parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    /// Address has no port where one is required
    #[error("missing port in address: {0}")]
    MissingPort(String),

    /// Port outside 1..=65535
    #[error("invalid port in address: {0}")]
    InvalidPort(String),

    /// Empty host component
    #[error("empty host in address: {0}")]
    EmptyHost(String),

    /// Unbalanced or misplaced brackets in an IPv6 literal
    #[error("malformed address: {0}")]
    Malformed(String),
}

/// DNS wire-format and DoH errors
#[derive(Debug, Error)]
pub enum DnsError {
    /// DoH endpoint URL did not parse
    #[error("invalid DoH url: {0}")]
    InvalidUrl(String),

    /// HTTP transport failure talking to the DoH endpoint
    #[error("DoH request failed: {0}")]
    Transport(String),

    /// DoH endpoint returned a non-200 status
    #[error("DoH server returned status {0}")]
    Status(u16),

    /// Malformed DNS message
    #[error("malformed DNS response: {0}")]
    Malformed(&'static str),

    /// Answer section carried no usable record
    #[error("no HTTPS record with an ech parameter in answer")]
    NoEchConfig,

    /// ECH config cache is empty and refresh failed or was not run
    #[error("ECH config list is not loaded")]
    EchNotLoaded,

    /// Query timed out
    #[error("DoH query timed out")]
    Timeout,
}

/// TLS and WebSocket dial errors
#[derive(Debug, Error)]
pub enum DialError {
    /// TCP connect failure
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// Dial timed out
    #[error("dial to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: String, timeout_ms: u64 },

    /// Hostname could not be resolved
    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// TLS configuration could not be built
    #[error("tls config error: {0}")]
    TlsConfig(String),

    /// TLS handshake failure (includes ECH rejection)
    #[error("tls handshake with {host} failed: {reason}")]
    TlsHandshake { host: String, reason: String },

    /// WebSocket upgrade failure
    #[error("websocket handshake failed: {0}")]
    WsHandshake(String),

    /// ECH material unavailable and plain-TLS fallback is disabled
    #[error("ECH config unavailable: {0}")]
    EchUnavailable(#[from] DnsError),

    /// Retries exhausted
    #[error("dial failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl DialError {
    pub fn connect(addr: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Connect {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(addr: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            addr: addr.into(),
            timeout_ms,
        }
    }

    /// True when the failure message names ECH, meaning a config refresh
    /// may help. String matching is a bridge until the TLS stack exposes
    /// a typed rejection; keep every caller behind this one predicate.
    pub fn names_ech(&self) -> bool {
        let text = self.to_string().to_ascii_lowercase();
        if text.contains("encrypted client hello") || text.contains("encryptedclienthello") {
            return true;
        }
        // "ech" must stand alone; substrings like "unreachable" do not count
        text.split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word == "ech")
    }
}

/// Framed-session errors (both ends)
#[derive(Debug, Error)]
pub enum SessionError {
    /// Frame arrived that the current state does not allow
    #[error("unexpected frame in state {state}: {frame}")]
    UnexpectedFrame { state: &'static str, frame: String },

    /// Text frame did not match any known control form
    #[error("unknown control frame: {0}")]
    UnknownFrame(String),

    /// CONNECT target failed to parse
    #[error("invalid connect target: {0}")]
    InvalidTarget(String),

    /// Target host rejected by the allowlist
    #[error("host not allowed: {0}")]
    HostNotAllowed(String),

    /// All dial attempts for a session failed
    #[error("upstream dial failed: {0}")]
    UpstreamDial(String),

    /// WebSocket transport failed mid-session
    #[error("websocket transport error: {0}")]
    Transport(String),

    /// No upstream progress within the read timeout
    #[error("session idle past read timeout")]
    ReadTimeout,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Ingress proxy protocol errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// SOCKS5 negotiation failed
    #[error("socks5 handshake failed: {0}")]
    Socks(String),

    /// HTTP request head could not be parsed
    #[error("malformed http request: {0}")]
    Http(String),

    /// Request used a method this proxy does not serve
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// Declared body exceeds the forward-proxy cap
    #[error("request body too large: {0} bytes")]
    BodyTooLarge(u64),

    /// Tunnel establishment failed after the client was accepted
    #[error("tunnel failed: {0}")]
    Tunnel(String),

    /// Direct connection failed
    #[error("direct connection to {target} failed: {reason}")]
    Direct { target: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Routing table errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Range file missing and download failed
    #[error("range list {path} unavailable: {reason}")]
    ListUnavailable { path: String, reason: String },

    /// Range file parsed to zero usable entries
    #[error("range list {0} is empty")]
    EmptyList(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
