//! ech-tunnel: TCP over a TLS WebSocket carrier with Encrypted Client Hello
//!
//! Two cooperating processes move arbitrary TCP connections out of a
//! restricted network without exposing the real SNI:
//!
//! ```text
//! app ──SOCKS5/HTTP──> ingress ──TLS+ECH+WebSocket──> egress ──TCP──> target
//!                         |
//!                   split routing
//!                  (direct / tunnel)
//! ```
//!
//! - The **ingress** is a loopback proxy speaking SOCKS5 and
//!   HTTP(S)-CONNECT. It resolves the ECH config list from DNS over
//!   HTTPS, dials the egress with the inner ClientHello encrypted, and
//!   decides per target whether to tunnel at all.
//! - The **egress** accepts authenticated WebSocket upgrades, opens the
//!   requested TCP connection (walking a fallback list past transient
//!   failures), and relays bytes both ways.
//!
//! One WebSocket carries exactly one upstream TCP connection; the frame
//! grammar lives in [`session::frame`].
//!
//! # Modules
//!
//! - [`addr`]: endpoint and fallback-list parsing
//! - [`config`]: ingress file/flag and egress environment configuration
//! - [`dns`]: DoH queries, HTTPS-record parsing, the ECH config cache
//! - [`egress`]: the server end
//! - [`ingress`]: the local proxy end
//! - [`io`]: counted bidirectional copy
//! - [`rules`]: range tables and the routing policy
//! - [`session`]: shared framed-session machinery
//! - [`tls`]: ECH TLS dialing
//! - [`tunnel`]: the WebSocket dialer

pub mod addr;
pub mod config;
pub mod dns;
pub mod egress;
pub mod error;
pub mod fetch;
pub mod ingress;
pub mod io;
pub mod rules;
pub mod session;
pub mod tls;
pub mod tunnel;

pub use addr::{Endpoint, FallbackAddr};
pub use config::{EgressConfig, IngressConfig, RoutingMode};
pub use egress::EgressServer;
pub use error::TunnelError;
pub use ingress::IngressServer;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
