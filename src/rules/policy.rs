//! Routing decision per target host
//!
//! `none` means the listener behaves like a transparent proxy over
//! direct sockets; `global` always tunnels. `bypass_cn` goes direct
//! exactly when the target is (or resolves to) an address in the range
//! tables, and falls back to the tunnel when resolution fails.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::net::lookup_host;
use tracing::debug;

use super::ranges::RangeTables;
use crate::config::RoutingMode;

/// The two possible outcomes of a routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Tunnel,
}

/// Immutable routing policy shared by all ingress connections
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    mode: RoutingMode,
    tables: Arc<RangeTables>,
}

impl RoutingPolicy {
    pub fn new(mode: RoutingMode, tables: Arc<RangeTables>) -> Self {
        Self { mode, tables }
    }

    #[must_use]
    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// Decide the route for a target host (name or IP literal).
    ///
    /// A name is treated as direct iff any address it resolves to is in
    /// the tables; resolver failure defaults to the tunnel.
    pub async fn decide(&self, host: &str) -> Route {
        match self.mode {
            RoutingMode::None => Route::Direct,
            RoutingMode::Global => Route::Tunnel,
            RoutingMode::BypassCn => self.decide_bypass(host).await,
        }
    }

    async fn decide_bypass(&self, host: &str) -> Route {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return if self.tables.contains(ip) {
                Route::Direct
            } else {
                Route::Tunnel
            };
        }

        match lookup_host((host, 0u16)).await {
            Ok(addrs) => {
                for addr in addrs {
                    if self.tables.contains(addr.ip()) {
                        return Route::Direct;
                    }
                }
                Route::Tunnel
            }
            Err(e) => {
                debug!(host, error = %e, "resolution failed, routing through tunnel");
                Route::Tunnel
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(mode: RoutingMode) -> RoutingPolicy {
        let tables = RangeTables::from_text("1.0.1.0 1.0.1.255\n", "2400:da00:: 2400:da00::ffff\n");
        RoutingPolicy::new(mode, Arc::new(tables))
    }

    #[tokio::test]
    async fn none_is_always_direct() {
        let p = policy(RoutingMode::None);
        assert_eq!(p.decide("example.com").await, Route::Direct);
        assert_eq!(p.decide("8.8.8.8").await, Route::Direct);
    }

    #[tokio::test]
    async fn global_is_always_tunnel() {
        let p = policy(RoutingMode::Global);
        assert_eq!(p.decide("1.0.1.1").await, Route::Tunnel);
    }

    #[tokio::test]
    async fn bypass_tests_ip_literals_against_tables() {
        let p = policy(RoutingMode::BypassCn);
        assert_eq!(p.decide("1.0.1.1").await, Route::Direct);
        assert_eq!(p.decide("8.8.8.8").await, Route::Tunnel);
        assert_eq!(p.decide("2400:da00::1").await, Route::Direct);
        assert_eq!(p.decide("2001:4860:4860::8888").await, Route::Tunnel);
    }
}
