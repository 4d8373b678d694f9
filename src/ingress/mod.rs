//! Ingress: the local proxy end of the tunnel
//!
//! A single loopback listener serves both SOCKS5 and HTTP clients; the
//! first byte of each connection picks the handler:
//!
//! ```text
//! 0x05                  -> SOCKS5 (CONNECT, UDP ASSOCIATE)
//! C G P H D O T         -> HTTP (CONNECT or forward proxy)
//! anything else         -> dropped
//! ```
//!
//! Each accepted connection then flows through the routing policy and
//! either connects directly or rides the tunnel; see [`tunnel`].

mod http;
mod socks5;
mod tunnel;

pub use tunnel::ProxyMode;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{IngressConfig, RoutingMode};
use crate::dns::EchResolver;
use crate::error::TunnelError;
use crate::fetch::HttpsFetcher;
use crate::rules::{RangeTables, RoutingPolicy};
use crate::session::CloseLatch;
use crate::tls::EchTlsClient;
use crate::tunnel::TunnelDialer;

/// Initial per-connection deadline; renewed by keepalive while tunneled
const CONNECTION_DEADLINE: Duration = Duration::from_secs(300);

/// Counters for the ingress listener
#[derive(Debug, Default)]
pub struct IngressStats {
    pub connections_accepted: AtomicU64,
    pub connections_completed: AtomicU64,
    pub connection_errors: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    active: AtomicU64,
}

impl IngressStats {
    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> IngressStatsSnapshot {
        IngressStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_completed: self.connections_completed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`IngressStats`]
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IngressStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_completed: u64,
    pub connection_errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Shared state every connection handler sees
pub(crate) struct IngressContext {
    pub config: Arc<IngressConfig>,
    pub policy: RoutingPolicy,
    pub dialer: TunnelDialer,
    pub stats: Arc<IngressStats>,
    /// Lifecycle signal; closing it winds down every live connection
    pub lifecycle: Arc<CloseLatch>,
}

/// The ingress listener
pub struct IngressServer {
    ctx: Arc<IngressContext>,
}

impl IngressServer {
    /// Resolve the ECH config, load routing tables, and assemble the
    /// server. Fails when ECH cannot be resolved and the config does
    /// not permit dialing without it.
    pub async fn build(config: IngressConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        let config = Arc::new(config);
        let fetcher = HttpsFetcher::new();

        let resolver = Arc::new(EchResolver::new(
            &config.doh_url,
            &config.ech_domain,
            fetcher.clone(),
        ));
        info!(domain = %config.ech_domain, "resolving ECH config");
        if let Err(e) = resolver.prepare().await {
            if config.allow_no_ech {
                warn!(error = %e, "ECH resolution failed, continuing without it");
            } else {
                return Err(TunnelError::Dns(e));
            }
        }

        let tables = match config.routing_mode {
            RoutingMode::BypassCn => {
                match RangeTables::load_or_download(&config.range_dir, &fetcher).await {
                    Ok(tables) => tables,
                    Err(e) => {
                        warn!(error = %e, "range tables unavailable, bypass lookups will miss");
                        RangeTables::empty()
                    }
                }
            }
            _ => RangeTables::empty(),
        };
        let policy = RoutingPolicy::new(config.routing_mode, Arc::new(tables));

        let (server, path) = crate::addr::split_server_addr(&config.server_addr)?;
        let tls = EchTlsClient::new(
            Arc::clone(&resolver),
            config.server_ip,
            config.allow_no_ech,
        );
        let dialer = TunnelDialer::new(server, path, config.token.clone(), tls, resolver);

        Ok(Self {
            ctx: Arc::new(IngressContext {
                config,
                policy,
                dialer,
                stats: Arc::new(IngressStats::default()),
                lifecycle: CloseLatch::new(),
            }),
        })
    }

    #[must_use]
    pub fn stats(&self) -> Arc<IngressStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Accept and dispatch connections until shutdown
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.ctx.config.listen_addr).await?;
        info!(
            addr = %self.ctx.config.listen_addr,
            server = %self.ctx.dialer.server(),
            mode = ?self.ctx.config.routing_mode,
            "ingress listening (SOCKS5 + HTTP)"
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                handle_connection(stream, peer, ctx).await;
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                () = self.ctx.lifecycle.wait() => {
                    info!("ingress shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Signal shutdown; live connections observe the lifecycle latch
    pub fn shutdown(&self) {
        self.ctx.lifecycle.close();
    }
}

/// Guard keeping the active-connection gauge honest
struct ActiveGuard(Arc<IngressStats>);

impl ActiveGuard {
    fn new(stats: Arc<IngressStats>) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    ctx: Arc<IngressContext>,
) {
    if ctx.lifecycle.is_closed() {
        return;
    }
    let _ = stream.set_nodelay(true);

    ctx.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
    let _active = ActiveGuard::new(Arc::clone(&ctx.stats));
    debug!(peer = %peer, active = ctx.stats.active(), "connection accepted");

    // First byte picks the protocol
    let mut first = [0u8; 1];
    match timeout(CONNECTION_DEADLINE, stream.read(&mut first)).await {
        Ok(Ok(1)) => {}
        Ok(_) | Err(_) => return,
    }

    let result = match first[0] {
        0x05 => socks5::handle(stream, peer, Arc::clone(&ctx)).await,
        b'C' | b'G' | b'P' | b'H' | b'D' | b'O' | b'T' => {
            http::handle(stream, first[0], peer, Arc::clone(&ctx)).await
        }
        other => {
            debug!(peer = %peer, byte = format!("0x{other:02x}"), "unknown protocol, dropping");
            return;
        }
    };

    match result {
        Ok(()) => {
            ctx.stats.connections_completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            ctx.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %peer, error = %e, "connection ended with error");
        }
    }
}
