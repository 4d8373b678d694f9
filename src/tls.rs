//! ECH-capable TLS dialing
//!
//! Builds a rustls client configuration with an Encrypted Client Hello
//! config list obtained from DNS, and dials the egress either by
//! hostname (system DNS) or a pinned override IP. rustls' own ECH mode
//! replaces the original deployment's reflective field access; with
//! `EchMode::Enable` a handshake whose ECH offer is rejected by the
//! server fails hard rather than trusting the outer certificate.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::aws_lc_rs;
use rustls::crypto::aws_lc_rs::hpke::ALL_SUPPORTED_SUITES;
use rustls::client::{EchConfig, EchMode};
use rustls::pki_types::{EchConfigListBytes, ServerName};
use rustls::{ClientConfig, RootCertStore};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::dns::EchResolver;
use crate::error::DialError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS dialer bound to one egress deployment
pub struct EchTlsClient {
    resolver: Arc<EchResolver>,
    ip_override: Option<IpAddr>,
    allow_no_ech: bool,
}

impl std::fmt::Debug for EchTlsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchTlsClient")
            .field("ip_override", &self.ip_override)
            .field("allow_no_ech", &self.allow_no_ech)
            .finish_non_exhaustive()
    }
}

impl EchTlsClient {
    pub fn new(resolver: Arc<EchResolver>, ip_override: Option<IpAddr>, allow_no_ech: bool) -> Self {
        Self {
            resolver,
            ip_override,
            allow_no_ech,
        }
    }

    /// Establish a TLS connection to `dial_host:port` with SNI `sni`.
    ///
    /// `dial_host` is normally the same as `sni`; the tunneled DoH path
    /// passes the egress endpoint with the resolver's SNI instead. The
    /// override IP, when configured, replaces name resolution entirely.
    pub async fn connect(
        &self,
        sni: &str,
        dial_host: &str,
        port: u16,
    ) -> Result<TlsStream<TcpStream>, DialError> {
        let config = self.client_config()?;
        let connector = TlsConnector::from(config);

        let server_name: ServerName<'static> = ServerName::try_from(sni.to_string())
            .map_err(|_| DialError::TlsConfig(format!("invalid server name: {sni}")))?;

        let tcp = self.connect_tcp(dial_host, port).await?;

        let tls = timeout(DIAL_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| DialError::timeout(format!("tls {sni}:{port}"), DIAL_TIMEOUT.as_millis() as u64))?
            .map_err(|e| DialError::TlsHandshake {
                host: sni.to_string(),
                reason: e.to_string(),
            })?;

        Ok(tls)
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let stream = match self.ip_override {
            Some(ip) => {
                debug!(%ip, port, "dialing egress via override address");
                dial((ip, port).into()).await?
            }
            None => {
                let addr = format!("{host}:{port}");
                let mut addrs = tokio::net::lookup_host(&addr)
                    .await
                    .map_err(|e| DialError::Resolve {
                        host: host.to_string(),
                        reason: e.to_string(),
                    })?;
                let first = addrs.next().ok_or_else(|| DialError::Resolve {
                    host: host.to_string(),
                    reason: "no addresses returned".to_string(),
                })?;
                dial(first).await?
            }
        };

        stream
            .set_nodelay(true)
            .map_err(|e| DialError::connect(format!("{host}:{port}"), e))?;
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(20));
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!(error = %e, "failed to enable tcp keepalive");
        }
        Ok(stream)
    }

    /// Build the client config, preferring ECH and falling back to plain
    /// TLS 1.3 only when explicitly permitted.
    fn client_config(&self) -> Result<Arc<ClientConfig>, DialError> {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(aws_lc_rs::default_provider());

        match self.resolver.cached() {
            Some(list) => {
                let list = EchConfigListBytes::from(list.as_ref().clone());
                let ech = EchConfig::new(list, ALL_SUPPORTED_SUITES)
                    .map_err(|e| DialError::TlsConfig(format!("ECH config list rejected: {e}")))?;
                let config = ClientConfig::builder_with_provider(provider)
                    .with_ech(EchMode::from(ech))
                    .map_err(|e| DialError::TlsConfig(e.to_string()))?
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                Ok(Arc::new(config))
            }
            None if self.allow_no_ech => {
                warn!("ECH config unavailable, dialing with plain TLS (downgrade permitted by config)");
                let config = ClientConfig::builder_with_provider(provider)
                    .with_protocol_versions(&[&rustls::version::TLS13])
                    .map_err(|e| DialError::TlsConfig(e.to_string()))?
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                Ok(Arc::new(config))
            }
            None => Err(DialError::EchUnavailable(
                crate::error::DnsError::EchNotLoaded,
            )),
        }
    }
}

async fn dial(addr: std::net::SocketAddr) -> Result<TcpStream, DialError> {
    timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| DialError::timeout(addr.to_string(), DIAL_TIMEOUT.as_millis() as u64))?
        .map_err(|e| DialError::connect(addr.to_string(), e))
}
