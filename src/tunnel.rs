//! WebSocket tunnel dialer
//!
//! Dials `wss://host:port<path>` over the ECH TLS channel, offering the
//! shared token as the WebSocket subprotocol. A failure whose message
//! names ECH triggers one config refresh and a single retry after a
//! short pause; everything else fails immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::addr::Endpoint;
use crate::dns::EchResolver;
use crate::error::DialError;
use crate::tls::EchTlsClient;

/// The ingress side of a tunnel connection
pub type WsStream = WebSocketStream<TlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 2;
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Dialer for the egress WebSocket endpoint
pub struct TunnelDialer {
    server: Endpoint,
    path: String,
    token: Option<String>,
    tls: EchTlsClient,
    resolver: Arc<EchResolver>,
}

impl std::fmt::Debug for TunnelDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelDialer")
            .field("server", &self.server)
            .field("path", &self.path)
            .field("token", &self.token.as_deref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

impl TunnelDialer {
    pub fn new(
        server: Endpoint,
        path: String,
        token: Option<String>,
        tls: EchTlsClient,
        resolver: Arc<EchResolver>,
    ) -> Self {
        Self {
            server,
            path,
            token,
            tls,
            resolver,
        }
    }

    /// The egress endpoint this dialer targets
    #[must_use]
    pub fn server(&self) -> &Endpoint {
        &self.server
    }

    /// Shared access to the TLS client, for the tunneled DoH path
    #[must_use]
    pub fn tls(&self) -> &EchTlsClient {
        &self.tls
    }

    /// Dial the egress, retrying once after an ECH-related failure
    pub async fn dial(&self) -> Result<WsStream, DialError> {
        let mut last: Option<DialError> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            debug!(attempt, max = MAX_ATTEMPTS, server = %self.server, "dialing tunnel");
            match self.dial_once().await {
                Ok(ws) => {
                    info!(server = %self.server, "tunnel established");
                    return Ok(ws);
                }
                Err(e) if e.names_ech() && attempt < MAX_ATTEMPTS => {
                    warn!(error = %e, "dial failed naming ECH, refreshing config and retrying");
                    self.resolver.refresh().await;
                    tokio::time::sleep(RETRY_PAUSE).await;
                    last = Some(e);
                }
                // a first failure that does not name ECH is final as is
                Err(e) if last.is_none() => return Err(e),
                Err(e) => {
                    last = Some(e);
                    break;
                }
            }
        }

        Err(DialError::RetriesExhausted {
            attempts: MAX_ATTEMPTS,
            last: last.map_or_else(|| "unknown".to_string(), |e| e.to_string()),
        })
    }

    async fn dial_once(&self) -> Result<WsStream, DialError> {
        let tls = self
            .tls
            .connect(&self.server.host, &self.server.host, self.server.port)
            .await?;

        let url = format!("wss://{}{}", self.server, self.path);
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| DialError::WsHandshake(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = token
                .parse()
                .map_err(|_| DialError::WsHandshake("token is not a valid header value".into()))?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }

        let (ws, response) = timeout(HANDSHAKE_TIMEOUT, client_async(request, tls))
            .await
            .map_err(|_| {
                DialError::timeout(url.clone(), HANDSHAKE_TIMEOUT.as_millis() as u64)
            })?
            .map_err(|e| DialError::WsHandshake(e.to_string()))?;

        debug!(status = %response.status(), "websocket upgrade accepted");
        Ok(ws)
    }
}
