//! Direct and tunneled relay paths for accepted ingress connections
//!
//! After the protocol handlers have produced a target (and possibly a
//! precomputed first payload), the routing policy picks one of two
//! paths:
//!
//! - **direct**: a plain TCP connection; the first payload is written
//!   and bytes are copied both ways until either side closes.
//! - **tunneled**: a WebSocket to the egress; `CONNECT` goes out first,
//!   `CONNECTED` must come back, then the success response is released
//!   to the client and two pumps relay bytes. A keepalive ping renews
//!   the connection deadline every ten seconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::IngressContext;
use crate::addr::Endpoint;
use crate::error::ProxyError;
use crate::rules::Route;
use crate::session::frame::ControlFrame;
use crate::session::{run_watchdog, ActivityClock, CloseLatch, WsWriter};

/// How the client reached us; decides replies and default ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Socks5,
    HttpConnect,
    HttpProxy,
}

impl ProxyMode {
    /// Default target port when the client omitted one
    fn default_port(self) -> u16 {
        match self {
            Self::HttpConnect => 443,
            Self::Socks5 | Self::HttpProxy => 80,
        }
    }

    async fn send_success(self, stream: &mut TcpStream) -> std::io::Result<()> {
        match self {
            Self::Socks5 => {
                stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
            }
            Self::HttpConnect => {
                stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await
            }
            // The upstream's own response streams back
            Self::HttpProxy => Ok(()),
        }
    }

    async fn send_error(self, stream: &mut TcpStream) {
        let _ = match self {
            Self::Socks5 => {
                // host unreachable
                stream
                    .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
            }
            Self::HttpConnect | Self::HttpProxy => {
                stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await
            }
        };
    }
}

/// Window for bundling early client bytes into the CONNECT frame
const EARLY_READ_WINDOW: Duration = Duration::from_millis(100);
const EARLY_READ_BUF: usize = 8192;

/// Deadline renewed by the keepalive ticker
const TUNNEL_DEADLINE: Duration = Duration::from_secs(300);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Wait this long for the egress to answer CONNECT
const CONNECT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

const DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const PUMP_BUF_SIZE: usize = 16 * 1024;

/// Relay one accepted connection to `target` over the chosen path
pub(super) async fn handle_tunnel(
    stream: TcpStream,
    target: String,
    mode: ProxyMode,
    first_payload: Option<Vec<u8>>,
    ctx: Arc<IngressContext>,
) -> Result<(), ProxyError> {
    // Host for the routing decision; a bare host means the default port
    let (host, target) = match target.parse::<Endpoint>() {
        Ok(ep) => (ep.host.clone(), ep.to_string()),
        Err(_) => {
            let ep = Endpoint::new(target.trim_matches(['[', ']']), mode.default_port());
            (ep.host.clone(), ep.to_string())
        }
    };

    match ctx.policy.decide(&host).await {
        Route::Direct => {
            debug!(target = %target, "routing direct");
            direct_relay(stream, &target, mode, first_payload, &ctx).await
        }
        Route::Tunnel => {
            debug!(target = %target, "routing through tunnel");
            tunneled_relay(stream, target, mode, first_payload, ctx).await
        }
    }
}

/// Bypass path: plain TCP to the target
async fn direct_relay(
    mut stream: TcpStream,
    target: &str,
    mode: ProxyMode,
    first_payload: Option<Vec<u8>>,
    ctx: &IngressContext,
) -> Result<(), ProxyError> {
    let upstream = match timeout(DIRECT_DIAL_TIMEOUT, TcpStream::connect(target)).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            mode.send_error(&mut stream).await;
            return Err(ProxyError::Direct {
                target: target.to_string(),
                reason: e.to_string(),
            });
        }
        Err(_) => {
            mode.send_error(&mut stream).await;
            return Err(ProxyError::Direct {
                target: target.to_string(),
                reason: "connect timed out".to_string(),
            });
        }
    };
    let _ = upstream.set_nodelay(true);

    mode.send_success(&mut stream).await?;

    let mut upstream = upstream;
    if let Some(payload) = first_payload {
        upstream.write_all(&payload).await?;
    }

    // Lifecycle close tears the relay down by dropping both sockets
    let outcome = tokio::select! {
        outcome = crate::io::copy_bidirectional(stream, upstream) => outcome?,
        () = ctx.lifecycle.wait() => {
            debug!(target = %target, "direct relay stopped by shutdown");
            return Ok(());
        }
    };

    ctx.stats.bytes_sent.fetch_add(outcome.sent, Ordering::Relaxed);
    ctx.stats
        .bytes_received
        .fetch_add(outcome.received, Ordering::Relaxed);
    debug!(
        target = %target,
        sent = outcome.sent,
        received = outcome.received,
        "direct relay finished"
    );
    Ok(())
}

/// Tunnel path: frame the connection over a WebSocket to the egress
async fn tunneled_relay(
    mut stream: TcpStream,
    target: String,
    mode: ProxyMode,
    first_payload: Option<Vec<u8>>,
    ctx: Arc<IngressContext>,
) -> Result<(), ProxyError> {
    let ws = match ctx.dialer.dial().await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "tunnel dial failed");
            mode.send_error(&mut stream).await;
            return Err(ProxyError::Tunnel(e.to_string()));
        }
    };

    let (sink, mut ws_stream) = ws.split();
    let latch = CloseLatch::new();
    let writer = WsWriter::spawn(sink, Arc::clone(&latch));

    // SOCKS5 clients often push their first bytes (a TLS hello) right
    // after the reply; grabbing them here saves a round trip.
    let mut payload_bytes = first_payload.unwrap_or_default();
    if payload_bytes.is_empty() && mode == ProxyMode::Socks5 {
        let mut buf = vec![0u8; EARLY_READ_BUF];
        if let Ok(Ok(n)) = timeout(EARLY_READ_WINDOW, stream.read(&mut buf)).await {
            buf.truncate(n);
            payload_bytes = buf;
        }
    }

    // The payload rides in the text frame when it is valid UTF-8; raw
    // binary (a TLS hello, a POST body) follows as the first binary
    // frame instead, which the egress applies before any upstream data
    // can flow back.
    let (payload_text, spill) = match String::from_utf8(payload_bytes) {
        Ok(text) => (text, None),
        Err(err) => (String::new(), Some(err.into_bytes())),
    };

    writer
        .send_frame(ControlFrame::Connect {
            target: target.clone(),
            payload: payload_text,
        })
        .await
        .map_err(|e| ProxyError::Tunnel(e.to_string()))?;

    // One text frame decides the session's fate
    match wait_connected(&mut ws_stream).await {
        Ok(()) => {}
        Err(e) => {
            mode.send_error(&mut stream).await;
            let _ = writer.send_frame(ControlFrame::Close).await;
            return Err(e);
        }
    }

    mode.send_success(&mut stream).await?;
    if let Some(bytes) = spill {
        writer
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| ProxyError::Tunnel(e.to_string()))?;
    }

    info!(target = %target, "tunnel relay established");

    let (mut client_read, mut client_write) = stream.into_split();
    let sent = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));

    // Keepalive: transport ping plus deadline renewal
    let deadline = ActivityClock::new();
    let keepalive = {
        let writer = writer.clone();
        let latch = Arc::clone(&latch);
        let deadline = Arc::clone(&deadline);
        let lifecycle = Arc::clone(&ctx.lifecycle);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if writer.send(Message::Ping(Vec::new())).await.is_err() {
                            latch.close();
                            break;
                        }
                        deadline.touch();
                    }
                    () = latch.wait() => break,
                    () = lifecycle.wait() => {
                        latch.close();
                        break;
                    }
                }
            }
        })
    };
    let deadline_watch = {
        let writer = writer.clone();
        let deadline = Arc::clone(&deadline);
        let latch = Arc::clone(&latch);
        tokio::spawn(async move {
            if run_watchdog(deadline, latch, TUNNEL_DEADLINE).await {
                let _ = writer.send_frame(ControlFrame::Close).await;
            }
        })
    };

    // client -> egress pump
    let pump = {
        let writer = writer.clone();
        let latch = Arc::clone(&latch);
        let sent = Arc::clone(&sent);
        tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_BUF_SIZE];
            loop {
                writer.wait_drained(&latch).await;
                if latch.is_closed() {
                    break;
                }
                let n = tokio::select! {
                    result = client_read.read(&mut buf) => match result {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            if !crate::io::is_normal_close(&e) {
                                debug!(error = %e, "client read failed");
                            }
                            break;
                        }
                    },
                    () = latch.wait() => break,
                };
                sent.fetch_add(n as u64, Ordering::Relaxed);
                let ok = tokio::select! {
                    result = writer.send(Message::Binary(buf[..n].to_vec())) => result.is_ok(),
                    () = latch.wait() => false,
                };
                if !ok {
                    break;
                }
            }
            if latch.close() {
                let _ = writer.send_frame(ControlFrame::Close).await;
            }
        })
    };

    // egress -> client loop
    loop {
        let message = tokio::select! {
            () = latch.wait() => break,
            msg = ws_stream.next() => msg,
        };
        match message {
            None => break,
            Some(Err(e)) => {
                debug!(error = %e, "tunnel read ended");
                break;
            }
            Some(Ok(Message::Binary(data))) => {
                received.fetch_add(data.len() as u64, Ordering::Relaxed);
                if client_write.write_all(&data).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Text(text))) => match ControlFrame::parse(&text) {
                Ok(ControlFrame::Close) => break,
                Ok(ControlFrame::Data(data)) => {
                    received.fetch_add(data.len() as u64, Ordering::Relaxed);
                    if client_write.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Ok(ControlFrame::Ping) => {
                    let _ = writer.send_frame(ControlFrame::Pong).await;
                }
                Ok(ControlFrame::Pong) => {}
                Ok(ControlFrame::Error(body)) => {
                    warn!(msg = %body.msg, "egress reported error");
                }
                Ok(other) => debug!(frame = other.kind(), "ignoring late control frame"),
                Err(e) => debug!(error = %e, "unparseable text frame"),
            },
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(_)) => {} // transport ping/pong
        }
    }

    if latch.close() {
        let _ = writer.send_frame(ControlFrame::Close).await;
    }
    keepalive.abort();
    deadline_watch.abort();
    let _ = pump.await;
    let _ = client_write.shutdown().await;

    let sent = sent.load(Ordering::Relaxed);
    let received = received.load(Ordering::Relaxed);
    ctx.stats.bytes_sent.fetch_add(sent, Ordering::Relaxed);
    ctx.stats.bytes_received.fetch_add(received, Ordering::Relaxed);
    info!(target = %target, sent, received, "tunnel relay finished");
    Ok(())
}

/// Read the egress' answer to CONNECT: exactly `CONNECTED` proceeds
async fn wait_connected<St>(stream: &mut St) -> Result<(), ProxyError>
where
    St: futures_util::Stream<
            Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + Unpin,
{
    loop {
        let message = timeout(CONNECT_REPLY_TIMEOUT, stream.next())
            .await
            .map_err(|_| ProxyError::Tunnel("timed out waiting for CONNECTED".into()))?;
        match message {
            None => return Err(ProxyError::Tunnel("closed before CONNECTED".into())),
            Some(Err(e)) => return Err(ProxyError::Tunnel(e.to_string())),
            Some(Ok(Message::Text(text))) => {
                return match ControlFrame::parse(&text) {
                    Ok(ControlFrame::Connected) => Ok(()),
                    Ok(ControlFrame::Error(body)) => Err(ProxyError::Tunnel(body.msg)),
                    Ok(other) => Err(ProxyError::Tunnel(format!(
                        "unexpected {} frame before CONNECTED",
                        other.kind()
                    ))),
                    Err(e) => Err(ProxyError::Tunnel(e.to_string())),
                };
            }
            Some(Ok(Message::Close(_))) => {
                return Err(ProxyError::Tunnel("closed before CONNECTED".into()))
            }
            // transport ping/pong may precede the answer
            Some(Ok(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_by_mode() {
        assert_eq!(ProxyMode::Socks5.default_port(), 80);
        assert_eq!(ProxyMode::HttpConnect.default_port(), 443);
        assert_eq!(ProxyMode::HttpProxy.default_port(), 80);
    }
}
