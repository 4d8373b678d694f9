//! Per-WebSocket relay session on the egress
//!
//! Exactly one upstream TCP connection per WebSocket. The state machine
//! is INIT -> CONNECTING -> CONNECTED -> CLOSED; only a `CONNECT` frame
//! is legal in INIT, and CLOSED is terminal.
//!
//! The dial cascade walks the target followed by the fallback list, but
//! only past failures classified as transient; a target that is an IP
//! literal is attempted alone. `CONNECTED` is sent only after the first
//! payload (when present) has been written to the upstream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::{EgressStats, SessionPermit};
use crate::addr::{Endpoint, FallbackAddr};
use crate::config::EgressConfig;
use crate::error::SessionError;
use crate::session::frame::{error_frame, ControlFrame};
use crate::session::{run_watchdog, ActivityClock, CloseLatch, WriteQueue, WsWriter};

const FIRST_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(5);
const PUMP_BUF_SIZE: usize = 16 * 1024;

/// Drive one session to completion. Consumes the WebSocket; the permit
/// releases its pool slot when the session ends.
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    config: Arc<EgressConfig>,
    fallbacks: Vec<FallbackAddr>,
    permit: SessionPermit,
    stats: Arc<EgressStats>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _permit = permit;
    let (sink, mut stream) = ws.split();
    let latch = CloseLatch::new();
    let writer = WsWriter::spawn(sink, Arc::clone(&latch));

    // INIT: the first meaningful frame must be CONNECT
    let (target, payload) = match read_connect(&mut stream, &writer, config.read_timeout).await {
        Ok(Some(parts)) => parts,
        Ok(None) => return,
        Err(e) => {
            stats.session_errors.fetch_add(1, Ordering::Relaxed);
            reject(&writer, &e.to_string()).await;
            return;
        }
    };

    // CONNECTING: validate, then walk the attempt list
    let endpoint = match target.parse::<Endpoint>() {
        Ok(ep) => ep,
        Err(e) => {
            stats.session_errors.fetch_add(1, Ordering::Relaxed);
            let err = SessionError::InvalidTarget(format!("{target}: {e}"));
            reject(&writer, &err.to_string()).await;
            return;
        }
    };
    if let Some(allowed) = &config.allowed_hosts {
        if !allowed.contains(&endpoint.host) {
            stats.session_errors.fetch_add(1, Ordering::Relaxed);
            let err = SessionError::HostNotAllowed(endpoint.host.clone());
            reject(&writer, &err.to_string()).await;
            return;
        }
    }

    let upstream = match dial_cascade(&endpoint, &fallbacks, config.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            stats.session_errors.fetch_add(1, Ordering::Relaxed);
            reject(&writer, &e.to_string()).await;
            return;
        }
    };

    let (upstream_read, mut upstream_write) = upstream.into_split();

    // The first payload precedes CONNECTED; an empty payload writes nothing
    if !payload.is_empty() {
        match timeout(FIRST_PAYLOAD_TIMEOUT, upstream_write.write_all(payload.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                stats.session_errors.fetch_add(1, Ordering::Relaxed);
                reject(&writer, &format!("first payload write failed: {e}")).await;
                return;
            }
            Err(_) => {
                stats.session_errors.fetch_add(1, Ordering::Relaxed);
                reject(&writer, "first payload write timed out").await;
                return;
            }
        }
    }

    connected_phase(
        stream,
        writer,
        latch,
        upstream_read,
        upstream_write,
        config,
        stats,
        endpoint,
    )
    .await;
}

/// CONNECTED: run both pumps until either side finishes
#[allow(clippy::too_many_arguments)]
async fn connected_phase<St>(
    mut stream: St,
    writer: WsWriter,
    latch: Arc<CloseLatch>,
    mut upstream_read: tokio::net::tcp::OwnedReadHalf,
    upstream_write: tokio::net::tcp::OwnedWriteHalf,
    config: Arc<EgressConfig>,
    stats: Arc<EgressStats>,
    endpoint: Endpoint,
) where
    St: futures_util::Stream<
            Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + Unpin,
{
    if writer.send_frame(ControlFrame::Connected).await.is_err() {
        return;
    }
    info!(target = %endpoint, "session connected");

    let clock = ActivityClock::new();
    let to_upstream = Arc::new(AtomicU64::new(0));
    let to_client = Arc::new(AtomicU64::new(0));
    let queue = WriteQueue::spawn(
        upstream_write,
        Arc::clone(&clock),
        Arc::clone(&latch),
        Arc::clone(&to_upstream),
    );

    // Upstream -> WebSocket pump
    let pump = {
        let writer = writer.clone();
        let latch = Arc::clone(&latch);
        let clock = Arc::clone(&clock);
        let to_client = Arc::clone(&to_client);
        tokio::spawn(async move {
            let mut buf = vec![0u8; PUMP_BUF_SIZE];
            loop {
                writer.wait_drained(&latch).await;
                if latch.is_closed() {
                    break;
                }
                let n = tokio::select! {
                    result = upstream_read.read(&mut buf) => match result {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            if !crate::io::is_normal_close(&e) {
                                debug!(error = %e, "upstream read failed");
                            }
                            break;
                        }
                    },
                    () = latch.wait() => break,
                };
                clock.touch();
                to_client.fetch_add(n as u64, Ordering::Relaxed);
                let sent = tokio::select! {
                    result = writer.send(Message::Binary(buf[..n].to_vec())) => result.is_ok(),
                    () = latch.wait() => false,
                };
                if !sent {
                    break;
                }
            }
            // upstream finished; the first closer sends the CLOSE frame
            if latch.close() {
                let _ = writer.send_frame(ControlFrame::Close).await;
            }
        })
    };

    let watchdog = {
        let writer = writer.clone();
        let clock = Arc::clone(&clock);
        let latch = Arc::clone(&latch);
        tokio::spawn(async move {
            if run_watchdog(clock, latch, config.read_timeout).await {
                let _ = writer.send_frame(ControlFrame::Close).await;
            }
        })
    };

    // WebSocket -> upstream dispatch
    loop {
        let message = tokio::select! {
            () = latch.wait() => break,
            msg = stream.next() => msg,
        };
        match message {
            None => break,
            Some(Err(e)) => {
                debug!(error = %e, "websocket read ended");
                break;
            }
            Some(Ok(Message::Binary(data))) => {
                if queue.push(Bytes::from(data)).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Text(text))) => match ControlFrame::parse(&text) {
                Ok(ControlFrame::Data(data)) => {
                    if queue.push(Bytes::from(data.into_bytes())).await.is_err() {
                        break;
                    }
                }
                Ok(ControlFrame::Close) => break,
                Ok(ControlFrame::Ping) => {
                    let _ = writer.send_frame(ControlFrame::Pong).await;
                }
                Ok(ControlFrame::Pong) => {}
                Ok(ControlFrame::Error(body)) => {
                    warn!(msg = %body.msg, "peer reported error");
                }
                Ok(other) => {
                    let _ = writer
                        .send_frame(error_frame(format!(
                            "unexpected {} frame in state CONNECTED",
                            other.kind()
                        )))
                        .await;
                }
                Err(e) => {
                    let _ = writer.send_frame(error_frame(e.to_string())).await;
                }
            },
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(_)) => {} // transport-level ping/pong handled by tungstenite
        }
    }

    // CLOSED: idempotent teardown; the first closer sends the CLOSE frame
    if latch.close() {
        let _ = writer.send_frame(ControlFrame::Close).await;
    }
    watchdog.abort();
    let _ = pump.await;

    info!(
        target = %endpoint,
        sent = to_upstream.load(Ordering::Relaxed),
        received = to_client.load(Ordering::Relaxed),
        "session closed"
    );
    stats
        .bytes_to_upstream
        .fetch_add(to_upstream.load(Ordering::Relaxed), Ordering::Relaxed);
    stats
        .bytes_to_client
        .fetch_add(to_client.load(Ordering::Relaxed), Ordering::Relaxed);
}

/// Wait for the CONNECT frame, answering protocol violations with ERROR.
/// `Ok(None)` means the peer went away before asking for anything.
async fn read_connect<St>(
    stream: &mut St,
    writer: &WsWriter,
    read_timeout: Duration,
) -> Result<Option<(String, String)>, SessionError>
where
    St: futures_util::Stream<
            Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + Unpin,
{
    loop {
        let message = match timeout(read_timeout, stream.next()).await {
            Ok(msg) => msg,
            Err(_) => return Err(SessionError::ReadTimeout),
        };
        match message {
            None => return Ok(None),
            Some(Err(e)) => return Err(SessionError::Transport(e.to_string())),
            Some(Ok(Message::Text(text))) => match ControlFrame::parse(&text) {
                Ok(ControlFrame::Connect { target, payload }) => {
                    return Ok(Some((target, payload)))
                }
                Ok(ControlFrame::Close) => return Ok(None),
                Ok(ControlFrame::Ping) => {
                    let _ = writer.send_frame(ControlFrame::Pong).await;
                }
                Ok(other) => {
                    return Err(SessionError::UnexpectedFrame {
                        state: "INIT",
                        frame: other.kind().to_string(),
                    })
                }
                Err(e) => return Err(e),
            },
            Some(Ok(Message::Binary(_))) => {
                return Err(SessionError::UnexpectedFrame {
                    state: "INIT",
                    frame: "BINARY".to_string(),
                })
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => {} // transport ping/pong
        }
    }
}

/// Send ERROR and CLOSE, best effort
async fn reject(writer: &WsWriter, message: &str) {
    warn!(error = message, "session rejected");
    let _ = writer.send_frame(error_frame(message)).await;
    let _ = writer.send_frame(ControlFrame::Close).await;
}

/// Build the ordered attempt list for a target
fn build_attempts(endpoint: &Endpoint, fallbacks: &[FallbackAddr]) -> Vec<Endpoint> {
    if endpoint.is_ip_literal() {
        return vec![endpoint.clone()];
    }
    let mut attempts = Vec::with_capacity(1 + fallbacks.len());
    attempts.push(endpoint.clone());
    attempts.extend(fallbacks.iter().map(|f| f.resolve(endpoint.port)));
    attempts
}

/// Walk the attempt list, advancing only past transient failures
async fn dial_cascade(
    endpoint: &Endpoint,
    fallbacks: &[FallbackAddr],
    connect_timeout: Duration,
) -> Result<TcpStream, SessionError> {
    let attempts = build_attempts(endpoint, fallbacks);
    let total = attempts.len();
    let mut last_error = String::new();

    for (index, attempt) in attempts.iter().enumerate() {
        debug!(attempt = index + 1, total, target = %attempt, "dialing upstream");
        match dial_one(attempt, connect_timeout).await {
            Ok(stream) => {
                if index > 0 {
                    info!(target = %attempt, "connected via fallback");
                }
                return Ok(stream);
            }
            Err(e) => {
                let transient = is_transient_upstream_error(&e);
                debug!(target = %attempt, error = %e, transient, "upstream dial failed");
                if !transient {
                    return Err(SessionError::UpstreamDial(e));
                }
                last_error = e;
            }
        }
    }

    Err(SessionError::UpstreamDial(format!(
        "all {total} attempts failed, last: {last_error}"
    )))
}

async fn dial_one(endpoint: &Endpoint, connect_timeout: Duration) -> Result<TcpStream, String> {
    let target = (endpoint.host.as_str(), endpoint.port);
    let stream = match timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(format!("connect to {endpoint} failed: {e}")),
        Err(_) => {
            // phrased so the transient classifier lets the cascade continue
            return Err(format!(
                "cannot connect to {endpoint}: timed out after {}ms",
                connect_timeout.as_millis()
            ))
        }
    };
    let _ = stream.set_nodelay(true);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(20));
    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);
    Ok(stream)
}

/// Classifier for failures worth cascading past. The patterns mirror
/// the phrasing of intermediary-produced connect errors; everything
/// else fails the session immediately.
fn is_transient_upstream_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("proxy request") || lower.contains("cannot connect") || lower.contains("cloudflare")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback(host: &str, port: Option<u16>) -> FallbackAddr {
        FallbackAddr {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn ip_literal_target_gets_no_fallbacks() {
        let target: Endpoint = "1.2.3.4:443".parse().unwrap();
        let attempts = build_attempts(&target, &[fallback("5.6.7.8", Some(21415))]);
        assert_eq!(attempts, vec![target]);
    }

    #[test]
    fn named_target_appends_fallbacks_with_port_inheritance() {
        let target: Endpoint = "cloudflare.com:443".parse().unwrap();
        let attempts = build_attempts(
            &target,
            &[
                fallback("1.2.3.4", Some(21415)),
                fallback("proxy.example.net", None),
            ],
        );
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].to_string(), "cloudflare.com:443");
        assert_eq!(attempts[1].to_string(), "1.2.3.4:21415");
        assert_eq!(attempts[2].to_string(), "proxy.example.net:443");
    }

    #[test]
    fn transient_classifier_patterns() {
        assert!(is_transient_upstream_error("proxy request failed"));
        assert!(is_transient_upstream_error(
            "cannot connect to cloudflare.com:443: timed out after 5000ms"
        ));
        assert!(is_transient_upstream_error("Cloudflare error 1016"));
        assert!(!is_transient_upstream_error("connection refused"));
        assert!(!is_transient_upstream_error("host not allowed"));
    }

    #[tokio::test]
    async fn cascade_stops_on_non_transient_failure() {
        // port 1 on loopback refuses immediately: a non-transient error
        let target: Endpoint = "127.0.0.1:1".parse().unwrap();
        let err = dial_cascade(&target, &[], Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UpstreamDial(_)));
    }
}
