//! HTTP surface and WebSocket admission for the egress
//!
//! Every connection is served by hyper's HTTP/1 stack with upgrades
//! enabled. Non-upgrade requests see a health endpoint and a decoy
//! page; upgrade requests pass the token and capacity gates before the
//! 101 goes out, and the spawned upgrade task hands the raw stream to
//! the session engine.

use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use super::{EgressStats, SessionPool};
use crate::addr::{path_fallback_override, FallbackAddr};
use crate::config::EgressConfig;

type BoxedBody = BoxBody<Bytes, hyper::Error>;

struct ServerContext {
    config: Arc<EgressConfig>,
    pool: SessionPool,
    stats: Arc<EgressStats>,
}

/// The egress HTTP/WebSocket server
pub struct EgressServer {
    ctx: Arc<ServerContext>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl EgressServer {
    #[must_use]
    pub fn new(config: EgressConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = SessionPool::new(config.max_sessions);
        Self {
            ctx: Arc::new(ServerContext {
                config: Arc::new(config),
                pool,
                stats: Arc::new(EgressStats::default()),
            }),
            shutdown_tx,
            shutdown_rx,
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<EgressStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Accept connections until shutdown
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.ctx.config.listen_addr).await?;
        info!(
            addr = %self.ctx.config.listen_addr,
            max_sessions = self.ctx.config.max_sessions,
            auth = self.ctx.config.token.is_some(),
            "egress server started"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "connection accepted");
                            let _ = stream.set_nodelay(true);
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    handle_request(req, Arc::clone(&ctx))
                                });
                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .with_upgrades()
                                    .await
                                {
                                    debug!(peer = %peer, error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("egress server shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn handle_request<B>(
    req: Request<B>,
    ctx: Arc<ServerContext>,
) -> Result<Response<BoxedBody>, Infallible> {
    if is_websocket_upgrade(&req) {
        return Ok(handle_upgrade(req, ctx));
    }

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/ping") => {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            let body = serde_json::json!({ "status": "ok", "ts": ts }).to_string();
            simple_response(StatusCode::OK, full(body), &ctx.config.allow_origin)
                .map(|mut r| {
                    r.headers_mut().insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                    r
                })
        }
        (&Method::GET, "/" | "/index.html") => {
            simple_response(StatusCode::OK, full("Hello World!"), &ctx.config.allow_origin)
        }
        _ => simple_response(
            StatusCode::NOT_FOUND,
            full("Not Found"),
            &ctx.config.allow_origin,
        ),
    };

    Ok(response.unwrap_or_else(|| plain_status(StatusCode::INTERNAL_SERVER_ERROR)))
}

/// Gate and accept a WebSocket upgrade
fn handle_upgrade<B>(mut req: Request<B>, ctx: Arc<ServerContext>) -> Response<BoxedBody> {
    let config = Arc::clone(&ctx.config);

    // Token gate: subprotocol header, with a query-parameter alternative
    let offered = offered_token(&req);
    if let Some(expected) = &config.token {
        if offered.as_deref() != Some(expected.as_str()) {
            ctx.stats.rejected_auth.fetch_add(1, Ordering::Relaxed);
            warn!("upgrade rejected: token mismatch");
            return with_origin(plain_status(StatusCode::UNAUTHORIZED), &config.allow_origin);
        }
    }

    // Capacity gate
    let Some(permit) = ctx.pool.try_acquire() else {
        ctx.stats.rejected_capacity.fetch_add(1, Ordering::Relaxed);
        warn!(
            active = ctx.pool.active(),
            capacity = ctx.pool.capacity(),
            "upgrade rejected: session pool full"
        );
        let resp = Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(full("Too many concurrent sessions"))
            .unwrap_or_else(|_| plain_status(StatusCode::SERVICE_UNAVAILABLE));
        return with_origin(resp, &config.allow_origin);
    };

    // No key means the accept handshake cannot be completed
    let Some(key) = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|k| derive_accept_key(k.as_bytes()))
    else {
        return with_origin(
            plain_status(StatusCode::INTERNAL_SERVER_ERROR),
            &config.allow_origin,
        );
    };

    // Path-derived fallback list overrides the configured one
    let fallbacks: Vec<FallbackAddr> = path_fallback_override(req.uri().path())
        .unwrap_or_else(|| config.fallback_ips.clone());

    let subprotocol = req
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .cloned();

    let on_upgrade = hyper::upgrade::on(&mut req);
    let stats = Arc::clone(&ctx.stats);
    let session_config = Arc::clone(&config);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                stats.sessions_accepted.fetch_add(1, Ordering::Relaxed);
                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                super::session::run_session(ws, session_config, fallbacks, permit, stats).await;
            }
            Err(e) => {
                // The 101 already went out; nothing to answer with
                warn!(error = %e, "upgrade failed after accept");
                drop(permit);
            }
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, key)
        .header(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            origin_value(&config.allow_origin),
        );
    if let Some(proto) = subprotocol {
        builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, proto);
    }
    builder
        .body(empty())
        .unwrap_or_else(|_| plain_status(StatusCode::INTERNAL_SERVER_ERROR))
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let connection_has_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    let upgrade_is_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    connection_has_upgrade && upgrade_is_websocket
}

/// Token from `Sec-WebSocket-Protocol` (first entry) or `?token=`
fn offered_token<B>(req: &Request<B>) -> Option<String> {
    if let Some(proto) = req
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = proto.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    req.uri().query().and_then(|q| {
        q.split('&').find_map(|pair| {
            pair.strip_prefix("token=").map(str::to_string)
        })
    })
}

fn empty() -> BoxedBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full(chunk: impl Into<Bytes>) -> BoxedBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

fn origin_value(allow_origin: &str) -> HeaderValue {
    HeaderValue::from_str(allow_origin).unwrap_or(HeaderValue::from_static("*"))
}

fn simple_response(
    status: StatusCode,
    body: BoxedBody,
    allow_origin: &str,
) -> Option<Response<BoxedBody>> {
    Response::builder()
        .status(status)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin_value(allow_origin))
        .body(body)
        .ok()
}

fn plain_status(status: StatusCode) -> Response<BoxedBody> {
    let mut resp = Response::new(empty());
    *resp.status_mut() = status;
    resp
}

fn with_origin(mut resp: Response<BoxedBody>, allow_origin: &str) -> Response<BoxedBody> {
    resp.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        origin_value(allow_origin),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(config: EgressConfig) -> Arc<ServerContext> {
        let pool = SessionPool::new(config.max_sessions);
        Arc::new(ServerContext {
            config: Arc::new(config),
            pool,
            stats: Arc::new(EgressStats::default()),
        })
    }

    fn upgrade_request(token: Option<&str>, path: &str) -> Request<()> {
        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==");
        if let Some(token) = token {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, token);
        }
        builder.body(()).unwrap()
    }

    async fn body_text(resp: Response<BoxedBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn detects_upgrade_requests() {
        let req = Request::builder()
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&req));

        let req = Request::builder()
            .header(header::CONNECTION, "keep-alive")
            .body(())
            .unwrap();
        assert!(!is_websocket_upgrade(&req));
    }

    #[test]
    fn token_from_subprotocol_or_query() {
        let req = Request::builder()
            .uri("/ws")
            .header(header::SEC_WEBSOCKET_PROTOCOL, "secret, other")
            .body(())
            .unwrap();
        assert_eq!(offered_token(&req).as_deref(), Some("secret"));

        let req = Request::builder().uri("/ws?x=1&token=abc").body(()).unwrap();
        assert_eq!(offered_token(&req).as_deref(), Some("abc"));

        let req = Request::builder().uri("/ws").body(()).unwrap();
        assert_eq!(offered_token(&req), None);
    }

    #[tokio::test]
    async fn routes_ping_and_hello() {
        let ctx = context(EgressConfig::default());

        let req = Request::builder()
            .method(Method::GET)
            .uri("/ping")
            .body(())
            .unwrap();
        let resp = handle_request(req, Arc::clone(&ctx)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("\"status\":\"ok\""));
        assert!(text.contains("\"ts\":"));

        let req = Request::builder().method(Method::GET).uri("/").body(()).unwrap();
        let resp = handle_request(req, Arc::clone(&ctx)).await.unwrap();
        assert_eq!(body_text(resp).await, "Hello World!");

        let req = Request::builder()
            .method(Method::GET)
            .uri("/missing")
            .body(())
            .unwrap();
        let resp = handle_request(req, ctx).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upgrade_token_mismatch_is_401() {
        let config = EgressConfig {
            token: Some("T".to_string()),
            ..Default::default()
        };
        let ctx = context(config);

        let resp = handle_request(upgrade_request(Some("X"), "/"), Arc::clone(&ctx))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ctx.stats.rejected_auth.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn upgrade_over_capacity_is_503() {
        let config = EgressConfig {
            max_sessions: 1,
            ..Default::default()
        };
        let ctx = context(config);
        let _held = ctx.pool.try_acquire().unwrap();

        let resp = handle_request(upgrade_request(None, "/"), Arc::clone(&ctx))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(resp).await, "Too many concurrent sessions");
        assert_eq!(ctx.stats.rejected_capacity.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn upgrade_without_key_is_500() {
        let ctx = context(EgressConfig::default());

        let req = Request::builder()
            .method(Method::GET)
            .uri("/")
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(())
            .unwrap();
        let resp = handle_request(req, ctx).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn accepted_upgrade_echoes_subprotocol() {
        let config = EgressConfig {
            token: Some("T".to_string()),
            ..Default::default()
        };
        let ctx = context(config);

        let resp = handle_request(upgrade_request(Some("T"), "/"), Arc::clone(&ctx))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            resp.headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok()),
            Some("T")
        );
        assert!(resp.headers().contains_key(header::SEC_WEBSOCKET_ACCEPT));
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("*")
        );
    }
}
