//! End-to-end exercises of the egress session engine over an in-memory
//! transport: a client-role WebSocket on one end of a duplex pipe, the
//! session engine on the other, and a real loopback TCP upstream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use ech_tunnel::config::EgressConfig;
use ech_tunnel::egress::{run_session, EgressStats, SessionPool};

type ClientWs = WebSocketStream<DuplexStream>;

const WAIT: Duration = Duration::from_secs(5);

/// Wire a client-role WebSocket to a running session engine
async fn start_session(config: EgressConfig, pool: &SessionPool) -> ClientWs {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;

    let permit = pool.try_acquire().expect("pool slot");
    let stats = Arc::new(EgressStats::default());
    tokio::spawn(run_session(
        server,
        Arc::new(config),
        Vec::new(),
        permit,
        stats,
    ));
    client
}

/// Accept one connection and echo everything read back to the peer
async fn echo_upstream() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    addr
}

async fn next_text(ws: &mut ClientWs) -> String {
    loop {
        match timeout(WAIT, ws.next()).await.expect("frame within timeout") {
            Some(Ok(Message::Text(text))) => return text,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Collect binary payload bytes until `count` have arrived
async fn read_binary(ws: &mut ClientWs, count: usize) -> Vec<u8> {
    let mut collected = Vec::with_capacity(count);
    while collected.len() < count {
        match timeout(WAIT, ws.next()).await.expect("frame within timeout") {
            Some(Ok(Message::Binary(data))) => collected.extend_from_slice(&data),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected binary frame, got {other:?}"),
        }
    }
    collected
}

#[tokio::test]
async fn connect_relay_and_close() {
    let upstream = echo_upstream().await;
    let pool = SessionPool::new(4);
    let mut ws = start_session(EgressConfig::default(), &pool).await;

    // CONNECT with a first payload; the payload must come back from the
    // echo upstream, which proves it was written before CONNECTED
    ws.send(Message::Text(format!("CONNECT:{upstream}|hi")))
        .await
        .unwrap();
    assert_eq!(next_text(&mut ws).await, "CONNECTED");

    ws.send(Message::Binary(b"ping".to_vec())).await.unwrap();
    let echoed = read_binary(&mut ws, 6).await;
    assert_eq!(echoed, b"hiping");

    // Legacy text DATA frames relay too
    ws.send(Message::Text("DATA:more".to_string())).await.unwrap();
    let echoed = read_binary(&mut ws, 4).await;
    assert_eq!(echoed, b"more");

    // CLOSE tears the session down and the pool slot frees up
    ws.send(Message::Text("CLOSE".to_string())).await.unwrap();
    timeout(WAIT, async {
        while pool.active() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session released its pool slot");
}

#[tokio::test]
async fn application_ping_is_answered() {
    let upstream = echo_upstream().await;
    let pool = SessionPool::new(1);
    let mut ws = start_session(EgressConfig::default(), &pool).await;

    ws.send(Message::Text(format!("CONNECT:{upstream}|")))
        .await
        .unwrap();
    assert_eq!(next_text(&mut ws).await, "CONNECTED");

    ws.send(Message::Text("PING".to_string())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "PONG");
}

#[tokio::test]
async fn first_frame_must_be_connect() {
    let pool = SessionPool::new(1);
    let mut ws = start_session(EgressConfig::default(), &pool).await;

    ws.send(Message::Binary(b"data before connect".to_vec()))
        .await
        .unwrap();

    let reply = next_text(&mut ws).await;
    assert!(reply.starts_with("ERROR:"), "got: {reply}");
    assert_eq!(next_text(&mut ws).await, "CLOSE");
}

#[tokio::test]
async fn invalid_port_is_rejected() {
    let pool = SessionPool::new(1);
    let mut ws = start_session(EgressConfig::default(), &pool).await;

    ws.send(Message::Text("CONNECT:example.com:65536|".to_string()))
        .await
        .unwrap();

    let reply = next_text(&mut ws).await;
    assert!(reply.starts_with("ERROR:"), "got: {reply}");
    assert!(reply.contains("invalid connect target"), "got: {reply}");
}

#[tokio::test]
async fn allowlist_rejects_other_hosts() {
    let upstream = echo_upstream().await;
    let config = EgressConfig {
        allowed_hosts: Some(
            ["allowed.example".to_string()].into_iter().collect(),
        ),
        ..Default::default()
    };
    let pool = SessionPool::new(1);
    let mut ws = start_session(config, &pool).await;

    ws.send(Message::Text(format!("CONNECT:{upstream}|")))
        .await
        .unwrap();

    let reply = next_text(&mut ws).await;
    assert!(reply.contains("not allowed"), "got: {reply}");
}

#[tokio::test]
async fn upstream_eof_closes_session() {
    // Upstream accepts and immediately closes after one read
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let _ = stream.read(&mut buf).await;
        // drop closes the socket
    });

    let pool = SessionPool::new(1);
    let mut ws = start_session(EgressConfig::default(), &pool).await;

    ws.send(Message::Text(format!("CONNECT:{addr}|")))
        .await
        .unwrap();
    assert_eq!(next_text(&mut ws).await, "CONNECTED");

    ws.send(Message::Binary(b"x".to_vec())).await.unwrap();
    // The engine announces the upstream's exit with CLOSE
    assert_eq!(next_text(&mut ws).await, "CLOSE");
}
