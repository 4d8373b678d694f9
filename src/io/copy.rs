//! Counted bidirectional copy between two TCP streams
//!
//! Used by the direct path where no framing is involved. Each direction
//! runs as its own loop; when one side reaches EOF the matching writer
//! is shut down so the peer observes the half-close.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const RELAY_BUF_SIZE: usize = 32 * 1024;

/// Byte counts produced by [`copy_bidirectional`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOutcome {
    /// Bytes moved client -> upstream
    pub sent: u64,
    /// Bytes moved upstream -> client
    pub received: u64,
}

/// Relay bytes in both directions until either side closes.
///
/// Normal-close conditions are swallowed; any other error from either
/// direction is returned after both loops settle.
pub async fn copy_bidirectional(client: TcpStream, upstream: TcpStream) -> io::Result<CopyOutcome> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let to_upstream = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; RELAY_BUF_SIZE];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            upstream_write.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        let _ = upstream_write.shutdown().await;
        Ok::<_, io::Error>(total)
    };

    let to_client = async {
        let mut total = 0u64;
        let mut buf = vec![0u8; RELAY_BUF_SIZE];
        loop {
            let n = upstream_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            client_write.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        let _ = client_write.shutdown().await;
        Ok::<_, io::Error>(total)
    };

    let (sent, received) = tokio::join!(to_upstream, to_client);

    let mut outcome = CopyOutcome::default();
    let mut fault = None;
    match sent {
        Ok(n) => outcome.sent = n,
        Err(e) if is_normal_close(&e) => {}
        Err(e) => fault = Some(e),
    }
    match received {
        Ok(n) => outcome.received = n,
        Err(e) if is_normal_close(&e) => {}
        Err(e) => fault = fault.or(Some(e)),
    }

    match fault {
        Some(e) => Err(e),
        None => Ok(outcome),
    }
}

/// Whether an I/O error is an ordinary teardown rather than a fault
#[must_use]
pub fn is_normal_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    ) || err.to_string().contains("use of closed network connection")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn normal_close_kinds() {
        for kind in [
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
        ] {
            assert!(is_normal_close(&io::Error::new(kind, "x")));
        }
        assert!(!is_normal_close(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "x"
        )));
    }

    #[tokio::test]
    async fn relays_both_directions_with_counts() {
        // echo server standing in for the upstream
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = s.read(&mut buf).await.unwrap();
            s.write_all(&buf[..n]).await.unwrap();
        });

        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let relay_task = tokio::spawn(async move {
            let (client, _) = relay.accept().await.unwrap();
            let upstream = TcpStream::connect(echo_addr).await.unwrap();
            copy_bidirectional(client, upstream).await.unwrap()
        });

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
        drop(client);

        let outcome = relay_task.await.unwrap();
        assert_eq!(outcome.sent, 4);
        assert_eq!(outcome.received, 4);
    }
}
