//! SOCKS5 handler: CONNECT and UDP ASSOCIATE, RFC 1928 without auth
//!
//! UDP ASSOCIATE opens a loopback relay whose lifetime is tied to the
//! TCP control connection. Only DNS datagrams (destination port 53) are
//! forwarded; they travel as DoH requests over the same ECH channel the
//! tunnel uses, and the response is returned under the original SOCKS5
//! UDP header. Everything else is logged and dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{tunnel, IngressContext, ProxyMode};
use crate::error::ProxyError;
use crate::session::CloseLatch;

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const UDP_BUF_SIZE: usize = 8192;

/// Handle a connection whose first byte was 0x05
pub(super) async fn handle(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<IngressContext>,
) -> Result<(), ProxyError> {
    let request = timeout(HANDSHAKE_TIMEOUT, negotiate(&mut stream))
        .await
        .map_err(|_| ProxyError::Socks("handshake timeout".into()))??;

    match request {
        Request::Connect(target) => {
            debug!(peer = %peer, target = %target, "socks5 connect");
            tunnel::handle_tunnel(stream, target, ProxyMode::Socks5, None, ctx).await
        }
        Request::UdpAssociate => udp_associate(stream, peer, ctx).await,
    }
}

enum Request {
    Connect(String),
    UdpAssociate,
}

/// Greeting, method selection, and request parsing. The version byte
/// has already been consumed by the protocol sniff.
async fn negotiate(stream: &mut TcpStream) -> Result<Request, ProxyError> {
    // Remaining greeting: NMETHODS METHODS...
    let mut byte = [0u8; 1];
    stream
        .read_exact(&mut byte)
        .await
        .map_err(|e| ProxyError::Socks(format!("read nmethods: {e}")))?;
    let nmethods = byte[0] as usize;
    let mut methods = vec![0u8; nmethods];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|e| ProxyError::Socks(format!("read methods: {e}")))?;

    // No authentication
    stream
        .write_all(&[SOCKS_VERSION, 0x00])
        .await
        .map_err(|e| ProxyError::Socks(format!("write method select: {e}")))?;

    // Request: VER CMD RSV ATYP
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| ProxyError::Socks(format!("read request: {e}")))?;
    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::Socks(format!("bad version: 0x{:02x}", head[0])));
    }
    let cmd = head[1];
    let atyp = head[3];

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream
                .read_exact(&mut octets)
                .await
                .map_err(|e| ProxyError::Socks(format!("read ipv4: {e}")))?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            stream
                .read_exact(&mut byte)
                .await
                .map_err(|e| ProxyError::Socks(format!("read domain len: {e}")))?;
            let mut name = vec![0u8; byte[0] as usize];
            stream
                .read_exact(&mut name)
                .await
                .map_err(|e| ProxyError::Socks(format!("read domain: {e}")))?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream
                .read_exact(&mut octets)
                .await
                .map_err(|e| ProxyError::Socks(format!("read ipv6: {e}")))?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        other => {
            reply(stream, REPLY_ATYP_NOT_SUPPORTED).await;
            return Err(ProxyError::Socks(format!("unsupported atyp: 0x{other:02x}")));
        }
    };

    let mut port_buf = [0u8; 2];
    stream
        .read_exact(&mut port_buf)
        .await
        .map_err(|e| ProxyError::Socks(format!("read port: {e}")))?;
    let port = u16::from_be_bytes(port_buf);

    match cmd {
        CMD_CONNECT => {
            let target = if atyp == ATYP_IPV6 {
                format!("[{host}]:{port}")
            } else {
                format!("{host}:{port}")
            };
            Ok(Request::Connect(target))
        }
        CMD_UDP_ASSOCIATE => Ok(Request::UdpAssociate),
        other => {
            reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await;
            Err(ProxyError::Socks(format!("unsupported command: 0x{other:02x}")))
        }
    }
}

/// Fixed-form reply with a zero bound address
async fn reply(stream: &mut TcpStream, code: u8) {
    let _ = stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await;
}

/// UDP ASSOCIATE: bind a loopback socket, relay DNS over DoH, and keep
/// the TCP control connection as the liveness signal.
async fn udp_associate(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<IngressContext>,
) -> Result<(), ProxyError> {
    let udp = match UdpSocket::bind("127.0.0.1:0").await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            reply(&mut stream, REPLY_GENERAL_FAILURE).await;
            return Err(ProxyError::Socks(format!("udp bind failed: {e}")));
        }
    };
    let local = udp
        .local_addr()
        .map_err(|e| ProxyError::Socks(format!("udp local addr: {e}")))?;
    debug!(peer = %peer, udp_port = local.port(), "udp associate bound");

    let mut response = vec![SOCKS_VERSION, REPLY_SUCCEEDED, 0x00, ATYP_IPV4, 127, 0, 0, 1];
    response.extend_from_slice(&local.port().to_be_bytes());
    stream
        .write_all(&response)
        .await
        .map_err(|e| ProxyError::Socks(format!("write udp reply: {e}")))?;

    let stop = CloseLatch::new();
    let relay = tokio::spawn(udp_relay(
        Arc::clone(&udp),
        peer,
        Arc::clone(&ctx),
        Arc::clone(&stop),
    ));

    // The TCP socket going quiet ends the association
    let mut hold = [0u8; 1];
    tokio::select! {
        _ = stream.read(&mut hold) => {}
        () = ctx.lifecycle.wait() => {}
    }

    stop.close();
    let _ = relay.await;
    debug!(peer = %peer, "udp associate closed");
    Ok(())
}

async fn udp_relay(
    udp: Arc<UdpSocket>,
    peer: SocketAddr,
    ctx: Arc<IngressContext>,
    stop: Arc<CloseLatch>,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let (len, from) = tokio::select! {
            () = stop.wait() => return,
            received = udp.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "udp recv failed");
                    return;
                }
            },
        };

        let Some(datagram) = parse_udp_datagram(&buf[..len]) else {
            continue;
        };

        if datagram.port == 53 {
            debug!(peer = %peer, target = %datagram.target(), "udp dns query via DoH");
            let header = buf[..datagram.header_len].to_vec();
            let query = buf[datagram.header_len..len].to_vec();
            tokio::spawn(forward_dns(
                Arc::clone(&udp),
                from,
                header,
                query,
                Arc::clone(&ctx),
            ));
        } else {
            debug!(peer = %peer, target = %datagram.target(), "non-dns udp dropped");
        }
    }
}

/// Fields of a SOCKS5 UDP request header
struct UdpDatagram {
    header_len: usize,
    host: String,
    port: u16,
    ipv6: bool,
}

impl UdpDatagram {
    fn target(&self) -> String {
        if self.ipv6 {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parse `RSV(2) FRAG(1) ATYP(1) DST.ADDR DST.PORT(2)`. Fragmented
/// datagrams (FRAG != 0) are silently dropped per the relay contract.
fn parse_udp_datagram(data: &[u8]) -> Option<UdpDatagram> {
    if data.len() < 10 || data[2] != 0x00 {
        return None;
    }
    match data[3] {
        ATYP_IPV4 => {
            let host = std::net::Ipv4Addr::new(data[4], data[5], data[6], data[7]).to_string();
            let port = u16::from_be_bytes([data[8], data[9]]);
            Some(UdpDatagram {
                header_len: 10,
                host,
                port,
                ipv6: false,
            })
        }
        ATYP_DOMAIN => {
            let name_len = data[4] as usize;
            let header_len = 7 + name_len;
            if data.len() < header_len {
                return None;
            }
            let host = String::from_utf8_lossy(&data[5..5 + name_len]).into_owned();
            let port = u16::from_be_bytes([data[5 + name_len], data[6 + name_len]]);
            Some(UdpDatagram {
                header_len,
                host,
                port,
                ipv6: false,
            })
        }
        ATYP_IPV6 => {
            if data.len() < 22 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            let host = std::net::Ipv6Addr::from(octets).to_string();
            let port = u16::from_be_bytes([data[20], data[21]]);
            Some(UdpDatagram {
                header_len: 22,
                host,
                port,
                ipv6: true,
            })
        }
        _ => None,
    }
}

/// Resolve one DNS query through the egress-anchored DoH endpoint and
/// send the answer back under the original SOCKS5 header.
async fn forward_dns(
    udp: Arc<UdpSocket>,
    client: SocketAddr,
    header: Vec<u8>,
    query: Vec<u8>,
    ctx: Arc<IngressContext>,
) {
    let server = ctx.dialer.server();
    let authority = format!("cloudflare-dns.com:{}", server.port);

    let tls = match ctx
        .dialer
        .tls()
        .connect("cloudflare-dns.com", &server.host, server.port)
        .await
    {
        Ok(tls) => tls,
        Err(e) => {
            warn!(error = %e, "DoH channel dial failed");
            return;
        }
    };

    match crate::dns::resolver::doh_post_over(tls, &authority, query).await {
        Ok(answer) => {
            let mut packet = header;
            packet.extend_from_slice(&answer);
            if let Err(e) = udp.send_to(&packet, client).await {
                debug!(error = %e, "udp response send failed");
            }
        }
        Err(e) => warn!(error = %e, "tunneled DoH query failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_header_ipv4() {
        let mut data = vec![0, 0, 0, ATYP_IPV4, 8, 8, 8, 8, 0, 53];
        data.extend_from_slice(b"query");
        let parsed = parse_udp_datagram(&data).unwrap();
        assert_eq!(parsed.header_len, 10);
        assert_eq!(parsed.target(), "8.8.8.8:53");
    }

    #[test]
    fn udp_header_domain() {
        let mut data = vec![0, 0, 0, ATYP_DOMAIN, 7];
        data.extend_from_slice(b"dns.com");
        data.extend_from_slice(&53u16.to_be_bytes());
        data.extend_from_slice(b"q");
        let parsed = parse_udp_datagram(&data).unwrap();
        assert_eq!(parsed.header_len, 7 + 7);
        assert_eq!(parsed.target(), "dns.com:53");
    }

    #[test]
    fn udp_header_ipv6() {
        let mut data = vec![0, 0, 0, ATYP_IPV6];
        data.extend_from_slice(&[0; 15]);
        data.push(1);
        data.extend_from_slice(&443u16.to_be_bytes());
        let parsed = parse_udp_datagram(&data).unwrap();
        assert_eq!(parsed.header_len, 22);
        assert_eq!(parsed.target(), "[::1]:443");
    }

    #[test]
    fn fragmented_datagrams_dropped() {
        let data = vec![0, 0, 1, ATYP_IPV4, 8, 8, 8, 8, 0, 53, 1, 2];
        assert!(parse_udp_datagram(&data).is_none());
    }

    #[test]
    fn short_datagrams_dropped() {
        assert!(parse_udp_datagram(&[0, 0, 0]).is_none());
        let truncated_domain = vec![0, 0, 0, ATYP_DOMAIN, 20, b'a'];
        assert!(parse_udp_datagram(&truncated_domain).is_none());
    }
}
