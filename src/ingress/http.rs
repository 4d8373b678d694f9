//! HTTP handler: CONNECT tunnels and the absolute-URI forward proxy
//!
//! The request head is parsed off the raw socket because the socket is
//! handed onward afterwards, either into a CONNECT tunnel or with a
//! rebuilt request bundled as the tunnel's first payload. Reads never
//! go past the declared body, so no client bytes are lost.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{tunnel, IngressContext, ProxyMode};
use crate::error::ProxyError;

/// Largest accepted request head
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Forward-proxy bodies above this are rejected outright
const MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;

const FORWARD_METHODS: [&str; 8] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE",
];

/// Handle a connection whose first byte began an HTTP method
pub(super) async fn handle(
    mut stream: TcpStream,
    first_byte: u8,
    peer: SocketAddr,
    ctx: Arc<IngressContext>,
) -> Result<(), ProxyError> {
    let (head_bytes, mut remainder) = read_head(&mut stream, first_byte).await?;
    let head = RequestHead::parse(&head_bytes)?;

    if head.method == "CONNECT" {
        debug!(peer = %peer, target = %head.target, "http connect");
        let first_payload = (!remainder.is_empty()).then(|| std::mem::take(&mut remainder));
        return tunnel::handle_tunnel(
            stream,
            head.target,
            ProxyMode::HttpConnect,
            first_payload,
            ctx,
        )
        .await;
    }

    if !FORWARD_METHODS.contains(&head.method.as_str()) {
        let _ = stream
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
            .await;
        return Err(ProxyError::UnsupportedMethod(head.method));
    }

    // Derive the origin target and the path to put on the request line
    let (target, path) = head.origin_form()?;
    debug!(peer = %peer, method = %head.method, target = %target, "http forward proxy");

    // Rebuild the request without proxy-hop headers
    let mut rebuilt = Vec::with_capacity(head_bytes.len());
    rebuilt.extend_from_slice(
        format!("{} {} {}\r\n", head.method, path, head.version).as_bytes(),
    );
    for line in &head.header_lines {
        let name = line.split(':').next().unwrap_or("").trim();
        if name.eq_ignore_ascii_case("proxy-connection")
            || name.eq_ignore_ascii_case("proxy-authorization")
        {
            continue;
        }
        rebuilt.extend_from_slice(line.as_bytes());
        rebuilt.extend_from_slice(b"\r\n");
    }
    rebuilt.extend_from_slice(b"\r\n");

    // Attach the declared body, bounded
    if let Some(length) = head.content_length() {
        if length > MAX_BODY_SIZE {
            let _ = stream
                .write_all(b"HTTP/1.1 413 Payload Too Large\r\n\r\n")
                .await;
            return Err(ProxyError::BodyTooLarge(length));
        }
        let mut body = remainder;
        if (body.len() as u64) > length {
            body.truncate(length as usize);
        }
        let missing = length as usize - body.len();
        if missing > 0 {
            let mut rest = vec![0u8; missing];
            stream
                .read_exact(&mut rest)
                .await
                .map_err(|e| ProxyError::Http(format!("read body: {e}")))?;
            body.extend_from_slice(&rest);
        }
        rebuilt.extend_from_slice(&body);
    }

    tunnel::handle_tunnel(stream, target, ProxyMode::HttpProxy, Some(rebuilt), ctx).await
}

/// Read up to the blank line ending the head. Returns the head bytes
/// (including the terminator) and whatever was read past it.
async fn read_head(stream: &mut TcpStream, first_byte: u8) -> Result<(Vec<u8>, Vec<u8>), ProxyError> {
    let mut data = Vec::with_capacity(1024);
    data.push(first_byte);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(end) = find_head_end(&data) {
            let remainder = data.split_off(end);
            return Ok((data, remainder));
        }
        if data.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::Http("request head too large".into()));
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ProxyError::Http(format!("read head: {e}")))?;
        if n == 0 {
            return Err(ProxyError::Http("eof before end of head".into()));
        }
        data.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4)
}

/// Parsed request line and raw header lines
struct RequestHead {
    method: String,
    target: String,
    version: String,
    header_lines: Vec<String>,
}

impl RequestHead {
    fn parse(bytes: &[u8]) -> Result<Self, ProxyError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ProxyError::Http("head is not valid utf-8".into()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .ok_or_else(|| ProxyError::Http("empty request".into()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| ProxyError::Http("missing method".into()))?
            .to_string();
        let target = parts
            .next()
            .ok_or_else(|| ProxyError::Http("missing request target".into()))?
            .to_string();
        let version = parts.next().unwrap_or("HTTP/1.1").to_string();

        let header_lines: Vec<String> = lines
            .take_while(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            method,
            target,
            version,
            header_lines,
        })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.header_lines.iter().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.parse().ok()
    }

    /// Origin `host:port` plus the origin-form path for the request line
    fn origin_form(&self) -> Result<(String, String), ProxyError> {
        if let Some(rest) = self.target.strip_prefix("http://") {
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], rest[idx..].to_string()),
                None => (rest, "/".to_string()),
            };
            if authority.is_empty() {
                return Err(ProxyError::Http("empty authority in uri".into()));
            }
            return Ok((with_default_port(authority), path));
        }

        // Relative path: the Host header carries the origin
        let host = self
            .header("host")
            .ok_or_else(|| ProxyError::Http("relative uri without Host header".into()))?;
        Ok((with_default_port(host), self.target.clone()))
    }
}

/// Append `:80` when the authority has no port
fn with_default_port(authority: &str) -> String {
    let has_port = if let Some(end) = authority.rfind(']') {
        authority[end..].contains(':')
    } else {
        authority.contains(':')
    };
    if has_port {
        authority.to_string()
    } else {
        format!("{authority}:80")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(text: &str) -> RequestHead {
        RequestHead::parse(text.as_bytes()).unwrap()
    }

    #[test]
    fn parses_connect_line() {
        let h = head("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n");
        assert_eq!(h.method, "CONNECT");
        assert_eq!(h.target, "example.com:443");
        assert_eq!(h.version, "HTTP/1.1");
    }

    #[test]
    fn absolute_uri_splits_authority_and_path() {
        let h = head("GET http://example.com/hi HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let (target, path) = h.origin_form().unwrap();
        assert_eq!(target, "example.com:80");
        assert_eq!(path, "/hi");
    }

    #[test]
    fn absolute_uri_with_port_and_bare_authority() {
        let h = head("GET http://example.com:8080 HTTP/1.1\r\n\r\n");
        let (target, path) = h.origin_form().unwrap();
        assert_eq!(target, "example.com:8080");
        assert_eq!(path, "/");
    }

    #[test]
    fn relative_uri_uses_host_header() {
        let h = head("GET /hi HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let (target, path) = h.origin_form().unwrap();
        assert_eq!(target, "example.com:80");
        assert_eq!(path, "/hi");
    }

    #[test]
    fn relative_uri_without_host_fails() {
        let h = head("GET /hi HTTP/1.1\r\n\r\n");
        assert!(h.origin_form().is_err());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let h = head("GET / HTTP/1.1\r\nContent-Length: 12\r\nHost: a\r\n\r\n");
        assert_eq!(h.content_length(), Some(12));
        assert_eq!(h.header("HOST"), Some("a"));
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn ipv6_authority_port_detection() {
        assert_eq!(with_default_port("[::1]:8080"), "[::1]:8080");
        assert_eq!(with_default_port("[::1]"), "[::1]:80");
        assert_eq!(with_default_port("example.com"), "example.com:80");
    }
}
