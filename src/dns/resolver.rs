//! ECH config resolution and the tunneled DoH path

use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use http::{header, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::wire;
use crate::error::DnsError;
use crate::fetch::HttpsFetcher;

const DOH_CONTENT_TYPE: &str = "application/dns-message";
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches and caches the ECH config list for the tunnel dialer.
///
/// The cache lives for the ingress process lifetime; the only writer is
/// the refresh path, triggered when a dial failure names ECH.
pub struct EchResolver {
    doh_url: String,
    ech_domain: String,
    fetcher: HttpsFetcher,
    cache: RwLock<Option<Arc<Vec<u8>>>>,
}

impl std::fmt::Debug for EchResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchResolver")
            .field("doh_url", &self.doh_url)
            .field("ech_domain", &self.ech_domain)
            .field("cached", &self.cached().is_some())
            .finish()
    }
}

impl EchResolver {
    /// `doh_url` may omit the scheme; `https://` is assumed.
    pub fn new(doh_url: &str, ech_domain: &str, fetcher: HttpsFetcher) -> Self {
        let doh_url = if doh_url.starts_with("https://") || doh_url.starts_with("http://") {
            doh_url.to_string()
        } else {
            format!("https://{doh_url}")
        };
        Self {
            doh_url,
            ech_domain: ech_domain.to_string(),
            fetcher,
            cache: RwLock::new(None),
        }
    }

    /// Fetch the ECH config list and populate the cache
    pub async fn prepare(&self) -> Result<(), DnsError> {
        let list = self.fetch().await?;
        info!(bytes = list.len(), "ECH config list loaded");
        self.store(list);
        Ok(())
    }

    /// Re-fetch after a dial failure that named ECH
    pub async fn refresh(&self) {
        debug!("refreshing ECH config list");
        match self.fetch().await {
            Ok(list) => {
                info!(bytes = list.len(), "ECH config list refreshed");
                self.store(list);
            }
            Err(e) => warn!(error = %e, "ECH refresh failed, keeping previous config"),
        }
    }

    /// Currently cached config list, if any
    #[must_use]
    pub fn cached(&self) -> Option<Arc<Vec<u8>>> {
        self.cache.read().ok().and_then(|guard| guard.clone())
    }

    fn store(&self, list: Vec<u8>) {
        if let Ok(mut guard) = self.cache.write() {
            *guard = Some(Arc::new(list));
        }
    }

    async fn fetch(&self) -> Result<Vec<u8>, DnsError> {
        let query = wire::build_query(&self.ech_domain, wire::TYPE_HTTPS);
        let encoded = URL_SAFE_NO_PAD.encode(query);
        let separator = if self.doh_url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}dns={}", self.doh_url, separator, encoded);

        let body = tokio::time::timeout(
            QUERY_TIMEOUT,
            self.fetcher.get(&url, Some(DOH_CONTENT_TYPE)),
        )
        .await
        .map_err(|_| DnsError::Timeout)??;

        wire::extract_ech_config(&body)
    }
}

/// Send one wire-format DNS query as a DoH POST over an established
/// stream (the tunnel's ECH TLS channel) and return the response body.
///
/// `authority` is the value for the Host header, e.g.
/// `cloudflare-dns.com:443`.
pub async fn doh_post_over<S>(stream: S, authority: &str, query: Vec<u8>) -> Result<Bytes, DnsError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| DnsError::Transport(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "tunneled DoH connection closed with error");
        }
    });

    let request = Request::post("/dns-query")
        .header(header::HOST, authority)
        .header(header::CONTENT_TYPE, DOH_CONTENT_TYPE)
        .header(header::ACCEPT, DOH_CONTENT_TYPE)
        .body(Full::new(Bytes::from(query)))
        .map_err(|e| DnsError::Transport(e.to_string()))?;

    let response = tokio::time::timeout(QUERY_TIMEOUT, sender.send_request(request))
        .await
        .map_err(|_| DnsError::Timeout)?
        .map_err(|e| DnsError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DnsError::Status(status.as_u16()));
    }

    response
        .into_body()
        .collect()
        .await
        .map(http_body_util::Collected::to_bytes)
        .map_err(|e| DnsError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_is_defaulted() {
        let fetcher = HttpsFetcher::new();
        let r = EchResolver::new("dns.alidns.com/dns-query", "cloudflare-ech.com", fetcher);
        assert_eq!(r.doh_url, "https://dns.alidns.com/dns-query");

        let fetcher = HttpsFetcher::new();
        let r = EchResolver::new("https://doh.pub/dns-query", "cloudflare-ech.com", fetcher);
        assert_eq!(r.doh_url, "https://doh.pub/dns-query");
    }

    #[test]
    fn cache_starts_empty() {
        let r = EchResolver::new("doh.pub/dns-query", "cloudflare-ech.com", HttpsFetcher::new());
        assert!(r.cached().is_none());
    }
}
