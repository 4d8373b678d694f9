//! Plain HTTPS fetcher for bootstrap requests
//!
//! Used for the DoH ECH lookup and the range-list download, both of
//! which happen before (or outside) any tunnel. Keeps one pooled hyper
//! client with a webpki-roots TLS connector.

use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::DnsError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared HTTPS client for out-of-tunnel GET requests
#[derive(Clone)]
pub struct HttpsFetcher {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

impl std::fmt::Debug for HttpsFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsFetcher").finish_non_exhaustive()
    }
}

impl HttpsFetcher {
    #[must_use]
    pub fn new() -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Self {
            client: Client::builder(TokioExecutor::new()).build(https),
        }
    }

    /// GET a URL, expecting a 200 with a body
    pub async fn get(&self, url: &str, accept: Option<&str>) -> Result<Bytes, DnsError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| DnsError::InvalidUrl(url.to_string()))?;

        let mut request = Request::builder().method(Method::GET).uri(uri);
        if let Some(accept) = accept {
            request = request.header(header::ACCEPT, accept);
        }
        let request = request
            .body(Empty::new())
            .map_err(|e| DnsError::Transport(e.to_string()))?;

        let response = tokio::time::timeout(FETCH_TIMEOUT, self.client.request(request))
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

    /// GET a URL and decode the body as UTF-8 text
    pub async fn get_text(&self, url: &str) -> Result<String, DnsError> {
        let body = self.get(url, None).await?;
        String::from_utf8(body.to_vec()).map_err(|_| DnsError::Malformed("body is not utf-8"))
    }
}

impl Default for HttpsFetcher {
    fn default() -> Self {
        Self::new()
    }
}
