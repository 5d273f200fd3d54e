//! The wrapped storage-browsing service

use crate::error::GateResult;
use crate::http::{Body, HttpRequest, HttpResponse};

use hyper::Uri;
use hyper::header::HOST;
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

/// Where permitted requests go.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// Handles one request that already passed the pre-check.
    ///
    /// # Errors
    /// Returns `BadGateway` if the service cannot be reached.
    async fn call(&self, req: HttpRequest) -> GateResult<HttpResponse>;
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamUriError {
    #[error("invalid upstream URI")]
    Invalid(#[from] hyper::http::uri::InvalidUri),

    #[error("upstream URI must be http://host[:port]")]
    Unsupported,
}

/// Forwards requests over HTTP/1.1 to a fixed origin.
///
/// Only scheme and authority are rewritten; method, path, query, headers and body are
/// passed on as received.
pub struct HttpUpstream {
    scheme: Scheme,
    authority: Authority,
    client: Client<HttpConnector, Body>,
}

impl HttpUpstream {
    /// Creates a forwarder for `base`, e.g. `http://127.0.0.1:8787`.
    ///
    /// # Errors
    /// Returns an error if `base` is not a plain `http` origin.
    pub fn new(base: &str) -> Result<Self, UpstreamUriError> {
        let uri: Uri = base.parse()?;
        if uri.scheme() != Some(&Scheme::HTTP) || uri.path_and_query().is_some_and(|pq| pq.as_str() != "/") {
            return Err(UpstreamUriError::Unsupported);
        }
        let authority = uri.authority().cloned().ok_or(UpstreamUriError::Unsupported)?;
        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self {
            scheme: Scheme::HTTP,
            authority,
            client,
        })
    }

    fn rewrite_uri(&self, uri: &Uri) -> GateResult<Uri> {
        let path_and_query = uri.path_and_query().cloned().unwrap_or_else(|| PathAndQuery::from_static("/"));
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| gate_error!(e, InternalError, "cannot build upstream URI"))
    }
}

#[async_trait::async_trait]
impl Upstream for HttpUpstream {
    async fn call(&self, mut req: HttpRequest) -> GateResult<HttpResponse> {
        *req.uri_mut() = self.rewrite_uri(req.uri())?;
        req.headers_mut().remove(HOST);
        debug!(uri = %req.uri(), "forwarding");

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| gate_error!(e, BadGateway, "upstream request failed"))?;
        Ok(res.map(Body::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_origin_only() {
        assert!(HttpUpstream::new("http://127.0.0.1:8787").is_ok());
        assert!(HttpUpstream::new("http://browser.internal/").is_ok());
        assert!(matches!(
            HttpUpstream::new("https://browser.internal"),
            Err(UpstreamUriError::Unsupported)
        ));
        assert!(matches!(
            HttpUpstream::new("http://browser.internal/base"),
            Err(UpstreamUriError::Unsupported)
        ));
        assert!(matches!(HttpUpstream::new("not a uri"), Err(UpstreamUriError::Invalid(_))));
    }

    #[test]
    fn rewrites_origin_only() {
        let upstream = HttpUpstream::new("http://127.0.0.1:8787").unwrap();
        let uri = upstream
            .rewrite_uri(&"https://files.example.com/api/list?prefix=a%2F".parse().unwrap())
            .unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:8787/api/list?prefix=a%2F");

        let uri = upstream.rewrite_uri(&"/index.html".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:8787/index.html");
    }
}
