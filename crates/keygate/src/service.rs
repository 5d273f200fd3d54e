//! Gate Service and Builder
//!
//! [`GateService`] is a hyper and tower service that authorizes each request before
//! handing it to the wrapped storage-browsing service. It coordinates:
//!
//! - **Configuration**: per-request snapshot from a [`GateConfigProvider`]
//! - **Token verification**: a [`TokenVerifier`]
//! - **Permissions**: an [`AccessStore`]
//! - **Upstream**: the [`Upstream`] that serves permitted requests
//!
//! # Request flow
//!
//! 1. Normalize the path and classify the request. Exempt endpoints are forwarded as is.
//! 2. Verify the token (401 on failure).
//! 3. Resolve the caller's permissions (500 if the access control document is broken).
//! 4. Pre-check (403 on denial; the upstream is never called).
//! 5. Forward.
//! 6. Filter listing responses.
//!
//! # Example
//!
//! ```
//! use keygate::access::DocumentAccessStore;
//! use keygate::service::GateServiceBuilder;
//! use keygate::storage::MemoryStorage;
//! use keygate::token::{JwtVerifier, KeySet, TokenSettings};
//! use keygate::upstream::HttpUpstream;
//!
//! let verifier = JwtVerifier::new(
//!     TokenSettings::cloudflare_access("acme.cloudflareaccess.com", "aud-tag"),
//!     KeySet::hmac(None, b"secret"),
//! );
//! let upstream = HttpUpstream::new("http://127.0.0.1:8787").unwrap();
//!
//! let service = GateServiceBuilder::new(verifier, DocumentAccessStore::new(MemoryStorage::new()), upstream).build();
//! ```

use crate::access::AccessStore;
use crate::config::{GateConfig, GateConfigProvider, StaticConfigProvider};
use crate::error::{GateError, GateResult, StdError};
use crate::filter::filter_response;
use crate::http::{Body, error_response};
use crate::route::{self, Classified, Decision};
use crate::token::{Identity, TokenVerifier, extract_token};
use crate::upstream::Upstream;
use crate::{HttpError, HttpRequest, HttpResponse};

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::header::ACCEPT_ENCODING;
use tracing::{debug, error, info};

/// Builder for [`GateService`].
pub struct GateServiceBuilder {
    config: Option<Arc<dyn GateConfigProvider>>,
    verifier: Box<dyn TokenVerifier>,
    access: Box<dyn AccessStore>,
    upstream: Box<dyn Upstream>,
}

impl GateServiceBuilder {
    #[must_use]
    pub fn new(verifier: impl TokenVerifier, access: impl AccessStore, upstream: impl Upstream) -> Self {
        Self {
            config: None,
            verifier: Box::new(verifier),
            access: Box::new(access),
            upstream: Box::new(upstream),
        }
    }

    /// Sets the configuration provider.
    ///
    /// If not set, defaults to [`StaticConfigProvider::default()`].
    pub fn set_config(&mut self, config: Arc<dyn GateConfigProvider>) {
        self.config = Some(config);
    }

    pub fn set_verifier(&mut self, verifier: impl TokenVerifier) {
        self.verifier = Box::new(verifier);
    }

    pub fn set_access(&mut self, access: impl AccessStore) {
        self.access = Box::new(access);
    }

    pub fn set_upstream(&mut self, upstream: impl Upstream) {
        self.upstream = Box::new(upstream);
    }

    #[must_use]
    pub fn build(self) -> GateService {
        let config = self.config.unwrap_or_else(|| Arc::new(StaticConfigProvider::default()));
        GateService {
            inner: Arc::new(Inner {
                config,
                verifier: self.verifier,
                access: self.access,
                upstream: self.upstream,
            }),
        }
    }
}

/// The authorization gate.
///
/// Implements both [`hyper::service::Service`] and [`tower::Service`].
/// Cheap to clone.
#[derive(Clone)]
pub struct GateService {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<dyn GateConfigProvider>,
    verifier: Box<dyn TokenVerifier>,
    access: Box<dyn AccessStore>,
    upstream: Box<dyn Upstream>,
}

fn log_decision(config: &GateConfig, identity: &Identity, req: &Classified, decision: &Decision) {
    let kind = req.kind();
    let target = req.target().unwrap_or_default();
    if config.log_decisions {
        info!(%identity, kind, target, %decision, "access decision");
    } else {
        debug!(kind, target, %decision, "access decision");
    }
}

impl Inner {
    async fn handle(&self, mut req: HttpRequest, config: &GateConfig) -> GateResult<HttpResponse> {
        let classified = match route::normalize_uri(req.uri()) {
            Ok(normalized) => {
                if let Some(uri) = normalized {
                    debug!(from = %req.uri(), to = %uri, "normalized request path");
                    *req.uri_mut() = uri;
                }
                route::classify(req.method(), req.uri(), config)
            }
            Err(err) => Err(err),
        };

        if let Ok(ref c) = classified
            && c.is_exempt()
        {
            return self.upstream.call(req).await;
        }

        let token = extract_token(req.headers(), &config.token_header)?;
        let identity = self.verifier.verify(token)?;

        let classified = match classified {
            Ok(c) => c,
            Err(err) => {
                if config.log_decisions {
                    info!(%identity, %err, "access decision: unclassifiable request");
                }
                return Err(err);
            }
        };

        let perms = self.access.load_permissions(&identity, config).await?;

        let decision = route::authorize_request(&classified, &perms);
        log_decision(config, &identity, &classified, &decision);
        if let Decision::Deny(reason) = decision {
            return Err(gate_error!(Forbidden, "{reason}"));
        }

        let filter = classified.is_listing() && !perms.is_wildcard();
        if filter {
            req.headers_mut().remove(ACCEPT_ENCODING);
        }

        let res = self.upstream.call(req).await?;

        if filter {
            return filter_response(res, &perms, config.max_listing_body_size).await;
        }
        Ok(res)
    }
}

impl GateService {
    #[tracing::instrument(
        level = "debug",
        skip(self, req),
        fields(method = %req.method(), path = %req.uri().path())
    )]
    pub async fn call(&self, req: HttpRequest) -> Result<HttpResponse, HttpError> {
        let t0 = Instant::now();

        let config = self.inner.config.snapshot();
        let result = self.inner.handle(req, &config).await;

        let duration = t0.elapsed();

        let resp = match result {
            Ok(resp) => resp,
            Err(err) => render_error(&err),
        };

        if resp.status().is_server_error() {
            error!(?duration, status = %resp.status());
        } else {
            debug!(?duration, status = %resp.status());
        }

        Ok(resp)
    }

    async fn call_owned(self, req: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.call(req).await
    }
}

fn render_error(err: &GateError) -> HttpResponse {
    if err.status_code().is_server_error() {
        error!(%err, source = ?std::error::Error::source(err), "request failed");
    } else {
        debug!(%err, "request rejected");
    }
    error_response(err)
}

impl fmt::Debug for GateService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateService").finish_non_exhaustive()
    }
}

impl hyper::service::Service<http::Request<hyper::body::Incoming>> for GateService {
    type Response = HttpResponse;

    type Error = HttpError;

    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: http::Request<hyper::body::Incoming>) -> Self::Future {
        let req = req.map(Body::from);
        let service = self.clone();
        Box::pin(service.call_owned(req))
    }
}

impl<B> tower::Service<http::Request<B>> for GateService
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    type Response = HttpResponse;

    type Error = HttpError;

    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let req = req.map(Body::http_body_unsync);
        let service = self.clone();
        Box::pin(service.call_owned(req))
    }
}
