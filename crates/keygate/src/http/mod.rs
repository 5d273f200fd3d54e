//! HTTP plumbing shared by the gate, the filter and the upstream client.

mod body;
pub use self::body::Body;

use crate::error::{GateError, StdError};

use std::fmt;

use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue};

pub type HttpRequest<B = Body> = http::Request<B>;

pub type HttpResponse<B = Body> = http::Response<B>;

/// Error type of the `hyper`/`tower` service implementations.
#[derive(Debug)]
pub struct HttpError(StdError);

impl HttpError {
    #[must_use]
    pub fn new(err: StdError) -> Self {
        Self(err)
    }

    #[must_use]
    pub fn inner(self) -> StdError {
        self.0
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const TEXT_PLAIN: HeaderValue = HeaderValue::from_static("text/plain; charset=utf-8");
#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const APPLICATION_JSON: HeaderValue = HeaderValue::from_static("application/json");
#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const NO_STORE: HeaderValue = HeaderValue::from_static("no-store, private");

/// Renders a gate error as a plain-text response.
///
/// Only the generic reason phrase is sent; messages and sources stay in the logs.
#[must_use]
pub fn error_response(err: &GateError) -> HttpResponse {
    let mut res = HttpResponse::new(Body::from(err.code().public_message()));
    *res.status_mut() = err.status_code();
    res.headers_mut().insert(CONTENT_TYPE, TEXT_PLAIN);
    res.headers_mut().insert(CACHE_CONTROL, NO_STORE);
    res
}
