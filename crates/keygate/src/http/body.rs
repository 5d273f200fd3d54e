use crate::error::StdError;

use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Collected, Full, Limited};

/// HTTP body used on both sides of the gate.
///
/// Either a single in-memory buffer (error pages, filtered listings) or a boxed
/// stream (client uploads, upstream downloads) that is passed through untouched.
#[derive(Default)]
pub struct Body {
    kind: Kind,
}

enum Kind {
    Once(Bytes),
    Boxed(UnsyncBoxBody<Bytes, StdError>),
}

impl Default for Kind {
    fn default() -> Self {
        Kind::Once(Bytes::new())
    }
}

impl Body {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wraps any `http_body::Body`.
    pub fn http_body_unsync<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<StdError>,
    {
        Self {
            kind: Kind::Boxed(body.map_err(Into::into).boxed_unsync()),
        }
    }

    /// Returns the buffered bytes if the body is held in memory.
    #[must_use]
    pub fn bytes(&self) -> Option<Bytes> {
        match &self.kind {
            Kind::Once(bytes) => Some(bytes.clone()),
            Kind::Boxed(_) => None,
        }
    }

    /// Reads the whole body into memory, failing once more than `limit` bytes arrive.
    ///
    /// # Errors
    /// Returns an error if the underlying stream fails or exceeds `limit`.
    pub async fn store_all_limited(&mut self, limit: usize) -> Result<Bytes, StdError> {
        let bytes = match mem::take(&mut self.kind) {
            Kind::Once(bytes) => collect_limited(Full::new(bytes), limit).await?.to_bytes(),
            Kind::Boxed(inner) => collect_limited(inner, limit).await?.to_bytes(),
        };
        self.kind = Kind::Once(bytes.clone());
        Ok(bytes)
    }
}

// Built outside the async fn so the `Send` bound is proven without lifetime erasure.
fn collect_limited<B>(body: B, limit: usize) -> impl Future<Output = Result<Collected<Bytes>, StdError>> + Send
where
    B: http_body::Body<Data = Bytes> + Send,
    B::Error: Into<StdError>,
{
    Limited::new(body, limit).collect()
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self { kind: Kind::Once(bytes) }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Self {
        Self::from(Bytes::from(vec))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::from(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::from(Bytes::from_static(s.as_bytes()))
    }
}

impl From<hyper::body::Incoming> for Body {
    fn from(body: hyper::body::Incoming) -> Self {
        Self::http_body_unsync(body)
    }
}

impl http_body::Body for Body {
    type Data = Bytes;

    type Error = StdError;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.kind {
            Kind::Once(bytes) => {
                if bytes.is_empty() {
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Ok(Frame::data(mem::take(bytes)))))
            }
            Kind::Boxed(inner) => Pin::new(inner).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Once(bytes) => bytes.is_empty(),
            Kind::Boxed(inner) => inner.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Once(bytes) => SizeHint::with_exact(bytes.len() as u64),
            Kind::Boxed(inner) => inner.size_hint(),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Body");
        match &self.kind {
            Kind::Once(bytes) => d.field("once", &bytes.len()),
            Kind::Boxed(_) => d.field("stream", &".."),
        };
        d.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body::Body as _;

    #[tokio::test]
    async fn once_body_yields_single_frame() {
        let body = Body::from("hello");
        assert_eq!(body.size_hint().exact(), Some(5));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, "hello");
    }

    #[tokio::test]
    async fn store_all_limited_buffers_stream() {
        let mut body = Body::http_body_unsync(Full::new(Bytes::from_static(b"0123456789")));
        assert!(body.bytes().is_none());
        let bytes = body.store_all_limited(64).await.unwrap();
        assert_eq!(bytes, "0123456789");
        assert_eq!(body.bytes().unwrap(), "0123456789");
    }

    #[tokio::test]
    async fn store_all_limited_rejects_oversized() {
        let mut body = Body::http_body_unsync(Full::new(Bytes::from_static(b"0123456789")));
        let err = body.store_all_limited(4).await.unwrap_err();
        assert!(err.downcast_ref::<http_body_util::LengthLimitError>().is_some());

        let mut body = Body::from("0123456789");
        assert!(body.store_all_limited(4).await.is_err());
    }
}
