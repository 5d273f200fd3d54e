//! Per-user prefix authorization for object-storage browsers
//!
//! `keygate` sits in front of a storage-browsing service (such as an R2 or S3 explorer)
//! and decides, per request, whether the authenticated caller may touch the storage
//! paths the request names. It also filters listing responses so that callers only
//! see the entries under their granted prefixes.
//!
//! # Architecture
//!
//! ```text
//! request ─▶ route::classify ─▶ TokenVerifier ─▶ AccessStore ─▶ route::authorize_request
//!                                                                        │
//!                         client ◀─ filter::filter_response ◀─ Upstream ◀┘
//! ```
//!
//! + [`token`]: verifies the identity token (JWT against the provider's JWKS).
//! + [`access`]: resolves grants from the access control document in the bucket.
//! + [`authz`]: the prefix matching rules.
//! + [`route`]: request classification and the pre-check.
//! + [`filter`]: post-filtering of listing responses.
//! + [`service`]: the hyper/tower service tying it together.
//!
//! Every undetermined state denies: a missing identity, a corrupt document, an
//! ambiguous query or an oversized listing never reach the caller as access.
//!
//! # Access control document
//!
//! ```json
//! {
//!   "alice@example.com": ["team-a/", "shared/"],
//!   "admin@example.com": ["*"]
//! }
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use keygate::access::DocumentAccessStore;
//! use keygate::service::GateServiceBuilder;
//! use keygate::storage::FsStorage;
//! use keygate::token::{JwtVerifier, KeySet, TokenSettings};
//! use keygate::upstream::HttpUpstream;
//!
//! use hyper_util::rt::{TokioExecutor, TokioIo};
//! use hyper_util::server::conn::auto::Builder as ConnBuilder;
//! use tokio::net::TcpListener;
//!
//! # async fn run(jwks: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
//! let verifier = JwtVerifier::new(
//!     TokenSettings::cloudflare_access("acme.cloudflareaccess.com", "aud-tag"),
//!     KeySet::from_jwks(jwks)?,
//! );
//! let access = DocumentAccessStore::new(FsStorage::new("/srv/bucket")?);
//! let upstream = HttpUpstream::new("http://127.0.0.1:8787")?;
//! let service = GateServiceBuilder::new(verifier, access, upstream).build();
//!
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     let service = service.clone();
//!     tokio::spawn(async move {
//!         let _ = ConnBuilder::new(TokioExecutor::new())
//!             .serve_connection(TokioIo::new(stream), service)
//!             .await;
//!     });
//! }
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::bool_assert_comparison,  // I don't like `assert!(!expression)`. It's very misleading.
    clippy::multiple_crate_versions, // Sometimes not fixable
    clippy::module_name_repetitions,
    clippy::single_match_else,
)]

#[macro_use]
mod error;

mod http;

pub mod access;
pub mod authz;
pub mod config;
pub mod filter;
pub mod route;
pub mod service;
pub mod storage;
pub mod token;
pub mod upstream;

pub use self::error::*;
pub use self::http::{Body, HttpError, HttpRequest, HttpResponse, error_response};
