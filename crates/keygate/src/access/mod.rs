//! Access control document store
//!
//! Resolves the [`PermissionSet`] of an identity from the access control document kept
//! inside the managed bucket.
//!
//! # Failure semantics
//!
//! + Document missing → every identity has no permissions.
//! + Identity missing from the document → no permissions.
//! + Document unreadable or malformed → [`ConfigError`](crate::GateErrorCode::ConfigError),
//!   a server-side failure distinct from a denial.
//!
//! # Caching
//!
//! By default the document is read on every call. With
//! [`access_cache_ttl_secs`](crate::config::GateConfig::access_cache_ttl_secs) set, a
//! successfully parsed document is reused until it is that old, so a revoked grant is
//! honored within the TTL. Failures are never cached.

mod document;
pub use self::document::{AccessDocument, AccessDocumentError};

use crate::authz::PermissionSet;
use crate::config::GateConfig;
use crate::error::GateResult;
use crate::storage::Storage;
use crate::token::Identity;

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tracing::debug;

/// Permission lookup.
#[async_trait::async_trait]
pub trait AccessStore: Send + Sync + 'static {
    /// Resolves the permissions of `identity`.
    ///
    /// # Errors
    /// Returns [`ConfigError`](crate::GateErrorCode::ConfigError) if the permissions
    /// cannot be determined.
    async fn load_permissions(&self, identity: &Identity, config: &GateConfig) -> GateResult<PermissionSet>;
}

struct CachedDocument {
    key: String,
    fetched_at: Instant,
    document: Arc<AccessDocument>,
}

/// [`AccessStore`] reading the document from a [`Storage`] backend.
pub struct DocumentAccessStore<S> {
    storage: S,
    cache: ArcSwapOption<CachedDocument>,
}

impl<S: Storage> DocumentAccessStore<S> {
    #[must_use]
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            cache: ArcSwapOption::empty(),
        }
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Fetches and parses the document, or reuses a cached copy younger than the TTL.
    ///
    /// # Errors
    /// Returns [`ConfigError`](crate::GateErrorCode::ConfigError) if the document cannot be
    /// read or parsed.
    pub async fn load_document(&self, config: &GateConfig) -> GateResult<Arc<AccessDocument>> {
        let key = config.access_document_key.as_str();
        let ttl = Duration::from_secs(config.access_cache_ttl_secs);

        if !ttl.is_zero()
            && let Some(cached) = self.cache.load_full()
            && cached.key == key
            && cached.fetched_at.elapsed() < ttl
        {
            return Ok(Arc::clone(&cached.document));
        }

        let document = match self.storage.get(key).await {
            Ok(Some(data)) => AccessDocument::parse(&data)
                .map_err(|e| gate_error!(e, ConfigError, "cannot parse access control document {key:?}"))?,
            Ok(None) => {
                debug!(key, "access control document not found, treating as empty");
                AccessDocument::new()
            }
            Err(e) => return Err(gate_error!(e, ConfigError, "cannot read access control document {key:?}")),
        };
        let document = Arc::new(document);

        if !ttl.is_zero() {
            self.cache.store(Some(Arc::new(CachedDocument {
                key: key.to_owned(),
                fetched_at: Instant::now(),
                document: Arc::clone(&document),
            })));
        }

        Ok(document)
    }

    /// Drops the cached document, if any.
    pub fn invalidate(&self) {
        self.cache.store(None);
    }
}

#[async_trait::async_trait]
impl<S: Storage> AccessStore for DocumentAccessStore<S> {
    async fn load_permissions(&self, identity: &Identity, config: &GateConfig) -> GateResult<PermissionSet> {
        let document = self.load_document(config).await?;
        Ok(document.permissions(identity.as_str()))
    }
}
