//! Gate Configuration
//!
//! This module provides the tunable parameters of the gate: which header carries the
//! identity token, where the access control document lives, and how request paths map
//! to endpoint families.
//!
//! # Features
//! - `serde` support for serialization/deserialization
//! - Default values for all parameters
//! - Static configuration via [`StaticConfigProvider`]
//! - Hot-reload configuration via [`HotReloadConfigProvider`]
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use keygate::config::{GateConfig, GateConfigProvider, HotReloadConfigProvider};
//!
//! let provider = HotReloadConfigProvider::default();
//! assert_eq!(provider.snapshot().access_document_key, "access-control/config.json");
//!
//! let mut config = GateConfig::default();
//! config.log_decisions = true;
//! provider.update(Arc::new(config));
//! assert!(provider.snapshot().log_decisions);
//! ```

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Gate Configuration Provider trait.
///
/// Each request takes one snapshot at the start and threads it through every
/// component, so a reload never changes the rules halfway through a request.
pub trait GateConfigProvider: Send + Sync + 'static {
    /// Returns a snapshot of the current configuration.
    fn snapshot(&self) -> Arc<GateConfig>;
}

/// Gate Configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct GateConfig {
    /// Request header carrying the identity token.
    ///
    /// Default: `cf-access-jwt-assertion`
    pub token_header: String,

    /// Key of the access control document inside the managed bucket.
    ///
    /// Default: `access-control/config.json`
    pub access_document_key: String,

    /// Path prefix of the browsing service API. Anything outside it is a UI asset.
    ///
    /// Default: `/api/`
    pub api_prefix: String,

    /// Path prefixes of listing endpoints. The `prefix` query parameter is gated
    /// and the response body is filtered.
    ///
    /// Default: `["/api/list"]`
    pub list_paths: Vec<String>,

    /// Path prefixes of bucket-scoped endpoints. The `prefix` query parameter must be
    /// permitted outright; listing-shaped responses are filtered as well.
    ///
    /// Default: `["/api/buckets"]`
    pub metadata_paths: Vec<String>,

    /// Exact paths that bypass authentication and authorization.
    ///
    /// Default: `["/api/server/config"]`
    pub exempt_paths: Vec<String>,

    /// Largest listing body the filter buffers. Larger listings fail with 502.
    ///
    /// Default: 16 MiB
    pub max_listing_body_size: usize,

    /// How long a fetched access control document may be reused.
    /// A revoked grant takes effect at most this many seconds later.
    ///
    /// Default: 0 (read on every request)
    pub access_cache_ttl_secs: u64,

    /// Log every allow/deny decision at info level, including the identity.
    ///
    /// Default: false
    pub log_decisions: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            token_header: "cf-access-jwt-assertion".to_owned(),
            access_document_key: "access-control/config.json".to_owned(),
            api_prefix: "/api/".to_owned(),
            list_paths: vec!["/api/list".to_owned()],
            metadata_paths: vec!["/api/buckets".to_owned()],
            exempt_paths: vec!["/api/server/config".to_owned()],
            max_listing_body_size: 16 * 1024 * 1024, // 16 MiB
            access_cache_ttl_secs: 0,
            log_decisions: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),

    #[error("invalid config file")]
    Json(#[from] serde_json::Error),
}

impl GateConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let text = std::fs::read(path)?;
        Ok(serde_json::from_slice(&text)?)
    }
}

/// Static configuration provider.
#[derive(Debug)]
pub struct StaticConfigProvider {
    inner: Arc<GateConfig>,
}

impl StaticConfigProvider {
    /// Creates a new static configuration provider.
    #[must_use]
    pub fn new(config: Arc<GateConfig>) -> Self {
        Self { inner: config }
    }
}

impl Default for StaticConfigProvider {
    fn default() -> Self {
        Self::new(Arc::new(GateConfig::default()))
    }
}

impl GateConfigProvider for StaticConfigProvider {
    fn snapshot(&self) -> Arc<GateConfig> {
        Arc::clone(&self.inner)
    }
}

/// Hot-reload configuration provider.
///
/// Lock-free reads and atomic updates via `ArcSwap`.
#[derive(Debug)]
pub struct HotReloadConfigProvider {
    inner: ArcSwap<GateConfig>,
}

impl HotReloadConfigProvider {
    /// Creates a new hot-reload configuration provider.
    #[must_use]
    pub fn new(config: Arc<GateConfig>) -> Self {
        Self {
            inner: ArcSwap::from(config),
        }
    }

    /// Replaces the entire configuration atomically.
    pub fn update(&self, config: Arc<GateConfig>) {
        self.inner.store(config);
    }
}

impl Default for HotReloadConfigProvider {
    fn default() -> Self {
        Self::new(Arc::new(GateConfig::default()))
    }
}

impl GateConfigProvider for HotReloadConfigProvider {
    fn snapshot(&self) -> Arc<GateConfig> {
        self.inner.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GateConfig::default();
        assert_eq!(config.token_header, "cf-access-jwt-assertion");
        assert_eq!(config.access_document_key, "access-control/config.json");
        assert_eq!(config.exempt_paths, ["/api/server/config"]);
        assert_eq!(config.max_listing_body_size, 16 * 1024 * 1024);
        assert_eq!(config.access_cache_ttl_secs, 0);
        assert!(!config.log_decisions);
    }

    #[test]
    fn test_static_config_provider() {
        let provider = StaticConfigProvider::default();
        let snapshot1 = provider.snapshot();
        let snapshot2 = provider.snapshot();
        assert!(Arc::ptr_eq(&snapshot1, &snapshot2));
    }

    #[test]
    fn test_hot_reload_snapshot_immutable() {
        let provider = HotReloadConfigProvider::default();
        let snapshot = provider.snapshot();

        provider.update(Arc::new(GateConfig {
            access_cache_ttl_secs: 30,
            ..Default::default()
        }));

        assert_eq!(snapshot.access_cache_ttl_secs, 0);
        assert_eq!(provider.snapshot().access_cache_ttl_secs, 30);
    }

    #[test]
    fn test_serde_default_values() {
        let json = r#"{"token_header": "x-identity", "list_paths": ["/api/v2/list"]}"#;
        let config: GateConfig = serde_json::from_str(json).expect("deserialize failed");

        assert_eq!(config.token_header, "x-identity");
        assert_eq!(config.list_paths, ["/api/v2/list"]);
        assert_eq!(config.access_document_key, "access-control/config.json");
        assert_eq!(config.api_prefix, "/api/");
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"log_decisions": true, "access_cache_ttl_secs": 5}"#).unwrap();

        let config = GateConfig::from_json_file(file.path()).unwrap();
        assert!(config.log_decisions);
        assert_eq!(config.access_cache_ttl_secs, 5);

        file.write_all(b"garbage").unwrap();
        assert!(matches!(
            GateConfig::from_json_file(file.path()),
            Err(ConfigLoadError::Json(_))
        ));
    }
}
