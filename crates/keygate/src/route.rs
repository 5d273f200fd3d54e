//! Request classification and the authorization pre-check
//!
//! Every inbound request is mapped to one [`Operation`] by path:
//!
//! | Path                                   | Operation    | Target                  | Check                |
//! |----------------------------------------|--------------|-------------------------|----------------------|
//! | listed in `exempt_paths`               | `Exempt`     | none                    | none, no token       |
//! | outside `api_prefix`                   | `Asset`      | none                    | identity has grants  |
//! | under one of `list_paths`              | `List`       | `prefix` (default `""`) | `may_list`           |
//! | under one of `metadata_paths`          | `Metadata`   | `prefix` (default `""`) | `is_allowed`         |
//! | any other API path, or a non-read call | `Object`     | `key` (required)        | `is_allowed`         |
//!
//! Only `GET` and `HEAD` can be exempt, listing or metadata calls. A `key` parameter is
//! checked with `is_allowed` whatever the operation, and so is a `prefix` parameter on
//! anything but a listing or metadata call.
//!
//! Paths are classified in canonical form (see [`normalize_path`]), and the request is
//! forwarded with that form, so the gate and the upstream service agree on the endpoint.
//!
//! Anything ambiguous is denied: an unparsable path or query, a target parameter given
//! twice, or a single-object call without `key`.

use crate::authz::PermissionSet;
use crate::config::GateConfig;
use crate::error::GateResult;

use std::fmt;

use hyper::{Method, Uri};

/// What a single-object call does to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectAction {
    Read,
    Write,
    Delete,
    Other,
}

impl ObjectAction {
    #[must_use]
    pub fn from_method(method: &Method) -> Self {
        match *method {
            Method::GET | Method::HEAD => Self::Read,
            Method::PUT | Method::POST | Method::PATCH => Self::Write,
            Method::DELETE => Self::Delete,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Bypasses authentication and authorization.
    Exempt,
    /// UI asset outside the API.
    Asset,
    /// Enumerates entries under `prefix`.
    List { prefix: String },
    /// Bucket-scoped call on `prefix`.
    Metadata { prefix: String },
    /// Call on the single object `key`.
    Object { action: ObjectAction, key: String },
}

/// A classified request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub operation: Operation,
    /// The `key` query parameter, whatever the operation.
    pub key: Option<String>,
    /// The `prefix` query parameter, whatever the operation.
    pub prefix: Option<String>,
}

impl Classified {
    #[must_use]
    pub fn is_exempt(&self) -> bool {
        matches!(self.operation, Operation::Exempt)
    }

    /// Whether the upstream response enumerates entries and must be filtered.
    #[must_use]
    pub fn is_listing(&self) -> bool {
        matches!(self.operation, Operation::List { .. } | Operation::Metadata { .. })
    }

    /// The storage path the request touches, if any.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match &self.operation {
            Operation::Exempt | Operation::Asset => None,
            Operation::List { prefix } | Operation::Metadata { prefix } => Some(prefix),
            Operation::Object { key, .. } => Some(key),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match &self.operation {
            Operation::Exempt => "exempt",
            Operation::Asset => "asset",
            Operation::List { .. } => "list",
            Operation::Metadata { .. } => "metadata",
            Operation::Object { action, .. } => action.as_str(),
        }
    }
}

/// `path` is `endpoint` itself or lies below it.
fn under_endpoint(path: &str, endpoint: &str) -> bool {
    match path.strip_prefix(endpoint) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || endpoint.ends_with('/'),
        None => false,
    }
}

/// `path` is inside the API, including the bare API root. Case is ignored here so that
/// an upstream matching routes case-insensitively never sees an unchecked API call.
fn in_api(path: &str, api_prefix: &str) -> bool {
    let root = api_prefix.trim_end_matches('/');
    path.get(..api_prefix.len()).is_some_and(|p| p.eq_ignore_ascii_case(api_prefix)) || path.eq_ignore_ascii_case(root)
}

/// Returns the single value of `name`, or `None` if absent.
fn query_param(pairs: &[(String, String)], name: &str) -> GateResult<Option<String>> {
    let mut found = None;
    for (k, v) in pairs {
        if k == name {
            if found.is_some() {
                return Err(gate_error!(Forbidden, "query parameter {name:?} given more than once"));
            }
            found = Some(v.clone());
        }
    }
    Ok(found)
}

/// Puts a request path in canonical form: percent-decoded, empty and `.` segments
/// dropped, `..` segments resolved. A trailing slash is kept.
///
/// ```
/// use keygate::route::normalize_path;
///
/// assert_eq!(normalize_path("/assets/../%61pi//upload").unwrap(), "/api/upload");
/// assert_eq!(normalize_path("/ui/./").unwrap(), "/ui/");
/// assert!(normalize_path("/../api").is_err());
/// assert!(normalize_path("/api%2Fupload").is_err());
/// ```
///
/// # Errors
/// Returns `Forbidden` for a relative path, invalid percent-encoding, an encoded `/`,
/// a backslash or control character, or a `..` above the root.
pub fn normalize_path(path: &str) -> GateResult<String> {
    let decoded = urlencoding::decode(path).map_err(|e| gate_error!(e, Forbidden, "path is not valid utf-8"))?;

    if !decoded.starts_with('/') {
        return Err(gate_error!(Forbidden, "path {path:?} is not absolute"));
    }
    if decoded.contains('\\') || decoded.chars().any(char::is_control) {
        return Err(gate_error!(Forbidden, "path {path:?} has a forbidden character"));
    }
    if decoded.matches('/').count() != path.matches('/').count() {
        return Err(gate_error!(Forbidden, "path {path:?} has an encoded separator"));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(gate_error!(Forbidden, "path {path:?} climbs above the root"));
                }
            }
            _ => segments.push(segment),
        }
    }

    let trailing = decoded.ends_with('/') || decoded.ends_with("/.") || decoded.ends_with("/..");
    let mut out = String::with_capacity(decoded.len());
    for segment in &segments {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() || trailing {
        out.push('/');
    }
    Ok(out)
}

/// Rebuilds `uri` with its path in canonical form, percent-encoded again.
/// Returns `None` if the path already is canonical.
///
/// # Errors
/// Returns `Forbidden` if the path cannot be normalized.
pub fn normalize_uri(uri: &Uri) -> GateResult<Option<Uri>> {
    let path = normalize_path(uri.path())?;
    let encoded = path.split('/').map(urlencoding::encode).collect::<Vec<_>>().join("/");
    if encoded == uri.path() {
        return Ok(None);
    }

    let path_and_query = match uri.query() {
        Some(query) => format!("{encoded}?{query}"),
        None => encoded,
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .map_err(|e| gate_error!(e, Forbidden, "cannot rebuild request path"))?,
    );
    let uri = Uri::from_parts(parts).map_err(|e| gate_error!(e, Forbidden, "cannot rebuild request uri"))?;
    Ok(Some(uri))
}

/// Determines the operation of a request.
///
/// # Errors
/// Returns `Forbidden` if the path or query is ambiguous or lacks a required target.
pub fn classify(method: &Method, uri: &Uri, config: &GateConfig) -> GateResult<Classified> {
    let path = normalize_path(uri.path())?;
    let path = path.as_str();
    let reads = matches!(*method, Method::GET | Method::HEAD);

    if reads && config.exempt_paths.iter().any(|p| p == path) {
        return Ok(Classified {
            operation: Operation::Exempt,
            key: None,
            prefix: None,
        });
    }

    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(uri.query().unwrap_or_default())
        .map_err(|e| gate_error!(e, Forbidden, "malformed query string"))?;
    let key = query_param(&pairs, "key")?;
    let prefix = query_param(&pairs, "prefix")?;

    let operation = if !in_api(path, &config.api_prefix) {
        Operation::Asset
    } else if reads && config.list_paths.iter().any(|p| under_endpoint(path, p)) {
        Operation::List {
            prefix: prefix.clone().unwrap_or_default(),
        }
    } else if reads && config.metadata_paths.iter().any(|p| under_endpoint(path, p)) {
        Operation::Metadata {
            prefix: prefix.clone().unwrap_or_default(),
        }
    } else {
        let Some(key) = key.clone() else {
            return Err(gate_error!(Forbidden, "{method} {path} without key"));
        };
        Operation::Object {
            action: ObjectAction::from_method(method),
            key,
        }
    };

    Ok(Classified { operation, key, prefix })
}

/// Outcome of the pre-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(String),
}

impl Decision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Deny(reason) => write!(f, "deny: {reason}"),
        }
    }
}

/// Decides whether a classified request may reach the upstream service.
///
/// For listings this only tells whether anything under the prefix could be visible;
/// the response still has to be filtered.
#[must_use]
pub fn authorize_request(req: &Classified, perms: &PermissionSet) -> Decision {
    let decision = authorize_operation(&req.operation, perms);
    if !decision.is_allowed() {
        return decision;
    }
    if let Some(key) = &req.key
        && !perms.is_allowed(key)
    {
        return Decision::Deny(format!("key {key:?} not permitted"));
    }
    if !req.is_listing()
        && let Some(prefix) = &req.prefix
        && !perms.is_allowed(prefix)
    {
        return Decision::Deny(format!("prefix {prefix:?} not permitted"));
    }
    decision
}

fn authorize_operation(operation: &Operation, perms: &PermissionSet) -> Decision {
    match operation {
        Operation::Exempt => Decision::Allow,
        Operation::Asset => {
            if perms.is_empty() {
                Decision::Deny("identity has no grants".to_owned())
            } else {
                Decision::Allow
            }
        }
        Operation::List { prefix } => {
            if perms.may_list(prefix) {
                Decision::Allow
            } else {
                Decision::Deny(format!("nothing visible under prefix {prefix:?}"))
            }
        }
        Operation::Metadata { prefix } => {
            if perms.is_allowed(prefix) {
                Decision::Allow
            } else {
                Decision::Deny(format!("prefix {prefix:?} not permitted"))
            }
        }
        Operation::Object { key, action } => {
            if perms.is_allowed(key) {
                Decision::Allow
            } else {
                Decision::Deny(format!("{} of key {key:?} not permitted", action.as_str()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::GateErrorCode;

    fn classify_str(method: Method, uri: &str) -> GateResult<Classified> {
        classify(&method, &uri.parse().unwrap(), &GateConfig::default())
    }

    fn op(method: Method, uri: &str) -> Operation {
        classify_str(method, uri).unwrap().operation
    }

    #[test]
    fn classifies_endpoint_families() {
        assert_eq!(op(Method::GET, "/api/server/config"), Operation::Exempt);
        assert_eq!(op(Method::GET, "/"), Operation::Asset);
        assert_eq!(op(Method::GET, "/assets/index.js?key=b/2.txt"), Operation::Asset);
        assert_eq!(
            op(Method::GET, "/api/list?prefix=a%2F"),
            Operation::List { prefix: "a/".into() }
        );
        assert_eq!(op(Method::GET, "/api/list"), Operation::List { prefix: String::new() });
        assert_eq!(
            op(Method::GET, "/api/buckets/main?prefix=a/x"),
            Operation::Metadata { prefix: "a/x".into() }
        );
        assert_eq!(
            op(Method::PUT, "/api/upload?key=b/2.txt"),
            Operation::Object {
                action: ObjectAction::Write,
                key: "b/2.txt".into()
            }
        );
        assert_eq!(
            op(Method::DELETE, "/api/delete?key=a/1.txt"),
            Operation::Object {
                action: ObjectAction::Delete,
                key: "a/1.txt".into()
            }
        );
    }

    #[test]
    fn exempt_match_is_exact() {
        assert!(matches!(op(Method::GET, "/api/server/config/x?key=k"), Operation::Object { .. }));
        assert!(classify_str(Method::GET, "/api/server/configs").is_err());
    }

    #[test]
    fn endpoint_match_respects_segments() {
        assert!(matches!(op(Method::GET, "/api/list/more"), Operation::List { .. }));
        assert!(matches!(op(Method::GET, "/api/listing?key=a/1"), Operation::Object { .. }));
    }

    #[test]
    fn missing_key_is_denied() {
        let err = classify_str(Method::GET, "/api/download").unwrap_err();
        assert_eq!(err.code(), GateErrorCode::Forbidden);
    }

    #[test]
    fn duplicated_target_is_denied() {
        let err = classify_str(Method::GET, "/api/download?key=a/1&key=b/2").unwrap_err();
        assert_eq!(err.code(), GateErrorCode::Forbidden);
        let err = classify_str(Method::GET, "/api/list?prefix=a/&prefix=").unwrap_err();
        assert_eq!(err.code(), GateErrorCode::Forbidden);
        assert!(classify_str(Method::GET, "/api/download?key=a/1&other=1&other=2").is_ok());
    }

    #[test]
    fn decisions() {
        let perms = PermissionSet::from_prefixes(["a/"]);
        let decide = |method, uri| authorize_request(&classify_str(method, uri).unwrap(), &perms);

        assert!(decide(Method::GET, "/api/list?prefix=a/").is_allowed());
        assert!(decide(Method::GET, "/api/list").is_allowed());
        assert!(!decide(Method::GET, "/api/list?prefix=b/").is_allowed());
        assert!(decide(Method::GET, "/api/buckets/main?prefix=a/x").is_allowed());
        assert!(!decide(Method::GET, "/api/buckets/main").is_allowed());
        assert!(decide(Method::GET, "/api/download?key=a/1.txt").is_allowed());
        assert!(!decide(Method::PUT, "/api/upload?key=b/2.txt").is_allowed());
        assert!(decide(Method::GET, "/index.html").is_allowed());
        assert!(decide(Method::GET, "/api/server/config").is_allowed());
    }

    #[test]
    fn assets_need_grants() {
        let classified = classify_str(Method::GET, "/index.html").unwrap();
        assert!(!authorize_request(&classified, &PermissionSet::none()).is_allowed());
        assert!(authorize_request(&classified, &PermissionSet::All).is_allowed());
    }

    #[test]
    fn exemption_is_read_only() {
        assert_eq!(op(Method::HEAD, "/api/server/config"), Operation::Exempt);
        let err = classify_str(Method::PUT, "/api/server/config").unwrap_err();
        assert_eq!(err.code(), GateErrorCode::Forbidden);
        assert!(matches!(
            op(Method::DELETE, "/api/server/config?key=a/1"),
            Operation::Object {
                action: ObjectAction::Delete,
                ..
            }
        ));
    }

    #[test]
    fn only_reads_list() {
        assert_eq!(
            op(Method::PUT, "/api/buckets/main?prefix=a/&key=b/2.txt"),
            Operation::Object {
                action: ObjectAction::Write,
                key: "b/2.txt".into()
            }
        );
        assert_eq!(
            op(Method::DELETE, "/api/list?prefix=a/&key=b/2.txt"),
            Operation::Object {
                action: ObjectAction::Delete,
                key: "b/2.txt".into()
            }
        );
        assert!(classify_str(Method::POST, "/api/list?prefix=a/").is_err());
    }

    #[test]
    fn stray_targets_are_checked() {
        let perms = PermissionSet::from_prefixes(["a/"]);
        let decide = |method, uri| authorize_request(&classify_str(method, uri).unwrap(), &perms);

        assert!(!decide(Method::GET, "/api/list?prefix=a/&key=b/2.txt").is_allowed());
        assert!(decide(Method::GET, "/api/list?prefix=a/&key=a/2.txt").is_allowed());
        assert!(!decide(Method::GET, "/api/buckets/main?prefix=a/&key=b/2.txt").is_allowed());
        assert!(!decide(Method::GET, "/assets/app.js?key=b/2.txt").is_allowed());
        assert!(!decide(Method::DELETE, "/api/delete?key=a/1.txt&prefix=b/").is_allowed());
        assert!(decide(Method::DELETE, "/api/delete?key=a/1.txt&prefix=a/").is_allowed());
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("//").unwrap(), "/");
        assert_eq!(normalize_path("/api/list").unwrap(), "/api/list");
        assert_eq!(normalize_path("/assets/../api/upload").unwrap(), "/api/upload");
        assert_eq!(normalize_path("//api//upload").unwrap(), "/api/upload");
        assert_eq!(normalize_path("/%61pi/upload").unwrap(), "/api/upload");
        assert_eq!(normalize_path("/./api/./list/").unwrap(), "/api/list/");
        assert_eq!(normalize_path("/a/b/..").unwrap(), "/a/");
        assert_eq!(normalize_path("/files/a%20b").unwrap(), "/files/a b");

        for bad in ["/..", "/a/../../api", "/api%2Fupload", "/api%2fupload", "/api%5Cupload", "/a%00b", "/%ff", "*"] {
            let err = normalize_path(bad).unwrap_err();
            assert_eq!(err.code(), GateErrorCode::Forbidden, "{bad:?}");
        }
    }

    #[test]
    fn normalize_uri_keeps_query() {
        let uri: Uri = "/assets/../api//upload?key=a%2F2.txt".parse().unwrap();
        let uri = normalize_uri(&uri).unwrap().unwrap();
        assert_eq!(uri.to_string(), "/api/upload?key=a%2F2.txt");

        let uri: Uri = "/files/a%20b?x=1".parse().unwrap();
        assert!(normalize_uri(&uri).unwrap().is_none());
    }

    #[test]
    fn path_tricks_reach_the_api() {
        for uri in [
            "/assets/../api/upload?key=b/2.txt",
            "/%61pi/upload?key=b/2.txt",
            "//api/upload?key=b/2.txt",
            "/api?key=b/2.txt",
            "/API/upload?key=b/2.txt",
        ] {
            assert!(matches!(op(Method::PUT, uri), Operation::Object { .. }), "{uri}");
        }
        assert!(classify_str(Method::PUT, "/api%2Fupload?key=b/2.txt").is_err());
    }

    #[test]
    fn listing_kinds() {
        assert!(classify_str(Method::GET, "/api/list").unwrap().is_listing());
        assert!(classify_str(Method::GET, "/api/buckets/x").unwrap().is_listing());
        let c = classify_str(Method::HEAD, "/api/file?key=a/1").unwrap();
        assert!(!c.is_listing());
        assert_eq!(c.kind(), "read");
        assert_eq!(c.target(), Some("a/1"));
    }
}
