//! Prefix authorization
//!
//! A [`PermissionSet`] is resolved once per request from the access control
//! document and answers two questions:
//!
//! + [`is_allowed`](PermissionSet::is_allowed): may the caller touch this exact key?
//! + [`may_list`](PermissionSet::may_list): is there anything under this prefix the caller may see?
//!
//! Matching is a case-sensitive, byte-wise prefix test. Paths are never normalized.
//!
//! ```
//! use keygate::authz::PermissionSet;
//!
//! let perms = PermissionSet::from_prefixes(["team-a/", "shared/"]);
//! assert!(perms.is_allowed("team-a/report.pdf"));
//! assert!(!perms.is_allowed("team-b/report.pdf"));
//! assert!(perms.may_list(""));
//! assert!(!perms.may_list("team-b/"));
//! ```

/// The grant value meaning "every path".
pub const WILDCARD: &str = "*";

/// Paths an identity may access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionSet {
    /// Unrestricted access.
    All,
    /// Access to paths starting with any of these prefixes. Order is irrelevant.
    Prefixes(Vec<String>),
}

impl PermissionSet {
    #[must_use]
    pub fn none() -> Self {
        Self::Prefixes(Vec::new())
    }

    /// Builds a set from raw grant values. A [`WILDCARD`] anywhere yields [`PermissionSet::All`].
    pub fn from_prefixes<I, S>(grants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut prefixes = Vec::new();
        for grant in grants {
            let grant = grant.into();
            if grant == WILDCARD {
                return Self::All;
            }
            prefixes.push(grant);
        }
        Self::Prefixes(prefixes)
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Returns `true` if no path at all is permitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::All => false,
            Self::Prefixes(prefixes) => prefixes.is_empty(),
        }
    }

    /// Decides whether `path` may be accessed.
    ///
    /// An empty set denies everything; an empty path passes only with an empty-string grant.
    #[must_use]
    pub fn is_allowed(&self, path: &str) -> bool {
        match self {
            Self::All => true,
            Self::Prefixes(prefixes) => prefixes.iter().any(|p| path.starts_with(p.as_str())),
        }
    }

    /// Decides whether a listing of `prefix` could contain anything visible.
    ///
    /// True when `prefix` lies inside a grant, or a grant lies inside `prefix`.
    /// The listing itself must still be filtered entry by entry.
    #[must_use]
    pub fn may_list(&self, prefix: &str) -> bool {
        match self {
            Self::All => true,
            Self::Prefixes(prefixes) => prefixes
                .iter()
                .any(|p| prefix.starts_with(p.as_str()) || p.starts_with(prefix)),
        }
    }
}
