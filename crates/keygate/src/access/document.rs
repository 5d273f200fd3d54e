use crate::authz::{PermissionSet, WILDCARD};

use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum AccessDocumentError {
    /// Not a JSON object of `identity -> [prefix, ...]`.
    #[error("malformed access control document")]
    Malformed(#[from] serde_json::Error),

    #[error("cannot serialize access control document")]
    Serialize(#[source] serde_json::Error),
}

/// The access control document: identity → granted path prefixes.
///
/// ```json
/// {"alice@example.com": ["team-a/", "shared/"], "admin@example.com": ["*"]}
/// ```
///
/// Parsing is strict. Any other shape is rejected rather than guessed at, so a
/// corrupted grant can never widen or silently drop access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessDocument {
    grants: BTreeMap<String, Vec<String>>,
}

impl AccessDocument {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns an error unless `data` is a JSON object whose values are arrays of strings.
    pub fn parse(data: &[u8]) -> Result<Self, AccessDocumentError> {
        let grants = serde_json::from_slice(data)?;
        Ok(Self { grants })
    }

    /// Resolves the permission set of `identity`. Unknown identities get nothing.
    #[must_use]
    pub fn permissions(&self, identity: &str) -> PermissionSet {
        match self.grants.get(identity) {
            Some(prefixes) => PermissionSet::from_prefixes(prefixes.iter().map(String::as_str)),
            None => PermissionSet::none(),
        }
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> + '_ {
        self.grants.keys().map(String::as_str)
    }

    #[must_use]
    pub fn grants_of(&self, identity: &str) -> Option<&[String]> {
        self.grants.get(identity).map(Vec::as_slice)
    }

    /// Adds `prefix` to the grants of `identity`. Returns `false` if it was already there.
    pub fn grant(&mut self, identity: &str, prefix: &str) -> bool {
        let prefixes = self.grants.entry(identity.to_owned()).or_default();
        if prefixes.iter().any(|p| p == prefix) {
            return false;
        }
        prefixes.push(prefix.to_owned());
        true
    }

    /// Removes one grant, or every grant when `prefix` is `None`.
    /// An identity left without grants is removed. Returns whether anything changed.
    pub fn revoke(&mut self, identity: &str, prefix: Option<&str>) -> bool {
        let Some(prefixes) = self.grants.get_mut(identity) else { return false };
        let changed = match prefix {
            Some(prefix) => {
                let before = prefixes.len();
                prefixes.retain(|p| p != prefix);
                prefixes.len() != before
            }
            None => {
                prefixes.clear();
                true
            }
        };
        if prefixes.is_empty() {
            self.grants.remove(identity);
        }
        changed
    }

    /// Returns `true` if `identity` holds the wildcard grant.
    #[must_use]
    pub fn is_admin(&self, identity: &str) -> bool {
        self.grants.get(identity).is_some_and(|p| p.iter().any(|p| p == WILDCARD))
    }

    /// # Errors
    /// Returns an error if the document cannot be serialized.
    pub fn to_json_pretty(&self) -> Result<Vec<u8>, AccessDocumentError> {
        let mut buf = serde_json::to_vec_pretty(&self.grants).map_err(AccessDocumentError::Serialize)?;
        buf.push(b'\n');
        Ok(buf)
    }
}
