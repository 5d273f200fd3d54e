//! Object storage collaborator
//!
//! The gate reads the access control document through [`Storage`]; the operator
//! subcommands also write it and walk the bucket. The browsing service has its own
//! path to the bucket and never goes through this trait.

mod fs;
pub use self::fs::FsStorage;

mod memory;
pub use self::memory::MemoryStorage;

use crate::error::StdError;

use std::collections::BTreeSet;

use bytes::Bytes;
use serde::Serialize;

/// Separator used to group keys into common prefixes.
pub const DELIMITER: char = '/';

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid object key: {0:?}")]
    InvalidKey(String),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("storage backend error")]
    Backend(#[source] StdError),
}

/// One object in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// A delimited listing: objects directly under the prefix, plus the common
/// prefixes ("folders") one level down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListOutput {
    pub objects: Vec<ObjectEntry>,
    pub prefixes: Vec<String>,
}

impl ListOutput {
    /// Groups `(key, size)` pairs under `prefix` by [`DELIMITER`].
    ///
    /// Keys not starting with `prefix` are skipped. Output is sorted by key.
    pub fn delimited<I>(prefix: &str, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let mut objects = Vec::new();
        let mut prefixes = BTreeSet::new();
        for (key, size) in entries {
            let Some(rest) = key.strip_prefix(prefix) else { continue };
            match rest.find(DELIMITER) {
                Some(idx) => {
                    prefixes.insert(key[..prefix.len() + idx + 1].to_owned());
                }
                None => objects.push(ObjectEntry { key, size }),
            }
        }
        let mut out = Self {
            objects,
            prefixes: prefixes.into_iter().collect(),
        };
        out.objects.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

/// Storage backend.
#[async_trait::async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Reads an object. A missing object is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// Creates or replaces an object.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    /// Lists one level under `prefix`.
    async fn list(&self, prefix: &str) -> Result<ListOutput, StorageError>;
}

#[async_trait::async_trait]
impl<T: Storage + ?Sized> Storage for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        T::get(self, key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        T::put(self, key, data).await
    }

    async fn list(&self, prefix: &str) -> Result<ListOutput, StorageError> {
        T::list(self, prefix).await
    }
}

/// Collects every object key under `prefix` by descending into common prefixes.
///
/// # Errors
/// Returns the first storage error encountered.
pub async fn walk(storage: &dyn Storage, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError> {
    let mut objects = Vec::new();
    let mut pending = vec![prefix.to_owned()];
    while let Some(prefix) = pending.pop() {
        let page = storage.list(&prefix).await?;
        objects.extend(page.objects);
        pending.extend(page.prefixes);
    }
    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(keys: &[&str]) -> Vec<(String, u64)> {
        keys.iter().map(|k| ((*k).to_owned(), 1)).collect()
    }

    #[test]
    fn delimited_groups_folders() {
        let out = ListOutput::delimited("", entries(&["a/1.txt", "a/2.txt", "b/c/3.txt", "root.txt"]));
        assert_eq!(out.prefixes, ["a/", "b/"]);
        assert_eq!(out.objects.len(), 1);
        assert_eq!(out.objects[0].key, "root.txt");
    }

    #[test]
    fn delimited_respects_prefix() {
        let out = ListOutput::delimited("b/", entries(&["a/1.txt", "b/c/3.txt", "b/4.txt"]));
        assert_eq!(out.prefixes, ["b/c/"]);
        assert_eq!(out.objects, [ObjectEntry { key: "b/4.txt".into(), size: 1 }]);
    }

    #[tokio::test]
    async fn walk_descends() {
        let storage = MemoryStorage::new();
        for key in ["a/1.txt", "a/x/2.txt", "b/3.txt", "top.txt"] {
            storage.put(key, Bytes::from_static(b"x")).await.unwrap();
        }
        let keys: Vec<_> = walk(&storage, "").await.unwrap().into_iter().map(|o| o.key).collect();
        assert_eq!(keys, ["a/1.txt", "a/x/2.txt", "b/3.txt", "top.txt"]);

        let keys: Vec<_> = walk(&storage, "a/").await.unwrap().into_iter().map(|o| o.key).collect();
        assert_eq!(keys, ["a/1.txt", "a/x/2.txt"]);
    }
}
