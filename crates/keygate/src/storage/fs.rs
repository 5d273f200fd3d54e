use super::{DELIMITER, ListOutput, ObjectEntry, Storage, StorageError};

use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tokio::fs;

/// In-flight writes; never listed.
const TEMP_PREFIX: &str = ".keygate-tmp";

/// Storage backed by a local directory. Object keys map to relative file paths.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// # Errors
    /// Returns an error if `root` is not an existing directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = std::fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(io::Error::new(io::ErrorKind::NotADirectory, "storage root is not a directory"));
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a key to a path under the root, rejecting anything that could escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let invalid = || StorageError::InvalidKey(key.to_owned());
        if key.contains('\0') || key.contains('\\') {
            return Err(invalid());
        }
        if key
            .split(DELIMITER)
            .any(|seg| seg.is_empty() || seg == "." || seg == ".." || seg.starts_with(TEMP_PREFIX))
        {
            return Err(invalid());
        }
        let rel = Path::new(key);
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(invalid());
        }
        Ok(self.root.join(rel))
    }
}

fn ignore_not_found<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(val) => Ok(Some(val)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait::async_trait]
impl Storage for FsStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let path = self.resolve(key)?;
        let data = ignore_not_found(fs::read(&path).await)?;
        Ok(data.map(Bytes::from))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        let parent = path.parent().map_or_else(|| self.root.clone(), Path::to_path_buf);
        fs::create_dir_all(&parent).await?;

        // readers must never observe a half-written file
        let task = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut tmp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(&parent)?;
            tmp.write_all(&data)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        });
        task.await.map_err(|e| StorageError::Backend(Box::new(e)))??;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<ListOutput, StorageError> {
        let dir_part = match prefix.rfind(DELIMITER) {
            Some(idx) => &prefix[..=idx],
            None => "",
        };
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir_part.trim_end_matches(DELIMITER))?
        };

        let mut out = ListOutput::default();
        let Some(mut entries) = ignore_not_found(fs::read_dir(&dir).await)? else { return Ok(out) };

        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else { continue };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let key = format!("{dir_part}{name}");
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                let common = format!("{key}{DELIMITER}");
                if common.starts_with(prefix) {
                    out.prefixes.push(common);
                }
            } else if meta.is_file() && key.starts_with(prefix) {
                out.objects.push(ObjectEntry { key, size: meta.len() });
            }
        }

        out.objects.sort_by(|a, b| a.key.cmp(&b.key));
        out.prefixes.sort();
        Ok(out)
    }
}
