//! Filesystem blob storage: one JSON file per record.
//!
//! Layout is `<base>/<namespace>/<key>.json`. Namespace and key are
//! percent-encoded (dots included) so keys such as `workflow:<id>:step:0`,
//! `logs/17` or `..` map to a single flat file name on every platform.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use taskflow_core::traits::{BlobStorage, StorageError};
use uuid::Uuid;

const RECORD_EXTENSION: &str = "json";

/// Filesystem storage rooted at a base directory.
#[derive(Debug, Clone)]
pub struct FsBlobStorage {
    base: PathBuf,
}

impl FsBlobStorage {
    /// Open (and create if needed) storage rooted at `base`.
    ///
    /// # Errors
    /// Returns error if the base directory cannot be created.
    pub async fn open(base: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base = base.into();
        tokio::fs::create_dir_all(&base).await?;
        tracing::debug!(path = %base.display(), "opened filesystem storage");
        Ok(Self { base })
    }

    /// Base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.base.join(encode_component(namespace))
    }

    fn record_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.{RECORD_EXTENSION}", encode_component(key)))
    }
}

#[async_trait]
impl BlobStorage for FsBlobStorage {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.record_path(namespace, key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let dir = self.namespace_dir(namespace);
        tokio::fs::create_dir_all(&dir).await?;

        // Each writer stages into its own sibling temp file so readers never
        // see a torn record and the last rename wins.
        let path = self.record_path(namespace, key);
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, value).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        match tokio::fs::remove_file(self.record_path(namespace, key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let mut entries = match tokio::fs::read_dir(self.namespace_dir(namespace)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            keys.push(decode_component(stem)?);
        }
        keys.sort();

        Ok(keys)
    }

    async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = tokio::fs::read_dir(&self.base).await?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(raw) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let namespace = decode_component(&raw)?;
            if !self.list(&namespace).await?.is_empty() {
                names.push(namespace);
            }
        }
        names.sort();

        Ok(names)
    }
}

/// Percent-encode a namespace or key into one file name component.
///
/// `.` is escaped too, so no component can be `..`, hidden, or carry a
/// `.tmp`/`.json` suffix of its own.
fn encode_component(raw: &str) -> String {
    urlencoding::encode(raw).replace('.', "%2E")
}

/// Inverse of [`encode_component`]; rejects anything it would not produce.
fn decode_component(encoded: &str) -> Result<String, StorageError> {
    let invalid = || StorageError::InvalidName(encoded.to_string());
    let decoded = urlencoding::decode(encoded).map_err(|_| invalid())?.into_owned();
    if encode_component(&decoded) != encoded {
        return Err(invalid());
    }
    Ok(decoded)
}
