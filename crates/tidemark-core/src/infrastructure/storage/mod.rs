mod memory;

use std::path::{
    Component,
    Path,
    PathBuf,
};

use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
pub use memory::MemoryObjectSink;
use serde::{
    Deserialize,
    Serialize,
};
use tokio::fs;

use crate::domain::{
    DomainError,
    DomainResult,
    ManifestEntry,
};

pub(crate) const MANIFEST_SUFFIX: &str = ".manifest.json";

const TEMP_MARKER: &str = ".tmp-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Partitioned object store backing every tier
///
/// A write replaces any existing object under the same key together with its
/// manifest, so re-writing a partition never duplicates data.
#[async_trait]
pub trait ObjectSink: Send + Sync {
    fn backend_type(&self) -> &str;

    async fn write(
        &self, key: &str, payload: &[u8], manifest: &ManifestEntry,
    ) -> DomainResult<ObjectMetadata>;

    async fn read(&self, key: &str) -> DomainResult<Option<Vec<u8>>>;

    async fn read_manifest(&self, key: &str) -> DomainResult<Option<ManifestEntry>>;

    /// Objects whose key starts with `prefix`, sorted by key; manifests are
    /// not listed
    async fn list(&self, prefix: &str) -> DomainResult<Vec<ObjectMetadata>>;

    async fn delete(&self, key: &str) -> DomainResult<()>;

    async fn exists(&self, key: &str) -> DomainResult<bool> {
        Ok(self.read_manifest(key).await?.is_some())
    }
}

pub struct LocalObjectSink {
    base_path: PathBuf,
}

impl LocalObjectSink {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn default_location() -> DomainResult<Self> {
        let base_path = std::env::var("TIDEMARK_DATA_DIR")
            .map(|p| PathBuf::from(p).join("objects"))
            .or_else(|_| {
                dirs::data_dir()
                    .map(|p| p.join("tidemark").join("objects"))
                    .ok_or_else(|| {
                        DomainError::InternalError(
                            "Could not determine data directory".to_string(),
                        )
                    })
            })?;

        Ok(Self::new(base_path))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> DomainResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(DomainError::StorageError(format!(
                "Invalid object key: {}",
                key
            )));
        }
        Ok(self.base_path.join(relative))
    }

    fn manifest_path(&self, key: &str) -> DomainResult<PathBuf> {
        self.full_path(&format!("{}{}", key, MANIFEST_SUFFIX))
    }

    /// Writes `data` next to `path` and renames it into place
    async fn write_atomic(path: &Path, data: &[u8]) -> DomainResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DomainError::WriteFailed(format!("Failed to create dir: {}", e)))?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(
            "{}{}{}",
            file_name,
            TEMP_MARKER,
            uuid::Uuid::new_v4().simple()
        ));

        fs::write(&temp_path, data)
            .await
            .map_err(|e| DomainError::WriteFailed(format!("Failed to write file: {}", e)))?;

        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(DomainError::WriteFailed(format!(
                "Failed to move {} into place: {}",
                path.display(),
                e
            )));
        }

        Ok(())
    }

    async fn read_optional(path: &Path) -> DomainResult<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DomainError::StorageError(format!(
                "Failed to read file: {}",
                e
            ))),
        }
    }

    fn is_object_key(key: &str) -> bool {
        !key.ends_with(MANIFEST_SUFFIX) && !key.contains(TEMP_MARKER)
    }
}

#[async_trait]
impl ObjectSink for LocalObjectSink {
    fn backend_type(&self) -> &str {
        "local"
    }

    async fn write(
        &self, key: &str, payload: &[u8], manifest: &ManifestEntry,
    ) -> DomainResult<ObjectMetadata> {
        let path = self.full_path(key)?;
        let manifest_bytes = serde_json::to_vec_pretty(manifest)?;

        Self::write_atomic(&path, payload).await?;
        Self::write_atomic(&self.manifest_path(key)?, &manifest_bytes).await?;

        tracing::debug!(key = %key, bytes = payload.len(), "Object written");

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: payload.len() as u64,
            last_modified: Utc::now(),
        })
    }

    async fn read(&self, key: &str) -> DomainResult<Option<Vec<u8>>> {
        Self::read_optional(&self.full_path(key)?).await
    }

    async fn read_manifest(&self, key: &str) -> DomainResult<Option<ManifestEntry>> {
        match Self::read_optional(&self.manifest_path(key)?).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, prefix: &str) -> DomainResult<Vec<ObjectMetadata>> {
        // Walk from the deepest directory the prefix names
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.base_path.clone()
        } else {
            self.full_path(dir_part)?
        };

        if fs::metadata(&start).await.is_err() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(|e| {
                DomainError::StorageError(format!("Failed to read directory: {}", e))
            })?;

            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                DomainError::StorageError(format!("Failed to read entry: {}", e))
            })? {
                let metadata = entry.metadata().await.map_err(|e| {
                    DomainError::StorageError(format!("Failed to read metadata: {}", e))
                })?;

                if metadata.is_dir() {
                    pending.push(entry.path());
                    continue;
                }

                let path = entry.path();
                let Ok(relative) = path.strip_prefix(&self.base_path) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if !key.starts_with(prefix) || !Self::is_object_key(&key) {
                    continue;
                }

                let last_modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                results.push(ObjectMetadata {
                    key,
                    size: metadata.len(),
                    last_modified,
                });
            }
        }

        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }

    async fn delete(&self, key: &str) -> DomainResult<()> {
        for path in [self.full_path(key)?, self.manifest_path(key)?] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(DomainError::StorageError(format!(
                        "Failed to delete file: {}",
                        e
                    )))
                }
            }
        }
        Ok(())
    }
}
