use std::collections::BTreeMap;
use std::sync::atomic::{
    AtomicU32,
    Ordering,
};

use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use tokio::sync::RwLock;

use super::{
    ObjectMetadata,
    ObjectSink,
};
use crate::domain::{
    DomainError,
    DomainResult,
    ManifestEntry,
};

struct StoredObject {
    payload: Vec<u8>,
    manifest: ManifestEntry,
    written_at: DateTime<Utc>,
}

/// In-process object sink for tests and embedded runs
#[derive(Default)]
pub struct MemoryObjectSink {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    failing_writes: AtomicU32,
    writes: AtomicU32,
}

impl MemoryObjectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with `WriteFailed`
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes since creation
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Replaces an object's bytes without touching its manifest
    pub async fn corrupt(&self, key: &str, payload: Vec<u8>) -> bool {
        match self.objects.write().await.get_mut(key) {
            Some(object) => {
                object.payload = payload;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ObjectSink for MemoryObjectSink {
    fn backend_type(&self) -> &str {
        "memory"
    }

    async fn write(
        &self, key: &str, payload: &[u8], manifest: &ManifestEntry,
    ) -> DomainResult<ObjectMetadata> {
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(DomainError::WriteFailed(format!(
                "Sink unavailable while writing {}",
                key
            )));
        }

        let written_at = Utc::now();
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                payload: payload.to_vec(),
                manifest: manifest.clone(),
                written_at,
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: payload.len() as u64,
            last_modified: written_at,
        })
    }

    async fn read(&self, key: &str) -> DomainResult<Option<Vec<u8>>> {
        Ok(self
            .objects
            .read()
            .await
            .get(key)
            .map(|o| o.payload.clone()))
    }

    async fn read_manifest(&self, key: &str) -> DomainResult<Option<ManifestEntry>> {
        Ok(self
            .objects
            .read()
            .await
            .get(key)
            .map(|o| o.manifest.clone()))
    }

    async fn list(&self, prefix: &str) -> DomainResult<Vec<ObjectMetadata>> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectMetadata {
                key: key.clone(),
                size: object.payload.len() as u64,
                last_modified: object.written_at,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> DomainResult<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tier;

    fn manifest(key: &str) -> ManifestEntry {
        ManifestEntry {
            tier: Tier::Cleaned,
            partition_key: key.to_string(),
            source_id: "orders".to_string(),
            row_count: 0,
            byte_size: 0,
            checksum: String::new(),
            expected_count: None,
            window_start: None,
            window_end: None,
            written_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_prefix_listing() {
        let sink = MemoryObjectSink::new();
        for key in ["cleaned/a/2024-01-01.jsonl", "cleaned/b/2024-01-01.jsonl", "raw/a/x"] {
            sink.write(key, b"", &manifest(key)).await.unwrap();
        }

        let listed = sink.list("cleaned/a/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "cleaned/a/2024-01-01.jsonl");
    }

    #[tokio::test]
    async fn test_injected_write_failures() {
        let sink = MemoryObjectSink::new();
        sink.fail_next_writes(2);

        let key = "raw/a/x";
        assert!(matches!(
            sink.write(key, b"1", &manifest(key)).await,
            Err(DomainError::WriteFailed(_))
        ));
        assert!(sink.write(key, b"1", &manifest(key)).await.is_err());
        assert!(sink.write(key, b"1", &manifest(key)).await.is_ok());
        assert_eq!(sink.write_count(), 1);
    }
}
