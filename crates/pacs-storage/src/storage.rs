//! 影像存储管理
//!
//! 清理子系统只需要物理删除能力；字节读写由入库与检索服务负责。

use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use pacs_core::{PacsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// 物理存储
#[async_trait]
pub trait Storage: Send + Sync {
    fn storage_id(&self) -> &str;

    /// 删除对象；对象已不存在视为成功
    async fn delete_object(&self, path: &str) -> Result<()>;
}

/// 存储类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageKind {
    Local {
        root_path: String,
    },
    S3 {
        bucket: String,
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
    },
    /// 进程内存储，仅用于测试和演示
    Memory,
}

/// 存储描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    pub storage_id: String,
    #[serde(flatten)]
    pub kind: StorageKind,
}

impl StorageDescriptor {
    pub fn open(&self) -> Result<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = match &self.kind {
            StorageKind::Local { root_path } => Arc::new(StorageManager::new(&self.storage_id, root_path)),
            StorageKind::S3 { bucket, region, endpoint } => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(region);
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                let store = builder
                    .build()
                    .map_err(|e| PacsError::Storage(format!("{}: {}", self.storage_id, e)))?;
                Arc::new(ObjectStorage::new(&self.storage_id, Arc::new(store)))
            }
            StorageKind::Memory => Arc::new(ObjectStorage::new(&self.storage_id, Arc::new(InMemory::new()))),
        };
        Ok(storage)
    }
}

/// 本地文件系统存储
#[derive(Debug, Clone)]
pub struct StorageManager {
    storage_id: String,
    base_path: PathBuf,
}

impl StorageManager {
    pub fn new(storage_id: &str, base_path: impl AsRef<Path>) -> Self {
        Self {
            storage_id: storage_id.to_string(),
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// 存储文件
    pub async fn store_file(&self, data: &[u8], path: &str) -> Result<PathBuf> {
        let full_path = self.base_path.join(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&full_path, data).await?;
        Ok(full_path)
    }

    pub async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(self.base_path.join(path)).await.unwrap_or(false)
    }
}

#[async_trait]
impl Storage for StorageManager {
    fn storage_id(&self) -> &str {
        &self.storage_id
    }

    async fn delete_object(&self, path: &str) -> Result<()> {
        let full_path = self.base_path.join(path);
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => {
                debug!(storage_id = %self.storage_id, path, "Deleted file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(storage_id = %self.storage_id, path, "File already absent");
                Ok(())
            }
            Err(e) => Err(PacsError::Storage(format!(
                "{}: 无法删除 {}: {}",
                self.storage_id,
                full_path.display(),
                e
            ))),
        }
    }
}

/// 对象存储
#[derive(Debug, Clone)]
pub struct ObjectStorage {
    storage_id: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStorage {
    pub fn new(storage_id: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            storage_id: storage_id.to_string(),
            store,
        }
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

#[async_trait]
impl Storage for ObjectStorage {
    fn storage_id(&self) -> &str {
        &self.storage_id
    }

    async fn delete_object(&self, path: &str) -> Result<()> {
        match self.store.delete(&ObjectPath::from(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                debug!(storage_id = %self.storage_id, path, "Deleted object");
                Ok(())
            }
            Err(e) => Err(PacsError::Storage(format!("{}: 无法删除 {}: {}", self.storage_id, path, e))),
        }
    }
}

/// 按存储ID查找存储
#[derive(Clone, Default)]
pub struct StorageRegistry {
    storages: HashMap<String, Arc<dyn Storage>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: &[StorageDescriptor]) -> Result<Self> {
        let mut registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor.open()?);
        }
        info!(count = registry.storages.len(), "Storage backends opened");
        Ok(registry)
    }

    pub fn register(&mut self, storage: Arc<dyn Storage>) {
        self.storages.insert(storage.storage_id().to_string(), storage);
    }

    pub fn get(&self, storage_id: &str) -> Result<Arc<dyn Storage>> {
        self.storages
            .get(storage_id)
            .cloned()
            .ok_or_else(|| PacsError::not_found(format!("storage {}", storage_id)))
    }

    pub fn storage_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.storages.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("pacs-storage-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_local_delete() {
        let root = temp_root();
        let storage = StorageManager::new("fs1", &root);
        storage.store_file(b"DICM", "1.2.3/1.2.3.4").await.unwrap();
        assert!(storage.exists("1.2.3/1.2.3.4").await);

        storage.delete_object("1.2.3/1.2.3.4").await.unwrap();
        assert!(!storage.exists("1.2.3/1.2.3.4").await);

        // 已不存在
        storage.delete_object("1.2.3/1.2.3.4").await.unwrap();
        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_delete_failure_is_storage_error() {
        let root = temp_root();
        let storage = StorageManager::new("fs1", &root);
        storage.store_file(b"DICM", "dir/file").await.unwrap();

        // 目录不能用 remove_file 删除
        let err = storage.delete_object("dir").await.unwrap_err();
        assert!(matches!(err, PacsError::Storage(_)));
        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn test_object_storage_delete_missing_is_ok() {
        let storage = StorageDescriptor {
            storage_id: "mem".to_string(),
            kind: StorageKind::Memory,
        }
        .open()
        .unwrap();
        assert_eq!(storage.storage_id(), "mem");
        storage.delete_object("absent/object").await.unwrap();
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = StorageRegistry::new();
        registry.register(Arc::new(StorageManager::new("fs1", "/tmp")));
        assert!(registry.get("fs1").is_ok());
        assert!(matches!(registry.get("fs2"), Err(PacsError::NotFound(_))));
    }
}
