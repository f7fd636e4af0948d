//! 编码缓存

use async_trait::async_trait;
use pacs_core::models::{Code, CodeEntity};
use pacs_core::Result;
use pacs_database::ArchiveTx;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// 把拒绝原因代码解析为稳定的数据库引用
#[async_trait]
pub trait CodeCache: Send + Sync {
    async fn find_or_create(&self, tx: &mut dyn ArchiveTx, code: &Code) -> Result<CodeEntity>;
}

/// 以 (代码值, 编码方案) 为键的进程内缓存
#[derive(Debug, Default)]
pub struct StoreCodeCache {
    entries: RwLock<HashMap<(String, String), CodeEntity>>,
}

impl StoreCodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 工作单元回滚后缓存中可能留有未提交的主键
    pub async fn invalidate(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl CodeCache for StoreCodeCache {
    async fn find_or_create(&self, tx: &mut dyn ArchiveTx, code: &Code) -> Result<CodeEntity> {
        let key = (code.value.clone(), code.designator.clone());
        if let Some(entity) = self.entries.read().await.get(&key) {
            return Ok(entity.clone());
        }
        let entity = tx.find_or_create_code(code).await?;
        self.entries.write().await.insert(key, entity.clone());
        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_database::{ArchiveStore, MemoryArchiveStore};

    #[tokio::test]
    async fn test_same_code_resolves_to_same_entity() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let cache = StoreCodeCache::new();

        let code = Code::new("113001", "DCM", "Rejected for Quality Reasons");
        let first = cache.find_or_create(tx.as_mut(), &code).await.unwrap();
        let second = cache
            .find_or_create(tx.as_mut(), &Code::new("113001", "DCM", "other meaning"))
            .await
            .unwrap();
        assert_eq!(first.pk, second.pk);

        let other = cache
            .find_or_create(tx.as_mut(), &Code::new("113039", "DCM", "Data Retention Policy Expired"))
            .await
            .unwrap();
        assert_ne!(first.pk, other.pk);
    }
}
