//! 存储回收
//!
//! 物理删除在工作单元之外进行，确认结果后再在一个工作单元内删除存储位置行或
//! 标记为 `FAILED_TO_DELETE`。单个对象删除失败不影响同一批次的其它对象。

use crate::context::{DeletionOutcome, StudyDeleteContext};
use crate::engine::DeletionService;
use pacs_core::models::{Location, LocationStatus};
use pacs_core::{PacsError, Result};
use pacs_database::ArchiveStore;
use pacs_storage::StorageRegistry;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 一次回收的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub deleted: usize,
    pub failed: usize,
}

impl PurgeReport {
    fn add(&mut self, other: PurgeReport) {
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

/// 一轮回收的汇总
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReport {
    pub retried: usize,
    pub purge: PurgeReport,
}

/// 存储回收
pub struct StorageReclaimer {
    service: Arc<DeletionService>,
    store: Arc<dyn ArchiveStore>,
    storages: StorageRegistry,
    batch_size: usize,
    retry_failed: bool,
}

impl StorageReclaimer {
    pub fn new(
        service: Arc<DeletionService>,
        store: Arc<dyn ArchiveStore>,
        storages: StorageRegistry,
        batch_size: usize,
    ) -> Self {
        Self {
            service,
            store,
            storages,
            batch_size,
            retry_failed: true,
        }
    }

    /// 每轮开始时是否先把 `FAILED_TO_DELETE` 放回待删除
    pub fn retry_failed_on_run(mut self, enabled: bool) -> Self {
        self.retry_failed = enabled;
        self
    }

    /// 对全部已注册的存储执行一轮回收
    pub async fn run(&self) -> Result<ReclaimReport> {
        let mut report = ReclaimReport::default();
        for storage_id in self.storages.storage_ids() {
            if self.retry_failed {
                report.retried += self.retry_failed(&storage_id).await?;
            }
            report.purge.add(self.purge(&storage_id).await?);
        }
        Ok(report)
    }

    /// 删除一批 `TO_DELETE` 存储位置的物理对象
    pub async fn purge(&self, storage_id: &str) -> Result<PurgeReport> {
        let storage = self.storages.get(storage_id)?;

        let locations = {
            let mut tx = self.store.begin().await?;
            let locations = self
                .service
                .find_locations_to_delete(tx.as_mut(), storage_id, self.batch_size)
                .await?;
            tx.rollback().await?;
            locations
        };
        if locations.is_empty() {
            return Ok(PurgeReport::default());
        }

        let mut deleted: Vec<&Location> = Vec::with_capacity(locations.len());
        let mut failed: Vec<&Location> = Vec::new();
        for location in &locations {
            match storage.delete_object(&location.storage_path).await {
                Ok(()) => deleted.push(location),
                Err(e) => {
                    warn!(storage_id, path = %location.storage_path, error = %e, "Failed to delete object");
                    failed.push(location);
                }
            }
        }

        // 行可能已被其它工作者删除，只跳过该存储位置
        let mut report = PurgeReport::default();
        let mut tx = self.store.begin().await?;
        for location in deleted {
            match self.service.remove_location_row(tx.as_mut(), location).await {
                Ok(()) => report.deleted += 1,
                Err(PacsError::NotFound(what)) => debug!(what = %what, "Location row already removed"),
                Err(e) => return Err(e),
            }
        }
        for location in failed {
            match self.service.mark_failed_to_delete(tx.as_mut(), location).await {
                Ok(()) => report.failed += 1,
                Err(PacsError::NotFound(what)) => debug!(what = %what, "Location row already removed"),
                Err(e) => return Err(e),
            }
        }
        tx.commit().await?;

        if let Some(metrics) = self.service.metrics() {
            metrics.record_purge(report.deleted, report.failed);
        }
        info!(storage_id, deleted = report.deleted, failed = report.failed, "Purged storage objects");
        Ok(report)
    }

    /// 把删除失败的存储位置重新放回待删除
    pub async fn retry_failed(&self, storage_id: &str) -> Result<usize> {
        let mut tx = self.store.begin().await?;
        let locations = tx
            .find_locations_by_storage_and_status(storage_id, LocationStatus::FailedToDelete, self.batch_size)
            .await?;
        for location in &locations {
            tx.update_location_status(location.pk, LocationStatus::ToDelete).await?;
        }
        tx.commit().await?;
        if !locations.is_empty() {
            debug!(storage_id, count = locations.len(), "Rescheduled failed deletions");
        }
        Ok(locations.len())
    }

    /// 删除存储上最久未访问的检查，每个检查一个工作单元
    pub async fn delete_studies(&self, storage_id: &str) -> Result<DeletionOutcome> {
        let study_pks = {
            let mut tx = self.store.begin().await?;
            let pks = self
                .service
                .find_studies_for_deletion_on_storage(tx.as_mut(), storage_id, self.batch_size)
                .await?;
            tx.rollback().await?;
            pks
        };

        let mut total = DeletionOutcome::default();
        for study_pk in study_pks {
            let mut tx = self.store.begin().await?;
            let mut ctx = StudyDeleteContext::new(study_pk);
            match self.service.remove_study_on_storage(tx.as_mut(), &mut ctx).await {
                Ok(outcome) => {
                    tx.commit().await?;
                    self.service.publish(&outcome);
                    total.merge(outcome);
                }
                Err(PacsError::NotFound(what)) => {
                    debug!(study_pk, what = %what, "Study already removed");
                }
                Err(e) if e.is_retryable() => {
                    warn!(study_pk, error = %e, "Concurrent modification, study left for next run");
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            storage_id,
            studies = total.removed_studies.len(),
            instances = total.removed_instances,
            "Deleted studies on storage"
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditEmitter;
    use crate::code::StoreCodeCache;
    use crate::context::{DeletionSettings, StudyDeleteMode};
    use crate::metrics::DeletionMetrics;
    use crate::patient::ArchivePatientService;
    use async_trait::async_trait;
    use pacs_database::fixtures::TreeBuilder;
    use pacs_core::models::Pk;
    use pacs_database::MemoryArchiveStore;
    use pacs_storage::Storage;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// 对指定路径返回错误的存储
    struct FlakyStorage {
        failing: Mutex<HashSet<String>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        fn storage_id(&self) -> &str {
            "fs1"
        }

        async fn delete_object(&self, path: &str) -> Result<()> {
            if self.failing.lock().unwrap().contains(path) {
                return Err(PacsError::Storage(format!("disk error: {}", path)));
            }
            self.deleted.lock().unwrap().push(path.to_string());
            Ok(())
        }
    }

    fn service() -> Arc<DeletionService> {
        Arc::new(
            DeletionService::new(
                DeletionSettings::default(),
                Arc::new(ArchivePatientService),
                Arc::new(StoreCodeCache::new()),
                Arc::new(MemoryAuditEmitter::new()),
            )
            .with_metrics(DeletionMetrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_failed_object_is_kept_for_retry() {
        let store = Arc::new(MemoryArchiveStore::new());
        let service = service();
        let mut tx = store.begin().await.unwrap();
        let tree = TreeBuilder::new(tx.as_mut(), "fs1").study_tree("P1", &[2]).await.unwrap();
        let locations = tree.locations();
        service
            .delete_locations(tx.as_mut(), &locations, StudyDeleteMode::Off)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let flaky = Arc::new(FlakyStorage {
            failing: Mutex::new(HashSet::from([locations[0].storage_path.clone()])),
            deleted: Mutex::new(Vec::new()),
        });
        let mut registry = StorageRegistry::new();
        registry.register(flaky.clone());
        let reclaimer = StorageReclaimer::new(service.clone(), store.clone(), registry, 10);

        let report = reclaimer.purge("fs1").await.unwrap();
        assert_eq!(report, PurgeReport { deleted: 1, failed: 1 });
        assert_eq!(*flaky.deleted.lock().unwrap(), vec![locations[1].storage_path.clone()]);
        assert_eq!(service.metrics().unwrap().failed_locations(), 1);

        let mut tx = store.begin().await.unwrap();
        let failed = tx.get_location(locations[0].pk).await.unwrap().unwrap();
        assert_eq!(failed.status, LocationStatus::FailedToDelete);
        assert!(tx.get_location(locations[1].pk).await.unwrap().is_none());
        drop(tx);

        // 存储恢复后重试
        flaky.failing.lock().unwrap().clear();
        let report = reclaimer.run().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.purge, PurgeReport { deleted: 1, failed: 0 });

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_location(locations[0].pk).await.unwrap().is_none());
    }

    /// 删除对象时另一个工作者恰好删掉了某个存储位置行
    struct RacingStorage {
        store: MemoryArchiveStore,
        failing_path: String,
        vanishing: Pk,
    }

    #[async_trait]
    impl Storage for RacingStorage {
        fn storage_id(&self) -> &str {
            "fs1"
        }

        async fn delete_object(&self, path: &str) -> Result<()> {
            if path != self.failing_path {
                return Ok(());
            }
            let mut tx = self.store.begin().await?;
            tx.delete_location(self.vanishing).await?;
            tx.commit().await?;
            Err(PacsError::Storage(format!("disk error: {}", path)))
        }
    }

    #[tokio::test]
    async fn test_vanished_row_does_not_undo_failure_marks() {
        let store = MemoryArchiveStore::new();
        let service = service();
        let mut tx = store.begin().await.unwrap();
        let tree = TreeBuilder::new(tx.as_mut(), "fs1").study_tree("P1", &[2]).await.unwrap();
        let locations = tree.locations();
        service
            .delete_locations(tx.as_mut(), &locations, StudyDeleteMode::Off)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut registry = StorageRegistry::new();
        registry.register(Arc::new(RacingStorage {
            store: store.clone(),
            failing_path: locations[0].storage_path.clone(),
            vanishing: locations[1].pk,
        }));
        let reclaimer = StorageReclaimer::new(service, Arc::new(store.clone()), registry, 10);

        let report = reclaimer.purge("fs1").await.unwrap();
        assert_eq!(report, PurgeReport { deleted: 0, failed: 1 });

        let mut tx = store.begin().await.unwrap();
        let failed = tx.get_location(locations[0].pk).await.unwrap().unwrap();
        assert_eq!(failed.status, LocationStatus::FailedToDelete);
        assert!(tx.get_location(locations[1].pk).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_storage() {
        let store = Arc::new(MemoryArchiveStore::new());
        let reclaimer = StorageReclaimer::new(service(), store, StorageRegistry::new(), 10);
        assert!(matches!(reclaimer.purge("nope").await, Err(PacsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_studies_on_storage() {
        let store = Arc::new(MemoryArchiveStore::new());
        let mut tx = store.begin().await.unwrap();
        let mut builder = TreeBuilder::new(tx.as_mut(), "fs1");
        let first = builder.study_tree("P1", &[1, 2]).await.unwrap();
        let second = builder.study_tree("P2", &[1]).await.unwrap();
        tx.commit().await.unwrap();

        let reclaimer = StorageReclaimer::new(service(), store.clone(), StorageRegistry::new(), 10);
        let outcome = reclaimer.delete_studies("fs1").await.unwrap();
        assert_eq!(outcome.removed_instances, 4);
        assert_eq!(outcome.removed_studies.len(), 2);
        assert_eq!(outcome.deleted_patients.len(), 2);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_study(first.study_pk).await.unwrap().is_none());
        assert!(tx.get_study(second.study_pk).await.unwrap().is_none());
        let pending = tx
            .find_locations_by_storage_and_status("fs1", LocationStatus::ToDelete, 100)
            .await
            .unwrap();
        assert_eq!(pending.len(), 4);
    }
}
