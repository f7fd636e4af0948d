//! 系列检索失败记录

use pacs_core::models::Pk;
use pacs_core::utils::join_bounded;
use pacs_core::{PacsError, Result};
use pacs_database::ArchiveTx;
use tracing::warn;

/// 失败实例UID列表的最大长度
pub const MAX_FAILED_IUIDS_LEN: usize = 4000;

#[derive(Debug, Default, Clone, Copy)]
pub struct RetrieveFailureTracker;

impl RetrieveFailureTracker {
    /// 记录一次检索结果；全部成功时清空失败列表，计数保持不变
    pub async fn record(&self, tx: &mut dyn ArchiveTx, series_pk: Pk, failed_uids: &[String]) -> Result<()> {
        if failed_uids.is_empty() {
            tx.clear_series_failed_sop_instance_uid_list(series_pk).await?;
            return Ok(());
        }

        let joined = join_bounded(failed_uids, MAX_FAILED_IUIDS_LEN);
        warn!(series_pk, failed = failed_uids.len(), "Retrieve of series failed");
        if tx.increment_series_failed_retrieves(series_pk, &joined).await? == 0 {
            return Err(PacsError::not_found(format!("series {}", series_pk)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_database::fixtures::TreeBuilder;
    use pacs_database::{ArchiveStore, MemoryArchiveStore};

    #[tokio::test]
    async fn test_record_and_clear() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let tree = TreeBuilder::new(tx.as_mut(), "fs1").study_tree("P1", &[2]).await.unwrap();
        let series_pk = tree.series[0].series_pk;
        let tracker = RetrieveFailureTracker;

        let failed = vec!["1.2.3".to_string(), "1.2.4".to_string()];
        tracker.record(tx.as_mut(), series_pk, &failed).await.unwrap();
        tracker.record(tx.as_mut(), series_pk, &failed[..1]).await.unwrap();
        let series = tx.get_series(series_pk).await.unwrap().unwrap();
        assert_eq!(series.failed_retrieves, 2);
        assert_eq!(series.failed_sop_instance_uid_list.as_deref(), Some("1.2.3"));

        tracker.record(tx.as_mut(), series_pk, &[]).await.unwrap();
        let series = tx.get_series(series_pk).await.unwrap().unwrap();
        assert_eq!(series.failed_retrieves, 2);
        assert_eq!(series.failed_sop_instance_uid_list, None);
    }

    #[tokio::test]
    async fn test_failed_list_is_bounded() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let tree = TreeBuilder::new(tx.as_mut(), "fs1").study_tree("P1", &[1]).await.unwrap();
        let series_pk = tree.series[0].series_pk;

        let failed: Vec<String> = (0..1000).map(|i| format!("1.2.840.{}", i)).collect();
        RetrieveFailureTracker.record(tx.as_mut(), series_pk, &failed).await.unwrap();
        let list = tx.get_series(series_pk).await.unwrap().unwrap().failed_sop_instance_uid_list.unwrap();
        assert!(list.len() <= MAX_FAILED_IUIDS_LEN);
        assert!(list.starts_with("1.2.840.0\\1.2.840.1"));
    }

    #[tokio::test]
    async fn test_unknown_series() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = RetrieveFailureTracker
            .record(tx.as_mut(), 42, &["1.2.3".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, PacsError::NotFound(_)));
    }
}
