//! 过期检查清理
//!
//! 认领 `UPDATEABLE → REJECTED` 后在同一工作单元内删除整个检查；
//! 删除失败时回滚，再在新的工作单元内记录 `FAILED_TO_REJECT`。

use crate::context::{DeletionOutcome, StudyDeleteContext};
use crate::engine::DeletionService;
use chrono::NaiveDate;
use pacs_core::models::{ExpirationState, Pk};
use pacs_core::Result;
use pacs_database::ArchiveStore;
use pacs_storage::{ClaimOutcome, ExpirationClaimer};
use std::sync::Arc;
use tracing::{error, info, warn};

/// 一轮过期清理的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub rejected: Vec<Pk>,
    /// 被其它工作者认领
    pub lost: usize,
    pub failed: Vec<Pk>,
}

/// 过期检查清理
pub struct ExpirationSweeper {
    service: Arc<DeletionService>,
    store: Arc<dyn ArchiveStore>,
    claimer: ExpirationClaimer,
    batch_size: usize,
}

impl ExpirationSweeper {
    pub fn new(service: Arc<DeletionService>, store: Arc<dyn ArchiveStore>, batch_size: usize) -> Self {
        Self {
            service,
            store,
            claimer: ExpirationClaimer,
            batch_size,
        }
    }

    pub async fn sweep(&self, today: NaiveDate) -> Result<SweepReport> {
        let expired = {
            let mut tx = self.store.begin().await?;
            let studies = self.claimer.find_expired(tx.as_mut(), today, self.batch_size).await?;
            tx.rollback().await?;
            studies
        };

        let mut report = SweepReport::default();
        for study in expired {
            match self.reject_study(study.pk).await {
                Ok(Some(outcome)) => {
                    self.service.publish(&outcome);
                    report.rejected.push(study.pk);
                }
                Ok(None) => report.lost += 1,
                Err(e) => {
                    error!(study_pk = study.pk, error = %e, "Failed to delete expired study");
                    self.mark_failed_to_reject(study.pk).await?;
                    report.failed.push(study.pk);
                }
            }
        }

        if !report.rejected.is_empty() || !report.failed.is_empty() {
            info!(
                rejected = report.rejected.len(),
                lost = report.lost,
                failed = report.failed.len(),
                "Expiration sweep finished"
            );
        }
        Ok(report)
    }

    /// 认领失败时返回 None
    async fn reject_study(&self, study_pk: Pk) -> Result<Option<DeletionOutcome>> {
        let mut tx = self.store.begin().await?;
        let claim = self
            .claimer
            .claim(tx.as_mut(), study_pk, ExpirationState::Updateable, ExpirationState::Rejected)
            .await?;
        if claim == ClaimOutcome::Lost {
            tx.rollback().await?;
            return Ok(None);
        }
        let mut ctx = StudyDeleteContext::new(study_pk);
        let outcome = self.service.remove_study_on_storage(tx.as_mut(), &mut ctx).await?;
        tx.commit().await?;
        Ok(Some(outcome))
    }

    async fn mark_failed_to_reject(&self, study_pk: Pk) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let claim = self
            .claimer
            .claim(tx.as_mut(), study_pk, ExpirationState::Updateable, ExpirationState::FailedToReject)
            .await?;
        if claim == ClaimOutcome::Lost {
            tx.rollback().await?;
            warn!(study_pk, "Expiration state changed concurrently, FAILED_TO_REJECT not recorded");
            return Ok(());
        }
        tx.commit().await
    }
}
