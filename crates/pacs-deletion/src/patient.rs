//! 患者清理
//!
//! 检查全部删除后决定患者是否一并删除。是否存在合并关系由患者管理服务判断，
//! 清理逻辑本身不检查合并链接。

use crate::audit::{AuditAction, AuditEvent};
use async_trait::async_trait;
use chrono::Utc;
use pacs_core::models::{Patient, Pk};
use pacs_core::{Attributes, IdWithIssuer, Result};
use pacs_database::ArchiveTx;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 患者管理请求
#[derive(Debug, Clone)]
pub struct PatientMgtContext {
    pub id: Uuid,
    pub patient: Patient,
    pub attributes: Attributes,
    pub patient_id: Option<IdWithIssuer>,
    pub action: AuditAction,
}

/// 患者删除结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatientDeletion {
    Deleted(AuditEvent),
    /// 患者已被合并到其它患者，拒绝删除
    RefusedMerged { merged_with_pk: Pk },
    /// 仍有其它患者合并到该患者，拒绝删除
    RefusedMergeTarget { merged_patients: u64 },
}

/// 患者管理服务
#[async_trait]
pub trait PatientService: Send + Sync {
    /// 解码患者属性并构造删除请求；属性损坏时返回 `BlobCorrupted`
    async fn create_deletion_context(&self, patient: &Patient) -> Result<PatientMgtContext>;

    async fn delete_if_not_merged(&self, tx: &mut dyn ArchiveTx, ctx: &PatientMgtContext) -> Result<PatientDeletion>;
}

/// 删除患者的预约工作项
pub async fn delete_scheduled_items(tx: &mut dyn ArchiveTx, patient_pk: Pk) -> Result<u64> {
    let removed = tx.delete_mwl_items_of_patient(patient_pk).await?;
    if removed > 0 {
        debug!(patient_pk, removed, "Deleted scheduled items of patient");
    }
    Ok(removed)
}

/// 基于归档数据库的患者管理服务
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchivePatientService;

#[async_trait]
impl PatientService for ArchivePatientService {
    async fn create_deletion_context(&self, patient: &Patient) -> Result<PatientMgtContext> {
        let attributes = patient.attributes.attributes()?;
        Ok(PatientMgtContext {
            id: Uuid::new_v4(),
            patient: patient.clone(),
            patient_id: IdWithIssuer::pid_of(&attributes),
            attributes,
            action: AuditAction::Delete,
        })
    }

    async fn delete_if_not_merged(&self, tx: &mut dyn ArchiveTx, ctx: &PatientMgtContext) -> Result<PatientDeletion> {
        if let Some(merged_with_pk) = ctx.patient.merged_with_pk {
            warn!(
                patient_pk = ctx.patient.pk,
                merged_with_pk, "Patient was merged into another patient, keeping it"
            );
            return Ok(PatientDeletion::RefusedMerged { merged_with_pk });
        }
        let merged_patients = tx.count_patients_merged_with(ctx.patient.pk).await?;
        if merged_patients > 0 {
            warn!(
                patient_pk = ctx.patient.pk,
                merged_patients, "Other patients were merged into this patient, keeping it"
            );
            return Ok(PatientDeletion::RefusedMergeTarget { merged_patients });
        }

        delete_scheduled_items(tx, ctx.patient.pk).await?;
        tx.delete_patient(ctx.patient.pk).await?;
        info!(patient_pk = ctx.patient.pk, request_id = %ctx.id, "Deleted patient");

        Ok(PatientDeletion::Deleted(AuditEvent {
            id: ctx.id,
            action: ctx.action,
            patient_pk: ctx.patient.pk,
            patient_id: ctx.patient_id.clone(),
            timestamp: Utc::now(),
        }))
    }
}

/// 患者清理
#[derive(Clone)]
pub struct PatientCleanup {
    patient_service: Arc<dyn PatientService>,
}

impl PatientCleanup {
    pub fn new(patient_service: Arc<dyn PatientService>) -> Self {
        Self { patient_service }
    }

    /// 对已没有检查的患者发起删除；仍有检查或已不存在时返回 None
    pub async fn cleanup(&self, tx: &mut dyn ArchiveTx, patient_pk: Pk) -> Result<Option<PatientDeletion>> {
        if tx.count_studies_of_patient(patient_pk).await? > 0 {
            return Ok(None);
        }
        let Some(patient) = tx.get_patient(patient_pk).await? else {
            return Ok(None);
        };
        let ctx = self.patient_service.create_deletion_context(&patient).await?;
        let result = self.patient_service.delete_if_not_merged(tx, &ctx).await?;
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_core::PacsError;
    use pacs_database::fixtures::TreeBuilder;
    use pacs_database::{ArchiveStore, MemoryArchiveStore, NewMwlItem, NewPatient};

    #[tokio::test]
    async fn test_cleanup_deletes_patient_and_scheduled_items() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let patient_pk = TreeBuilder::new(tx.as_mut(), "fs1").patient("P1").await.unwrap();
        tx.create_mwl_item(&NewMwlItem {
            patient_pk,
            scheduled_procedure_step_id: "SPS1".to_string(),
            study_iuid: "1.2.3".to_string(),
        })
        .await
        .unwrap();

        let cleanup = PatientCleanup::new(Arc::new(ArchivePatientService));
        let result = cleanup.cleanup(tx.as_mut(), patient_pk).await.unwrap();
        let Some(PatientDeletion::Deleted(event)) = result else {
            panic!("patient not deleted: {:?}", result);
        };
        assert_eq!(event.patient_id.unwrap().id, "P1");
        assert!(tx.get_patient(patient_pk).await.unwrap().is_none());
        assert!(tx.find_mwl_items_of_patient(patient_pk).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merged_patient_is_kept() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut builder = TreeBuilder::new(tx.as_mut(), "fs1");
        let target = builder.patient("P-TARGET").await.unwrap();
        let merged = builder.patient("P-OLD").await.unwrap();
        tx.set_patient_merged_with(merged, Some(target)).await.unwrap();

        let cleanup = PatientCleanup::new(Arc::new(ArchivePatientService));
        let result = cleanup.cleanup(tx.as_mut(), merged).await.unwrap();
        assert_eq!(result, Some(PatientDeletion::RefusedMerged { merged_with_pk: target }));
        assert!(tx.get_patient(merged).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_merge_target_is_kept() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut builder = TreeBuilder::new(tx.as_mut(), "fs1");
        let target = builder.patient("P-NEW").await.unwrap();
        let merged = builder.patient("P-OLD").await.unwrap();
        tx.set_patient_merged_with(merged, Some(target)).await.unwrap();

        let cleanup = PatientCleanup::new(Arc::new(ArchivePatientService));
        let result = cleanup.cleanup(tx.as_mut(), target).await.unwrap();
        assert_eq!(result, Some(PatientDeletion::RefusedMergeTarget { merged_patients: 1 }));
        assert!(tx.get_patient(target).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_patient_with_study_is_not_a_candidate() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let tree = TreeBuilder::new(tx.as_mut(), "fs1").study_tree("P1", &[1]).await.unwrap();

        let cleanup = PatientCleanup::new(Arc::new(ArchivePatientService));
        assert_eq!(cleanup.cleanup(tx.as_mut(), tree.patient_pk).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupted_attributes_abort() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let patient_pk = tx
            .create_patient(&NewPatient {
                attributes: pacs_core::AttributesBlob::from_encoded(b"\xff".to_vec()),
                merged_with_pk: None,
            })
            .await
            .unwrap();

        let cleanup = PatientCleanup::new(Arc::new(ArchivePatientService));
        let err = cleanup.cleanup(tx.as_mut(), patient_pk).await.unwrap_err();
        assert!(matches!(err, PacsError::BlobCorrupted(_)));
    }
}
