//! 级联删除引擎
//!
//! 在一个工作单元内删除一批存储位置所属的实例，并自下而上把删除与拒绝状态
//! 传播到 系列 → 检查 → 患者。
//!
//! 两种模式：
//! - 常规清理 (`StudyDeleteMode::Off`)：与入库和其它删除并发进行，删除系列/检查前
//!   先锁定该行再重新计数，仍有子实体时保留父实体并只做 `PARTIAL → NONE` 降级；
//! - 整个检查删除 (`StudyDeleteMode::WholeStudy`)：调用方保证整棵子树都在删除范围内，
//!   系列与检查无条件删除，不再计数。
//!
//! 存储位置行本身不在这里删除，只解除与实例的关联并标记为 `TO_DELETE`，
//! 等物理删除确认后再由存储回收删除。

use crate::audit::AuditEmitter;
use crate::code::CodeCache;
use crate::context::{DeletionOutcome, DeletionSettings, StudyDeleteContext, StudyDeleteMode};
use crate::metrics::DeletionMetrics;
use crate::patient::{delete_scheduled_items, PatientCleanup, PatientDeletion, PatientMgtContext, PatientService};
use chrono::{DateTime, Utc};
use pacs_core::models::*;
use pacs_core::{PacsError, Result};
use pacs_database::{ArchiveTx, RejectionPurgeKind};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// 级联删除服务
pub struct DeletionService {
    settings: DeletionSettings,
    patient_cleanup: PatientCleanup,
    code_cache: Arc<dyn CodeCache>,
    audit: Arc<dyn AuditEmitter>,
    metrics: Option<DeletionMetrics>,
}

impl DeletionService {
    pub fn new(
        settings: DeletionSettings,
        patient_service: Arc<dyn PatientService>,
        code_cache: Arc<dyn CodeCache>,
        audit: Arc<dyn AuditEmitter>,
    ) -> Self {
        Self {
            settings,
            patient_cleanup: PatientCleanup::new(patient_service),
            code_cache,
            audit,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DeletionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &DeletionSettings {
        &self.settings
    }

    pub fn metrics(&self) -> Option<&DeletionMetrics> {
        self.metrics.as_ref()
    }

    /// 工作单元提交后发出审计事件并累计指标
    pub fn publish(&self, outcome: &DeletionOutcome) {
        for event in &outcome.audit_events {
            self.audit.emit(event);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(outcome);
        }
    }

    // ========== 候选选择 ==========

    /// 指定存储上等待物理删除的存储位置
    pub async fn find_locations_to_delete(
        &self,
        tx: &mut dyn ArchiveTx,
        storage_id: &str,
        limit: usize,
    ) -> Result<Vec<Location>> {
        tx.find_locations_by_storage_and_status(storage_id, LocationStatus::ToDelete, limit)
            .await
    }

    /// 指定存储上的检查，最久未访问的优先
    pub async fn find_studies_for_deletion_on_storage(
        &self,
        tx: &mut dyn ArchiveTx,
        storage_id: &str,
        limit: usize,
    ) -> Result<Vec<Pk>> {
        tx.find_study_pks_by_storage_order_by_access_time(storage_id, limit)
            .await
    }

    // ========== 存储位置状态 ==========

    /// 物理删除失败，保留行以便重试
    pub async fn mark_failed_to_delete(&self, tx: &mut dyn ArchiveTx, location: &Location) -> Result<()> {
        if tx
            .update_location_status(location.pk, LocationStatus::FailedToDelete)
            .await?
            == 0
        {
            return Err(PacsError::not_found(format!("location {}", location.pk)));
        }
        Ok(())
    }

    /// 物理删除已确认，删除存储位置行
    pub async fn remove_location_row(&self, tx: &mut dyn ArchiveTx, location: &Location) -> Result<()> {
        if tx.delete_location(location.pk).await? == 0 {
            return Err(PacsError::not_found(format!("location {}", location.pk)));
        }
        Ok(())
    }

    // ========== 删除 ==========

    /// 删除一批存储位置所属的实例并向上级联，返回结果中含被删除的实例数
    pub async fn delete_locations(
        &self,
        tx: &mut dyn ArchiveTx,
        locations: &[Location],
        mode: StudyDeleteMode,
    ) -> Result<DeletionOutcome> {
        if locations.is_empty() {
            return Ok(DeletionOutcome::default());
        }

        // 先完成全部读取与校验，任何错误都发生在修改之前
        let mut instances: BTreeMap<Pk, Instance> = BTreeMap::new();
        for location in locations {
            let instance_pk = location.instance_pk.ok_or_else(|| {
                PacsError::Validation(format!("location {} 未关联实例", location.pk))
            })?;
            if instances.contains_key(&instance_pk) {
                continue;
            }
            let instance = tx
                .get_instance(instance_pk)
                .await?
                .ok_or_else(|| PacsError::not_found(format!("instance {}", instance_pk)))?;
            instances.insert(instance_pk, instance);
        }

        let mut series: BTreeMap<Pk, Series> = BTreeMap::new();
        for instance in instances.values() {
            if series.contains_key(&instance.series_pk) {
                continue;
            }
            let loaded = tx
                .get_series(instance.series_pk)
                .await?
                .ok_or_else(|| PacsError::not_found(format!("series {}", instance.series_pk)))?;
            series.insert(loaded.pk, loaded);
        }

        if let StudyDeleteMode::WholeStudy { study_pk } = mode {
            if let Some(other) = series.values().find(|s| s.study_pk != study_pk) {
                return Err(PacsError::Validation(format!(
                    "series {} 属于检查 {}，不属于待删除的检查 {}",
                    other.pk, other.study_pk, study_pk
                )));
            }
        }

        // 删除实例会连带解除其全部副本，整检查删除还会带走批次之外的实例
        let mut uid_maps: BTreeSet<Pk> = locations.iter().filter_map(|l| l.uid_map_pk).collect();
        let mut attached = Vec::new();
        if let StudyDeleteMode::WholeStudy { study_pk } = mode {
            attached.extend(tx.find_locations_of_study(study_pk).await?);
        }
        for &instance_pk in instances.keys() {
            attached.extend(tx.find_locations_of_instance(instance_pk).await?);
        }
        uid_maps.extend(attached.iter().filter_map(|l| l.uid_map_pk));

        let mut outcome = DeletionOutcome::default();

        // 存储位置
        for location in locations {
            tx.detach_location(location.pk).await?;
        }

        // 实例
        for instance_pk in instances.keys() {
            tx.delete_instance(*instance_pk).await?;
        }
        outcome.removed_instances = instances.len();
        if !mode.is_whole_study() {
            outcome.audited_instances = instances.into_values().collect();
        }

        // 系列
        let mut study_pks = BTreeSet::new();
        for (&series_pk, loaded) in &series {
            tx.delete_series_query_attributes(series_pk).await?;
            study_pks.insert(loaded.study_pk);
            if mode.is_whole_study() {
                tx.delete_series(series_pk).await?;
                outcome.removed_series.push(series_pk);
                continue;
            }
            tx.lock_series(series_pk).await?;
            if tx.count_instances_of_series(series_pk).await? == 0 {
                tx.delete_series(series_pk).await?;
                outcome.removed_series.push(series_pk);
            } else {
                self.demote_series(tx, series_pk).await?;
            }
        }

        // 检查
        let mut cleanup_candidates = BTreeSet::new();
        let mut surviving_patients = BTreeSet::new();
        for study_pk in study_pks {
            tx.delete_study_query_attributes(study_pk).await?;
            if !mode.is_whole_study() {
                tx.lock_study(study_pk).await?;
            }
            let study = tx
                .get_study(study_pk)
                .await?
                .ok_or_else(|| PacsError::not_found(format!("study {}", study_pk)))?;

            if mode.is_whole_study() || tx.count_series_of_study(study_pk).await? == 0 {
                if mode.is_whole_study() {
                    outcome.patient = tx.get_patient(study.patient_pk).await?;
                }
                tx.delete_study(study_pk).await?;
                outcome.removed_studies.push(study_pk);
                if self.settings.delete_patient_on_delete_last_study {
                    cleanup_candidates.insert(study.patient_pk);
                }
                if mode.is_whole_study() {
                    outcome.study = Some(study);
                }
            } else {
                surviving_patients.insert(study.patient_pk);
                self.demote_study(tx, &study).await?;
                tx.reset_study_size(study_pk).await?;
            }
        }

        // 不再被存活实例引用的UID映射
        for uid_map_pk in uid_maps {
            if tx.count_live_references_to_uid_map(uid_map_pk).await? == 0 {
                tx.delete_uid_map(uid_map_pk).await?;
                outcome.purged_uid_maps.push(uid_map_pk);
            }
        }

        // 患者
        let candidates: Vec<Pk> = cleanup_candidates
            .difference(&surviving_patients)
            .copied()
            .collect();
        self.cleanup_patients(tx, &candidates, &mut outcome).await?;

        info!(
            mode = ?mode,
            locations = locations.len(),
            instances = outcome.removed_instances,
            series = outcome.removed_series.len(),
            studies = outcome.removed_studies.len(),
            patients = outcome.deleted_patients.len(),
            uid_maps = outcome.purged_uid_maps.len(),
            "Deleted instances"
        );
        Ok(outcome)
    }

    /// 存活系列在最后一个被拒绝实例删除后从 `PARTIAL` 降为 `NONE`
    async fn demote_series(&self, tx: &mut dyn ArchiveTx, series_pk: Pk) -> Result<()> {
        let series = tx
            .get_series(series_pk)
            .await?
            .ok_or_else(|| PacsError::not_found(format!("series {}", series_pk)))?;
        if series.rejection_state != RejectionState::Partial {
            return Ok(());
        }
        let states = tx.find_instance_rejection_states_of_series(series_pk).await?;
        if derive_rejection_state(states) == RejectionState::None {
            tx.update_series_rejection_state(series_pk, series.version, RejectionState::None)
                .await?;
            debug!(series_pk, "Series rejection state reset to NONE");
        }
        Ok(())
    }

    /// 存活检查中不再有非 `NONE` 系列时从 `PARTIAL` 降为 `NONE`
    async fn demote_study(&self, tx: &mut dyn ArchiveTx, study: &Study) -> Result<()> {
        if study.rejection_state != RejectionState::Partial {
            return Ok(());
        }
        let states = tx.find_series_rejection_states_of_study(study.pk).await?;
        if derive_rejection_state(states) == RejectionState::None {
            tx.update_study_rejection_state(study.pk, study.version, RejectionState::None)
                .await?;
            debug!(study_pk = study.pk, "Study rejection state reset to NONE");
        }
        Ok(())
    }

    async fn cleanup_patients(
        &self,
        tx: &mut dyn ArchiveTx,
        candidates: &[Pk],
        outcome: &mut DeletionOutcome,
    ) -> Result<()> {
        for &patient_pk in candidates {
            match self.patient_cleanup.cleanup(tx, patient_pk).await? {
                Some(PatientDeletion::Deleted(event)) => {
                    outcome.deleted_patients.push(patient_pk);
                    outcome.audit_events.push(event);
                }
                Some(PatientDeletion::RefusedMerged { .. } | PatientDeletion::RefusedMergeTarget { .. }) | None => {}
            }
        }
        Ok(())
    }

    /// 删除整个检查：取出检查下全部存储位置，以整个检查模式删除
    pub async fn remove_study_on_storage(
        &self,
        tx: &mut dyn ArchiveTx,
        ctx: &mut StudyDeleteContext,
    ) -> Result<DeletionOutcome> {
        let study = tx
            .get_study(ctx.study_pk)
            .await?
            .ok_or_else(|| PacsError::not_found(format!("study {}", ctx.study_pk)))?;
        let locations = tx.find_locations_of_study(ctx.study_pk).await?;

        let outcome = if locations.is_empty() {
            self.remove_study_without_locations(tx, study).await?
        } else {
            self.delete_locations(tx, &locations, StudyDeleteMode::WholeStudy { study_pk: ctx.study_pk })
                .await?
        };
        ctx.study = outcome.study.clone();
        ctx.patient = outcome.patient.clone();
        Ok(outcome)
    }

    /// 检查下已没有存储位置时直接删除检查，剩余的系列与实例随之删除
    async fn remove_study_without_locations(&self, tx: &mut dyn ArchiveTx, study: Study) -> Result<DeletionOutcome> {
        let mut outcome = DeletionOutcome::default();
        tx.delete_study_query_attributes(study.pk).await?;
        outcome.patient = tx.get_patient(study.patient_pk).await?;
        tx.delete_study(study.pk).await?;
        outcome.removed_studies.push(study.pk);

        if self.settings.delete_patient_on_delete_last_study {
            self.cleanup_patients(tx, &[study.patient_pk], &mut outcome).await?;
        }
        info!(study_pk = study.pk, "Deleted study without stored objects");
        outcome.study = Some(study);
        Ok(outcome)
    }

    /// 删除已知没有系列的检查
    pub async fn delete_empty_study(&self, tx: &mut dyn ArchiveTx, ctx: &mut StudyDeleteContext) -> Result<()> {
        let study = tx
            .get_study(ctx.study_pk)
            .await?
            .ok_or_else(|| PacsError::not_found(format!("study {}", ctx.study_pk)))?;
        let series = tx.count_series_of_study(study.pk).await?;
        if series > 0 {
            return Err(PacsError::Validation(format!(
                "检查 {} 仍有 {} 个系列",
                study.pk, series
            )));
        }
        tx.delete_study_query_attributes(study.pk).await?;
        ctx.patient = tx.get_patient(study.patient_pk).await?;
        tx.delete_study(study.pk).await?;
        debug!(study_pk = study.pk, "Deleted empty study");
        ctx.study = Some(study);
        Ok(())
    }

    /// 删除患者前先删除其预约工作项
    pub async fn delete_scheduled_items_of_patient(
        &self,
        tx: &mut dyn ArchiveTx,
        ctx: &PatientMgtContext,
    ) -> Result<u64> {
        delete_scheduled_items(tx, ctx.patient.pk).await
    }

    /// 删除以指定代码拒绝的实例 (或该代码的拒绝说明本身)
    pub async fn delete_rejected_instances_or_rejection_notes_before(
        &self,
        tx: &mut dyn ArchiveTx,
        kind: RejectionPurgeKind,
        rejection_code: &Code,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<DeletionOutcome> {
        let code = self.code_cache.find_or_create(tx, rejection_code).await?;
        let locations = tx
            .find_locations_for_rejection_purge(kind, code.pk, before, limit)
            .await?;
        debug!(code = %rejection_code, ?kind, candidates = locations.len(), "Rejection purge");
        self.delete_locations(tx, &locations, StudyDeleteMode::Off).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditEmitter;
    use crate::code::StoreCodeCache;
    use crate::patient::ArchivePatientService;
    use pacs_database::fixtures::TreeBuilder;
    use pacs_database::{ArchiveStore, MemoryArchiveStore};

    fn service() -> DeletionService {
        DeletionService::new(
            DeletionSettings::default(),
            Arc::new(ArchivePatientService),
            Arc::new(StoreCodeCache::new()),
            Arc::new(MemoryAuditEmitter::new()),
        )
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let outcome = service()
            .delete_locations(tx.as_mut(), &[], StudyDeleteMode::Off)
            .await
            .unwrap();
        assert_eq!(outcome.removed_instances, 0);
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_location_rejected_in_whole_study_mode() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut builder = TreeBuilder::new(tx.as_mut(), "fs1");
        let first = builder.study_tree("P1", &[1]).await.unwrap();
        let second = builder.study_tree("P2", &[1]).await.unwrap();

        let mut locations = first.locations();
        locations.extend(second.locations());
        let err = service()
            .delete_locations(tx.as_mut(), &locations, StudyDeleteMode::WholeStudy { study_pk: first.study_pk })
            .await
            .unwrap_err();
        assert!(matches!(err, PacsError::Validation(_)));

        // 校验失败发生在任何修改之前
        let location = tx.get_location(locations[0].pk).await.unwrap().unwrap();
        assert_eq!(location.status, LocationStatus::Active);
        assert!(tx.get_instance(first.instance_pks()[0]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_and_remove_unknown_location() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let tree = TreeBuilder::new(tx.as_mut(), "fs1").study_tree("P1", &[1]).await.unwrap();
        let mut location = tree.locations().remove(0);

        let service = service();
        service.mark_failed_to_delete(tx.as_mut(), &location).await.unwrap();
        assert_eq!(
            tx.get_location(location.pk).await.unwrap().unwrap().status,
            LocationStatus::FailedToDelete
        );

        location.pk = 9999;
        assert!(matches!(
            service.mark_failed_to_delete(tx.as_mut(), &location).await,
            Err(PacsError::NotFound(_))
        ));
        assert!(matches!(
            service.remove_location_row(tx.as_mut(), &location).await,
            Err(PacsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_empty_study() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut builder = TreeBuilder::new(tx.as_mut(), "fs1");
        let patient_pk = builder.patient("P1").await.unwrap();
        let empty = builder.study(patient_pk).await.unwrap();
        let full = builder.study_tree_of(patient_pk, &[1]).await.unwrap();

        let service = service();
        let mut ctx = StudyDeleteContext::new(full.study_pk);
        assert!(matches!(
            service.delete_empty_study(tx.as_mut(), &mut ctx).await,
            Err(PacsError::Validation(_))
        ));

        let mut ctx = StudyDeleteContext::new(empty);
        service.delete_empty_study(tx.as_mut(), &mut ctx).await.unwrap();
        assert_eq!(ctx.study.unwrap().pk, empty);
        assert_eq!(ctx.patient.unwrap().pk, patient_pk);
        assert!(tx.get_study(empty).await.unwrap().is_none());

        let mut ctx = StudyDeleteContext::new(empty);
        assert!(matches!(
            service.delete_empty_study(tx.as_mut(), &mut ctx).await,
            Err(PacsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_whole_study_without_locations() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut builder = TreeBuilder::new(tx.as_mut(), "fs1");
        let patient_pk = builder.patient("P1").await.unwrap();
        let study_pk = builder.study(patient_pk).await.unwrap();
        builder.series(study_pk).await.unwrap();

        let mut ctx = StudyDeleteContext::new(study_pk);
        let outcome = service().remove_study_on_storage(tx.as_mut(), &mut ctx).await.unwrap();
        assert_eq!(outcome.removed_studies, vec![study_pk]);
        assert_eq!(outcome.deleted_patients, vec![patient_pk]);
        assert_eq!(tx.count_series_of_study(study_pk).await.unwrap(), 0);
    }
}
