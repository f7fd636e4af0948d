//! 持久化接口
//!
//! `ArchiveStore::begin` 打开一个工作单元，返回的 `ArchiveTx` 显式传入每个操作。
//! 提交前的所有修改对其它工作单元不可见；未提交即丢弃 (drop) 等同于回滚。

use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pacs_core::models::*;
use pacs_core::{Result, StorageIds};

/// 拒绝清理的查询对象
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionPurgeKind {
    /// 以该代码被拒绝的实例
    RejectedInstances,
    /// 以该代码为标题的拒绝说明本身
    RejectionNotes,
}

/// 归档数据库
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// 开始一个工作单元
    async fn begin(&self) -> Result<Box<dyn ArchiveTx>>;
}

/// 一个工作单元内可用的全部查询与更新
///
/// 返回 `u64` 的更新操作报告受影响的行数；条件更新 (认领) 以行数作为成功信号。
#[async_trait]
pub trait ArchiveTx: Send {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;

    // ========== 入库 ==========

    async fn create_patient(&mut self, patient: &NewPatient) -> Result<Pk>;

    async fn create_study(&mut self, study: &NewStudy) -> Result<Pk>;

    async fn create_series(&mut self, series: &NewSeries) -> Result<Pk>;

    async fn create_instance(&mut self, instance: &NewInstance) -> Result<Pk>;

    async fn create_location(&mut self, location: &NewLocation) -> Result<Pk>;

    async fn create_uid_map(&mut self, mapping: &str) -> Result<Pk>;

    async fn create_mwl_item(&mut self, item: &NewMwlItem) -> Result<Pk>;

    async fn upsert_study_query_attributes(&mut self, attrs: &StudyQueryAttributes) -> Result<()>;

    async fn upsert_series_query_attributes(&mut self, attrs: &SeriesQueryAttributes) -> Result<()>;

    async fn find_or_create_code(&mut self, code: &Code) -> Result<CodeEntity>;

    async fn set_patient_merged_with(&mut self, patient_pk: Pk, merged_with: Option<Pk>) -> Result<u64>;

    // ========== 查询 ==========

    async fn get_patient(&mut self, pk: Pk) -> Result<Option<Patient>>;

    async fn get_study(&mut self, pk: Pk) -> Result<Option<Study>>;

    async fn get_series(&mut self, pk: Pk) -> Result<Option<Series>>;

    async fn get_instance(&mut self, pk: Pk) -> Result<Option<Instance>>;

    async fn get_location(&mut self, pk: Pk) -> Result<Option<Location>>;

    async fn get_uid_map(&mut self, pk: Pk) -> Result<Option<UidMap>>;

    async fn find_study_query_attributes(&mut self, study_pk: Pk) -> Result<Vec<StudyQueryAttributes>>;

    async fn find_series_query_attributes(&mut self, series_pk: Pk) -> Result<Vec<SeriesQueryAttributes>>;

    async fn find_locations_by_storage_and_status(
        &mut self,
        storage_id: &str,
        status: LocationStatus,
        limit: usize,
    ) -> Result<Vec<Location>>;

    /// 检查下仍挂在实例上的全部存储位置
    async fn find_locations_of_study(&mut self, study_pk: Pk) -> Result<Vec<Location>>;

    async fn find_locations_of_instance(&mut self, instance_pk: Pk) -> Result<Vec<Location>>;

    /// 按拒绝代码选择存储位置，`before` 限定实例创建时间
    async fn find_locations_for_rejection_purge(
        &mut self,
        kind: RejectionPurgeKind,
        code_pk: Pk,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Location>>;

    /// 位于指定存储上的检查，最久未访问的优先
    async fn find_study_pks_by_storage_order_by_access_time(
        &mut self,
        storage_id: &str,
        limit: usize,
    ) -> Result<Vec<Pk>>;

    async fn find_expired_studies(
        &mut self,
        today: NaiveDate,
        states: &[ExpirationState],
        limit: usize,
    ) -> Result<Vec<Study>>;

    async fn find_studies_with_unknown_size(
        &mut self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Study>>;

    async fn find_mwl_items_of_patient(&mut self, patient_pk: Pk) -> Result<Vec<MwlItem>>;

    async fn count_instances_of_series(&mut self, series_pk: Pk) -> Result<u64>;

    /// 系列下每个实例的拒绝状态
    async fn find_instance_rejection_states_of_series(&mut self, series_pk: Pk) -> Result<Vec<RejectionState>>;

    async fn count_series_of_study(&mut self, study_pk: Pk) -> Result<u64>;

    async fn find_series_rejection_states_of_study(&mut self, study_pk: Pk) -> Result<Vec<RejectionState>>;

    async fn count_studies_of_patient(&mut self, patient_pk: Pk) -> Result<u64>;

    /// 合并到该患者的其他患者数
    async fn count_patients_merged_with(&mut self, patient_pk: Pk) -> Result<u64>;

    /// 仍挂在实例上的、引用该UID映射的存储位置数
    async fn count_live_references_to_uid_map(&mut self, uid_map_pk: Pk) -> Result<u64>;

    async fn sum_location_size_of_study(&mut self, study_pk: Pk) -> Result<i64>;

    // ========== 行锁 ==========

    /// 锁定系列行直到工作单元结束，之后的子实体计数与删除处于同一隔离范围
    async fn lock_series(&mut self, pk: Pk) -> Result<()>;

    async fn lock_study(&mut self, pk: Pk) -> Result<()>;

    // ========== 更新 ==========

    async fn update_location_status(&mut self, pk: Pk, status: LocationStatus) -> Result<u64>;

    /// 解除存储位置与实例及UID映射的关联并标记为 `TO_DELETE`
    async fn detach_location(&mut self, pk: Pk) -> Result<u64>;

    /// 版本不符时返回 `Conflict`
    async fn update_series_rejection_state(
        &mut self,
        pk: Pk,
        expected_version: i64,
        state: RejectionState,
    ) -> Result<()>;

    /// 版本不符时返回 `Conflict`
    async fn update_study_rejection_state(
        &mut self,
        pk: Pk,
        expected_version: i64,
        state: RejectionState,
    ) -> Result<()>;

    /// `set state = target where state = expected and expected != target`
    async fn claim_expiration_state(
        &mut self,
        study_pk: Pk,
        expected: ExpirationState,
        target: ExpirationState,
    ) -> Result<u64>;

    async fn update_study_expiration(
        &mut self,
        study_pk: Pk,
        expiration_date: Option<NaiveDate>,
        state: ExpirationState,
    ) -> Result<u64>;

    /// `set size = -2 where size = -1`
    async fn claim_unknown_size_study(&mut self, study_pk: Pk) -> Result<u64>;

    /// `set size = ? where size = -2`
    async fn set_study_size_if_claimed(&mut self, study_pk: Pk, size: i64) -> Result<u64>;

    async fn reset_study_size(&mut self, study_pk: Pk) -> Result<u64>;

    async fn set_study_storage_ids(&mut self, study_pk: Pk, storage_ids: &StorageIds) -> Result<u64>;

    async fn increment_series_failed_retrieves(&mut self, series_pk: Pk, failed_iuids: &str) -> Result<u64>;

    async fn clear_series_failed_sop_instance_uid_list(&mut self, series_pk: Pk) -> Result<u64>;

    // ========== 删除 ==========

    async fn delete_location(&mut self, pk: Pk) -> Result<u64>;

    async fn delete_uid_map(&mut self, pk: Pk) -> Result<u64>;

    /// 仍挂在该实例上的存储位置被解除关联
    async fn delete_instance(&mut self, pk: Pk) -> Result<u64>;

    /// 连同剩余实例一起删除，剩余存储位置被解除关联
    async fn delete_series(&mut self, pk: Pk) -> Result<u64>;

    /// 连同剩余系列一起删除
    async fn delete_study(&mut self, pk: Pk) -> Result<u64>;

    /// 仍有检查或预约工作项引用时失败
    async fn delete_patient(&mut self, pk: Pk) -> Result<u64>;

    async fn delete_series_query_attributes(&mut self, series_pk: Pk) -> Result<u64>;

    async fn delete_study_query_attributes(&mut self, study_pk: Pk) -> Result<u64>;

    async fn delete_mwl_items_of_patient(&mut self, patient_pk: Pk) -> Result<u64>;
}
