//! 核心数据模型定义
//!
//! 归档所有权树: Patient → Study → Series → Instance → Location。
//! 子实体只保存父实体主键，不存在反向引用。

use crate::attributes::AttributesBlob;
use crate::error::{PacsError, Result};
use crate::utils::StorageIds;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 数据库主键
pub type Pk = i64;

/// 拒绝状态 (软删除标记)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionState {
    #[default]
    None,
    Partial,
    Complete,
}

impl RejectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionState::None => "NONE",
            RejectionState::Partial => "PARTIAL",
            RejectionState::Complete => "COMPLETE",
        }
    }
}

/// 由子实体状态推导父实体的拒绝状态
///
/// 没有子实体或全部为 `None` 时为 `None`，全部为 `Complete` 时为 `Complete`，
/// 其余情况为 `Partial`。
pub fn derive_rejection_state<I>(children: I) -> RejectionState
where
    I: IntoIterator<Item = RejectionState>,
{
    let mut any_none = false;
    let mut any_complete = false;
    for state in children {
        match state {
            RejectionState::Partial => return RejectionState::Partial,
            RejectionState::None => any_none = true,
            RejectionState::Complete => any_complete = true,
        }
    }
    match (any_none, any_complete) {
        (_, false) => RejectionState::None,
        (false, true) => RejectionState::Complete,
        (true, true) => RejectionState::Partial,
    }
}

/// 检查过期状态，作为认领协议中的令牌使用
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpirationState {
    #[default]
    Updateable,
    Frozen,
    Rejected,
    ExportScheduled,
    FailedToExport,
    FailedToReject,
}

impl ExpirationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpirationState::Updateable => "UPDATEABLE",
            ExpirationState::Frozen => "FROZEN",
            ExpirationState::Rejected => "REJECTED",
            ExpirationState::ExportScheduled => "EXPORT_SCHEDULED",
            ExpirationState::FailedToExport => "FAILED_TO_EXPORT",
            ExpirationState::FailedToReject => "FAILED_TO_REJECT",
        }
    }
}

/// 存储位置状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationStatus {
    #[default]
    Active,
    ToDelete,
    FailedToDelete,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Active => "ACTIVE",
            LocationStatus::ToDelete => "TO_DELETE",
            LocationStatus::FailedToDelete => "FAILED_TO_DELETE",
        }
    }
}

impl FromStr for RejectionState {
    type Err = PacsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NONE" => Ok(RejectionState::None),
            "PARTIAL" => Ok(RejectionState::Partial),
            "COMPLETE" => Ok(RejectionState::Complete),
            other => Err(PacsError::Database(format!("unknown rejection state: {}", other))),
        }
    }
}

impl FromStr for ExpirationState {
    type Err = PacsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UPDATEABLE" => Ok(ExpirationState::Updateable),
            "FROZEN" => Ok(ExpirationState::Frozen),
            "REJECTED" => Ok(ExpirationState::Rejected),
            "EXPORT_SCHEDULED" => Ok(ExpirationState::ExportScheduled),
            "FAILED_TO_EXPORT" => Ok(ExpirationState::FailedToExport),
            "FAILED_TO_REJECT" => Ok(ExpirationState::FailedToReject),
            other => Err(PacsError::Database(format!("unknown expiration state: {}", other))),
        }
    }
}

impl FromStr for LocationStatus {
    type Err = PacsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(LocationStatus::Active),
            "TO_DELETE" => Ok(LocationStatus::ToDelete),
            "FAILED_TO_DELETE" => Ok(LocationStatus::FailedToDelete),
            other => Err(PacsError::Database(format!("unknown location status: {}", other))),
        }
    }
}

impl fmt::Display for RejectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ExpirationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for LocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 患者
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub pk: Pk,
    pub attributes: AttributesBlob,
    /// 已合并到的目标患者，由患者管理服务维护
    pub merged_with_pk: Option<Pk>,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

/// 检查
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub pk: Pk,
    pub patient_pk: Pk,
    pub study_iuid: String,
    pub version: i64,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
    pub rejection_state: RejectionState,
    pub expiration_state: ExpirationState,
    pub expiration_date: Option<NaiveDate>,
    pub expiration_exporter_id: Option<String>,
    /// 字节数；-1 未知，-2 已被认领正在计算
    pub size: i64,
    pub storage_ids: StorageIds,
    pub failed_retrieves: i32,
    pub attributes: AttributesBlob,
}

impl Study {
    pub const UNKNOWN_SIZE: i64 = -1;
    pub const CLAIMED_SIZE: i64 = -2;

    pub fn is_size_unknown(&self) -> bool {
        self.size == Self::UNKNOWN_SIZE
    }
}

/// 系列
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub pk: Pk,
    pub study_pk: Pk,
    pub series_iuid: String,
    pub version: i64,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub rejection_state: RejectionState,
    pub expiration_date: Option<NaiveDate>,
    pub failed_retrieves: i32,
    pub failed_sop_instance_uid_list: Option<String>,
    pub attributes: AttributesBlob,
}

/// 影像实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub pk: Pk,
    pub series_pk: Pk,
    pub sop_iuid: String,
    pub sop_cuid: String,
    /// 被拒绝时引用的拒绝原因代码
    pub rejection_code_pk: Option<Pk>,
    /// 实例本身是拒绝说明 (KOS) 时的标题代码
    pub concept_name_code_pk: Option<Pk>,
    pub created_time: DateTime<Utc>,
}

impl Instance {
    pub fn is_rejected(&self) -> bool {
        self.rejection_code_pk.is_some()
    }

    /// 实例没有子实体，被拒绝即为 `Complete`
    pub fn rejection_state(&self) -> RejectionState {
        if self.is_rejected() {
            RejectionState::Complete
        } else {
            RejectionState::None
        }
    }
}

/// 实例的一个物理副本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub pk: Pk,
    /// 等待物理删除时为 None
    pub instance_pk: Option<Pk>,
    pub storage_id: String,
    pub storage_path: String,
    pub size: i64,
    pub status: LocationStatus,
    pub uid_map_pk: Option<Pk>,
    pub created_time: DateTime<Utc>,
}

/// 跨检查UID重映射记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidMap {
    pub pk: Pk,
    pub mapping: String,
}

/// 预约工作项 (MWL)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MwlItem {
    pub pk: Pk,
    pub patient_pk: Pk,
    pub scheduled_procedure_step_id: String,
    pub study_iuid: String,
}

/// 编码值
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Code {
    pub value: String,
    pub designator: String,
    pub meaning: String,
}

impl Code {
    pub fn new(value: &str, designator: &str, meaning: &str) -> Self {
        Self {
            value: value.to_string(),
            designator: designator.to_string(),
            meaning: meaning.to_string(),
        }
    }

    /// 按 (值, 编码体系) 识别，含义不参与比较
    pub fn key(&self) -> (&str, &str) {
        (&self.value, &self.designator)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, \"{}\")", self.value, self.designator, self.meaning)
    }
}

/// 持久化后的编码
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeEntity {
    pub pk: Pk,
    pub code: Code,
}

/// 检查级聚合查询属性 (按视图缓存)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyQueryAttributes {
    pub study_pk: Pk,
    pub view_id: String,
    pub num_series: i32,
    pub num_instances: i32,
    pub mods_in_study: Option<String>,
}

/// 系列级聚合查询属性 (按视图缓存)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesQueryAttributes {
    pub series_pk: Pk,
    pub view_id: String,
    pub num_instances: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use RejectionState::*;

    #[test]
    fn test_derive_rejection_state() {
        assert_eq!(derive_rejection_state(Vec::new()), None);
        assert_eq!(derive_rejection_state(vec![None, None]), None);
        assert_eq!(derive_rejection_state(vec![Complete, Complete]), Complete);
        assert_eq!(derive_rejection_state(vec![None, Complete]), Partial);
        assert_eq!(derive_rejection_state(vec![Complete, Partial]), Partial);
    }

    #[test]
    fn test_series_state_from_instances() {
        let instance = |pk: Pk, rejection_code_pk: Option<Pk>| Instance {
            pk,
            series_pk: 1,
            sop_iuid: format!("1.2.3.{}", pk),
            sop_cuid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            rejection_code_pk,
            concept_name_code_pk: Option::None,
            created_time: Utc::now(),
        };
        let mixed = vec![instance(1, Some(9)), instance(2, Option::None)];
        assert_eq!(derive_rejection_state(mixed.iter().map(Instance::rejection_state)), Partial);
        let rejected = vec![instance(1, Some(9)), instance(2, Some(9))];
        assert_eq!(derive_rejection_state(rejected.iter().map(Instance::rejection_state)), Complete);
        let kept = vec![instance(2, Option::None)];
        assert_eq!(derive_rejection_state(kept.iter().map(Instance::rejection_state)), None);
    }

    #[test]
    fn test_state_strings() {
        assert_eq!("PARTIAL".parse::<RejectionState>().unwrap(), Partial);
        assert_eq!(
            ExpirationState::FailedToReject.as_str().parse::<ExpirationState>().unwrap(),
            ExpirationState::FailedToReject
        );
        assert_eq!(
            "FAILED_TO_DELETE".parse::<LocationStatus>().unwrap(),
            LocationStatus::FailedToDelete
        );
        assert!("BOGUS".parse::<LocationStatus>().is_err());
    }
}
