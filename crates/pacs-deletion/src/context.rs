//! 删除上下文与结果

use crate::audit::AuditEvent;
use pacs_core::models::{Instance, Patient, Pk, Study};
use serde::{Deserialize, Serialize};

/// 检查删除模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudyDeleteMode {
    /// 常规/孤儿清理：删除父实体前重新检查子实体数
    Off,
    /// 整个检查删除：调用方保证整棵子树都在删除范围内，父实体无条件删除
    WholeStudy { study_pk: Pk },
}

impl StudyDeleteMode {
    pub fn is_whole_study(&self) -> bool {
        matches!(self, StudyDeleteMode::WholeStudy { .. })
    }
}

/// 删除行为设置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionSettings {
    /// 删除患者的最后一个检查时一并删除患者
    pub delete_patient_on_delete_last_study: bool,
}

impl Default for DeletionSettings {
    fn default() -> Self {
        Self {
            delete_patient_on_delete_last_study: true,
        }
    }
}

/// 整个检查删除的请求，执行后带回被删除的检查与患者
#[derive(Debug, Clone)]
pub struct StudyDeleteContext {
    pub study_pk: Pk,
    pub study: Option<Study>,
    pub patient: Option<Patient>,
}

impl StudyDeleteContext {
    pub fn new(study_pk: Pk) -> Self {
        Self {
            study_pk,
            study: None,
            patient: None,
        }
    }
}

/// 一次删除批次的结果
#[derive(Debug, Clone, Default)]
pub struct DeletionOutcome {
    /// 被删除的实例数
    pub removed_instances: usize,
    /// 常规清理模式下被删除的实例，供审计使用
    pub audited_instances: Vec<Instance>,
    pub removed_series: Vec<Pk>,
    pub removed_studies: Vec<Pk>,
    pub deleted_patients: Vec<Pk>,
    pub purged_uid_maps: Vec<Pk>,
    /// 整个检查删除时的目标检查与患者
    pub study: Option<Study>,
    pub patient: Option<Patient>,
    /// 工作单元提交后再发出的审计事件
    pub audit_events: Vec<AuditEvent>,
}

impl DeletionOutcome {
    pub fn is_empty(&self) -> bool {
        self.removed_instances == 0 && self.removed_studies.is_empty()
    }

    pub(crate) fn merge(&mut self, other: DeletionOutcome) {
        self.removed_instances += other.removed_instances;
        self.audited_instances.extend(other.audited_instances);
        self.removed_series.extend(other.removed_series);
        self.removed_studies.extend(other.removed_studies);
        self.deleted_patients.extend(other.deleted_patients);
        self.purged_uid_maps.extend(other.purged_uid_maps);
        self.audit_events.extend(other.audit_events);
        if other.study.is_some() {
            self.study = other.study;
        }
        if other.patient.is_some() {
            self.patient = other.patient;
        }
    }
}
