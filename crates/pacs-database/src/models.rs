//! 数据库模型

use chrono::{DateTime, NaiveDate, Utc};
use pacs_core::models::*;
use pacs_core::{Attributes, AttributesBlob, PacsError, Result, StorageIds};
use sqlx::FromRow;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub pk: i64,
    pub dicomattrs: Vec<u8>,
    pub merge_fk: Option<i64>,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

impl From<DbPatient> for Patient {
    fn from(db_patient: DbPatient) -> Self {
        Patient {
            pk: db_patient.pk,
            attributes: AttributesBlob::from_encoded(db_patient.dicomattrs),
            merged_with_pk: db_patient.merge_fk,
            created_time: db_patient.created_time,
            updated_time: db_patient.updated_time,
        }
    }
}

/// 数据库检查表
#[derive(Debug, FromRow)]
pub struct DbStudy {
    pub pk: i64,
    pub patient_fk: i64,
    pub study_iuid: String,
    pub version: i64,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
    pub rejection_state: String, // 存储为字符串，转换为RejectionState枚举
    pub expiration_state: String,
    pub expiration_date: Option<NaiveDate>,
    pub expiration_exporter_id: Option<String>,
    pub study_size: i64,
    pub storage_ids: Option<String>,
    pub failed_retrieves: i32,
    pub dicomattrs: Vec<u8>,
}

impl TryFrom<DbStudy> for Study {
    type Error = PacsError;

    fn try_from(db_study: DbStudy) -> Result<Self> {
        Ok(Study {
            pk: db_study.pk,
            patient_pk: db_study.patient_fk,
            study_iuid: db_study.study_iuid,
            version: db_study.version,
            created_time: db_study.created_time,
            updated_time: db_study.updated_time,
            access_time: db_study.access_time,
            rejection_state: db_study.rejection_state.parse()?,
            expiration_state: db_study.expiration_state.parse()?,
            expiration_date: db_study.expiration_date,
            expiration_exporter_id: db_study.expiration_exporter_id,
            size: db_study.study_size,
            storage_ids: StorageIds::decode(db_study.storage_ids.as_deref()),
            failed_retrieves: db_study.failed_retrieves,
            attributes: AttributesBlob::from_encoded(db_study.dicomattrs),
        })
    }
}

/// 数据库系列表
#[derive(Debug, FromRow)]
pub struct DbSeries {
    pub pk: i64,
    pub study_fk: i64,
    pub series_iuid: String,
    pub version: i64,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub rejection_state: String,
    pub expiration_date: Option<NaiveDate>,
    pub failed_retrieves: i32,
    pub failed_iuids: Option<String>,
    pub dicomattrs: Vec<u8>,
}

impl TryFrom<DbSeries> for Series {
    type Error = PacsError;

    fn try_from(db_series: DbSeries) -> Result<Self> {
        Ok(Series {
            pk: db_series.pk,
            study_pk: db_series.study_fk,
            series_iuid: db_series.series_iuid,
            version: db_series.version,
            created_time: db_series.created_time,
            updated_time: db_series.updated_time,
            rejection_state: db_series.rejection_state.parse()?,
            expiration_date: db_series.expiration_date,
            failed_retrieves: db_series.failed_retrieves,
            failed_sop_instance_uid_list: db_series.failed_iuids,
            attributes: AttributesBlob::from_encoded(db_series.dicomattrs),
        })
    }
}

/// 数据库实例表
#[derive(Debug, FromRow)]
pub struct DbInstance {
    pub pk: i64,
    pub series_fk: i64,
    pub sop_iuid: String,
    pub sop_cuid: String,
    pub reject_code_fk: Option<i64>,
    pub conc_name_code_fk: Option<i64>,
    pub created_time: DateTime<Utc>,
}

impl From<DbInstance> for Instance {
    fn from(db_instance: DbInstance) -> Self {
        Instance {
            pk: db_instance.pk,
            series_pk: db_instance.series_fk,
            sop_iuid: db_instance.sop_iuid,
            sop_cuid: db_instance.sop_cuid,
            rejection_code_pk: db_instance.reject_code_fk,
            concept_name_code_pk: db_instance.conc_name_code_fk,
            created_time: db_instance.created_time,
        }
    }
}

/// 数据库存储位置表
#[derive(Debug, FromRow)]
pub struct DbLocation {
    pub pk: i64,
    pub instance_fk: Option<i64>,
    pub storage_id: String,
    pub storage_path: String,
    pub object_size: i64,
    pub status: String,
    pub uidmap_fk: Option<i64>,
    pub created_time: DateTime<Utc>,
}

impl TryFrom<DbLocation> for Location {
    type Error = PacsError;

    fn try_from(db_location: DbLocation) -> Result<Self> {
        Ok(Location {
            pk: db_location.pk,
            instance_pk: db_location.instance_fk,
            storage_id: db_location.storage_id,
            storage_path: db_location.storage_path,
            size: db_location.object_size,
            status: db_location.status.parse()?,
            uid_map_pk: db_location.uidmap_fk,
            created_time: db_location.created_time,
        })
    }
}

/// 数据库UID映射表
#[derive(Debug, FromRow)]
pub struct DbUidMap {
    pub pk: i64,
    pub uidmap: String,
}

impl From<DbUidMap> for UidMap {
    fn from(db_uid_map: DbUidMap) -> Self {
        UidMap {
            pk: db_uid_map.pk,
            mapping: db_uid_map.uidmap,
        }
    }
}

/// 数据库预约工作项表
#[derive(Debug, FromRow)]
pub struct DbMwlItem {
    pub pk: i64,
    pub patient_fk: i64,
    pub sps_id: String,
    pub study_iuid: String,
}

impl From<DbMwlItem> for MwlItem {
    fn from(db_item: DbMwlItem) -> Self {
        MwlItem {
            pk: db_item.pk,
            patient_pk: db_item.patient_fk,
            scheduled_procedure_step_id: db_item.sps_id,
            study_iuid: db_item.study_iuid,
        }
    }
}

/// 数据库编码表
#[derive(Debug, FromRow)]
pub struct DbCode {
    pub pk: i64,
    pub code_value: String,
    pub code_designator: String,
    pub code_meaning: String,
}

impl From<DbCode> for CodeEntity {
    fn from(db_code: DbCode) -> Self {
        CodeEntity {
            pk: db_code.pk,
            code: Code {
                value: db_code.code_value,
                designator: db_code.code_designator,
                meaning: db_code.code_meaning,
            },
        }
    }
}

/// 数据库检查查询属性表
#[derive(Debug, FromRow)]
pub struct DbStudyQueryAttributes {
    pub study_fk: i64,
    pub view_id: String,
    pub num_series: i32,
    pub num_instances: i32,
    pub mods_in_study: Option<String>,
}

impl From<DbStudyQueryAttributes> for StudyQueryAttributes {
    fn from(row: DbStudyQueryAttributes) -> Self {
        StudyQueryAttributes {
            study_pk: row.study_fk,
            view_id: row.view_id,
            num_series: row.num_series,
            num_instances: row.num_instances,
            mods_in_study: row.mods_in_study,
        }
    }
}

/// 数据库系列查询属性表
#[derive(Debug, FromRow)]
pub struct DbSeriesQueryAttributes {
    pub series_fk: i64,
    pub view_id: String,
    pub num_instances: i32,
}

impl From<DbSeriesQueryAttributes> for SeriesQueryAttributes {
    fn from(row: DbSeriesQueryAttributes) -> Self {
        SeriesQueryAttributes {
            series_pk: row.series_fk,
            view_id: row.view_id,
            num_instances: row.num_instances,
        }
    }
}

// 插入模型 - 用于创建新记录

/// 新患者插入模型
#[derive(Debug, Clone)]
pub struct NewPatient {
    pub attributes: AttributesBlob,
    pub merged_with_pk: Option<Pk>,
}

impl NewPatient {
    pub fn from_attributes(attrs: &Attributes) -> Result<Self> {
        Ok(Self {
            attributes: AttributesBlob::new(attrs)?,
            merged_with_pk: None,
        })
    }
}

/// 新检查插入模型
#[derive(Debug, Clone)]
pub struct NewStudy {
    pub patient_pk: Pk,
    pub study_iuid: String,
    pub access_time: DateTime<Utc>,
    pub rejection_state: RejectionState,
    pub expiration_state: ExpirationState,
    pub expiration_date: Option<NaiveDate>,
    pub size: i64,
    pub storage_ids: StorageIds,
    pub attributes: AttributesBlob,
}

impl NewStudy {
    pub fn new(patient_pk: Pk, study_iuid: &str) -> Self {
        Self {
            patient_pk,
            study_iuid: study_iuid.to_string(),
            access_time: Utc::now(),
            rejection_state: RejectionState::None,
            expiration_state: ExpirationState::Updateable,
            expiration_date: None,
            size: Study::UNKNOWN_SIZE,
            storage_ids: StorageIds::new(),
            attributes: AttributesBlob::default(),
        }
    }
}

/// 新系列插入模型
#[derive(Debug, Clone)]
pub struct NewSeries {
    pub study_pk: Pk,
    pub series_iuid: String,
    pub rejection_state: RejectionState,
    pub expiration_date: Option<NaiveDate>,
    pub attributes: AttributesBlob,
}

impl NewSeries {
    pub fn new(study_pk: Pk, series_iuid: &str) -> Self {
        Self {
            study_pk,
            series_iuid: series_iuid.to_string(),
            rejection_state: RejectionState::None,
            expiration_date: None,
            attributes: AttributesBlob::default(),
        }
    }
}

/// 新实例插入模型
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub series_pk: Pk,
    pub sop_iuid: String,
    pub sop_cuid: String,
    pub rejection_code_pk: Option<Pk>,
    pub concept_name_code_pk: Option<Pk>,
    pub created_time: DateTime<Utc>,
}

impl NewInstance {
    pub fn new(series_pk: Pk, sop_iuid: &str, sop_cuid: &str) -> Self {
        Self {
            series_pk,
            sop_iuid: sop_iuid.to_string(),
            sop_cuid: sop_cuid.to_string(),
            rejection_code_pk: None,
            concept_name_code_pk: None,
            created_time: Utc::now(),
        }
    }
}

/// 新存储位置插入模型
#[derive(Debug, Clone)]
pub struct NewLocation {
    pub instance_pk: Option<Pk>,
    pub storage_id: String,
    pub storage_path: String,
    pub size: i64,
    pub status: LocationStatus,
    pub uid_map_pk: Option<Pk>,
}

impl NewLocation {
    pub fn new(instance_pk: Pk, storage_id: &str, storage_path: &str, size: i64) -> Self {
        Self {
            instance_pk: Some(instance_pk),
            storage_id: storage_id.to_string(),
            storage_path: storage_path.to_string(),
            size,
            status: LocationStatus::Active,
            uid_map_pk: None,
        }
    }
}

/// 新预约工作项插入模型
#[derive(Debug, Clone)]
pub struct NewMwlItem {
    pub patient_pk: Pk,
    pub scheduled_procedure_step_id: String,
    pub study_iuid: String,
}
