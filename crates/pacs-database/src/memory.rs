//! 内存归档数据库
//!
//! 每个工作单元持有全局互斥锁并在数据副本上操作，提交时整体写回，
//! 因此工作单元之间是串行化的。未提交即丢弃时副本被丢弃，锁随之释放。

use crate::models::*;
use crate::store::{ArchiveStore, ArchiveTx, RejectionPurgeKind};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pacs_core::models::*;
use pacs_core::utils::is_valid_dicom_uid;
use pacs_core::{PacsError, Result, StorageIds};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct Tables {
    next_pk: Pk,
    patients: BTreeMap<Pk, Patient>,
    studies: BTreeMap<Pk, Study>,
    series: BTreeMap<Pk, Series>,
    instances: BTreeMap<Pk, Instance>,
    locations: BTreeMap<Pk, Location>,
    uid_maps: BTreeMap<Pk, UidMap>,
    mwl_items: BTreeMap<Pk, MwlItem>,
    codes: BTreeMap<Pk, CodeEntity>,
    study_query_attrs: BTreeMap<(Pk, String), StudyQueryAttributes>,
    series_query_attrs: BTreeMap<(Pk, String), SeriesQueryAttributes>,
}

impl Tables {
    fn next_pk(&mut self) -> Pk {
        self.next_pk += 1;
        self.next_pk
    }

    fn foreign_key(table: &str, pk: Pk) -> PacsError {
        PacsError::Database(format!("foreign key violation: {} {} does not exist", table, pk))
    }

    fn detach(location: &mut Location) {
        location.instance_pk = None;
        location.uid_map_pk = None;
        location.status = LocationStatus::ToDelete;
    }

    fn remove_instance(&mut self, pk: Pk) -> u64 {
        if self.instances.remove(&pk).is_none() {
            return 0;
        }
        for location in self.locations.values_mut() {
            if location.instance_pk == Some(pk) {
                Self::detach(location);
            }
        }
        1
    }

    fn remove_series(&mut self, pk: Pk) -> u64 {
        if self.series.remove(&pk).is_none() {
            return 0;
        }
        let instance_pks: Vec<Pk> = self
            .instances
            .values()
            .filter(|inst| inst.series_pk == pk)
            .map(|inst| inst.pk)
            .collect();
        for instance_pk in instance_pks {
            self.remove_instance(instance_pk);
        }
        self.series_query_attrs.retain(|(series_pk, _), _| *series_pk != pk);
        1
    }

    fn remove_study(&mut self, pk: Pk) -> u64 {
        if self.studies.remove(&pk).is_none() {
            return 0;
        }
        let series_pks: Vec<Pk> = self
            .series
            .values()
            .filter(|series| series.study_pk == pk)
            .map(|series| series.pk)
            .collect();
        for series_pk in series_pks {
            self.remove_series(series_pk);
        }
        self.study_query_attrs.retain(|(study_pk, _), _| *study_pk != pk);
        1
    }

    fn series_pks_of_study(&self, study_pk: Pk) -> Vec<Pk> {
        self.series
            .values()
            .filter(|series| series.study_pk == study_pk)
            .map(|series| series.pk)
            .collect()
    }

    fn study_pk_of_instance(&self, instance_pk: Pk) -> Option<Pk> {
        let instance = self.instances.get(&instance_pk)?;
        self.series.get(&instance.series_pk).map(|series| series.study_pk)
    }
}

/// 内存归档数据库
#[derive(Debug, Clone, Default)]
pub struct MemoryArchiveStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    async fn begin(&self) -> Result<Box<dyn ArchiveTx>> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }
}

/// 内存数据库的工作单元
pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
}

#[async_trait]
impl ArchiveTx for MemoryTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!("Rolling back in-memory unit of work");
        Ok(())
    }

    // ========== 入库 ==========

    async fn create_patient(&mut self, patient: &NewPatient) -> Result<Pk> {
        if let Some(target) = patient.merged_with_pk {
            if !self.work.patients.contains_key(&target) {
                return Err(Tables::foreign_key("patient", target));
            }
        }
        let pk = self.work.next_pk();
        let now = Utc::now();
        self.work.patients.insert(pk, Patient {
            pk,
            attributes: patient.attributes.clone(),
            merged_with_pk: patient.merged_with_pk,
            created_time: now,
            updated_time: now,
        });
        Ok(pk)
    }

    async fn create_study(&mut self, study: &NewStudy) -> Result<Pk> {
        if !self.work.patients.contains_key(&study.patient_pk) {
            return Err(Tables::foreign_key("patient", study.patient_pk));
        }
        if !is_valid_dicom_uid(&study.study_iuid) {
            return Err(PacsError::Validation(format!("invalid study_iuid {}", study.study_iuid)));
        }
        if self.work.studies.values().any(|s| s.study_iuid == study.study_iuid) {
            return Err(PacsError::Database(format!("duplicate study_iuid {}", study.study_iuid)));
        }
        let pk = self.work.next_pk();
        let now = Utc::now();
        self.work.studies.insert(pk, Study {
            pk,
            patient_pk: study.patient_pk,
            study_iuid: study.study_iuid.clone(),
            version: 0,
            created_time: now,
            updated_time: now,
            access_time: study.access_time,
            rejection_state: study.rejection_state,
            expiration_state: study.expiration_state,
            expiration_date: study.expiration_date,
            expiration_exporter_id: None,
            size: study.size,
            storage_ids: study.storage_ids.clone(),
            failed_retrieves: 0,
            attributes: study.attributes.clone(),
        });
        Ok(pk)
    }

    async fn create_series(&mut self, series: &NewSeries) -> Result<Pk> {
        if !self.work.studies.contains_key(&series.study_pk) {
            return Err(Tables::foreign_key("study", series.study_pk));
        }
        let pk = self.work.next_pk();
        let now = Utc::now();
        self.work.series.insert(pk, Series {
            pk,
            study_pk: series.study_pk,
            series_iuid: series.series_iuid.clone(),
            version: 0,
            created_time: now,
            updated_time: now,
            rejection_state: series.rejection_state,
            expiration_date: series.expiration_date,
            failed_retrieves: 0,
            failed_sop_instance_uid_list: None,
            attributes: series.attributes.clone(),
        });
        Ok(pk)
    }

    async fn create_instance(&mut self, instance: &NewInstance) -> Result<Pk> {
        if !self.work.series.contains_key(&instance.series_pk) {
            return Err(Tables::foreign_key("series", instance.series_pk));
        }
        for code_pk in [instance.rejection_code_pk, instance.concept_name_code_pk].into_iter().flatten() {
            if !self.work.codes.contains_key(&code_pk) {
                return Err(Tables::foreign_key("code", code_pk));
            }
        }
        let pk = self.work.next_pk();
        self.work.instances.insert(pk, Instance {
            pk,
            series_pk: instance.series_pk,
            sop_iuid: instance.sop_iuid.clone(),
            sop_cuid: instance.sop_cuid.clone(),
            rejection_code_pk: instance.rejection_code_pk,
            concept_name_code_pk: instance.concept_name_code_pk,
            created_time: instance.created_time,
        });
        Ok(pk)
    }

    async fn create_location(&mut self, location: &NewLocation) -> Result<Pk> {
        if let Some(instance_pk) = location.instance_pk {
            if !self.work.instances.contains_key(&instance_pk) {
                return Err(Tables::foreign_key("instance", instance_pk));
            }
        }
        if let Some(uid_map_pk) = location.uid_map_pk {
            if !self.work.uid_maps.contains_key(&uid_map_pk) {
                return Err(Tables::foreign_key("uidmap", uid_map_pk));
            }
        }
        let pk = self.work.next_pk();
        self.work.locations.insert(pk, Location {
            pk,
            instance_pk: location.instance_pk,
            storage_id: location.storage_id.clone(),
            storage_path: location.storage_path.clone(),
            size: location.size,
            status: location.status,
            uid_map_pk: location.uid_map_pk,
            created_time: Utc::now(),
        });
        Ok(pk)
    }

    async fn create_uid_map(&mut self, mapping: &str) -> Result<Pk> {
        let pk = self.work.next_pk();
        self.work.uid_maps.insert(pk, UidMap {
            pk,
            mapping: mapping.to_string(),
        });
        Ok(pk)
    }

    async fn create_mwl_item(&mut self, item: &NewMwlItem) -> Result<Pk> {
        if !self.work.patients.contains_key(&item.patient_pk) {
            return Err(Tables::foreign_key("patient", item.patient_pk));
        }
        let pk = self.work.next_pk();
        self.work.mwl_items.insert(pk, MwlItem {
            pk,
            patient_pk: item.patient_pk,
            scheduled_procedure_step_id: item.scheduled_procedure_step_id.clone(),
            study_iuid: item.study_iuid.clone(),
        });
        Ok(pk)
    }

    async fn upsert_study_query_attributes(&mut self, attrs: &StudyQueryAttributes) -> Result<()> {
        if !self.work.studies.contains_key(&attrs.study_pk) {
            return Err(Tables::foreign_key("study", attrs.study_pk));
        }
        self.work
            .study_query_attrs
            .insert((attrs.study_pk, attrs.view_id.clone()), attrs.clone());
        Ok(())
    }

    async fn upsert_series_query_attributes(&mut self, attrs: &SeriesQueryAttributes) -> Result<()> {
        if !self.work.series.contains_key(&attrs.series_pk) {
            return Err(Tables::foreign_key("series", attrs.series_pk));
        }
        self.work
            .series_query_attrs
            .insert((attrs.series_pk, attrs.view_id.clone()), attrs.clone());
        Ok(())
    }

    async fn find_or_create_code(&mut self, code: &Code) -> Result<CodeEntity> {
        if let Some(existing) = self.work.codes.values().find(|e| e.code.key() == code.key()) {
            return Ok(existing.clone());
        }
        let pk = self.work.next_pk();
        let entity = CodeEntity { pk, code: code.clone() };
        self.work.codes.insert(pk, entity.clone());
        Ok(entity)
    }

    async fn set_patient_merged_with(&mut self, patient_pk: Pk, merged_with: Option<Pk>) -> Result<u64> {
        if let Some(target) = merged_with {
            if !self.work.patients.contains_key(&target) {
                return Err(Tables::foreign_key("patient", target));
            }
        }
        Ok(match self.work.patients.get_mut(&patient_pk) {
            Some(patient) => {
                patient.merged_with_pk = merged_with;
                patient.updated_time = Utc::now();
                1
            }
            None => 0,
        })
    }

    // ========== 查询 ==========

    async fn get_patient(&mut self, pk: Pk) -> Result<Option<Patient>> {
        Ok(self.work.patients.get(&pk).cloned())
    }

    async fn get_study(&mut self, pk: Pk) -> Result<Option<Study>> {
        Ok(self.work.studies.get(&pk).cloned())
    }

    async fn get_series(&mut self, pk: Pk) -> Result<Option<Series>> {
        Ok(self.work.series.get(&pk).cloned())
    }

    async fn get_instance(&mut self, pk: Pk) -> Result<Option<Instance>> {
        Ok(self.work.instances.get(&pk).cloned())
    }

    async fn get_location(&mut self, pk: Pk) -> Result<Option<Location>> {
        Ok(self.work.locations.get(&pk).cloned())
    }

    async fn get_uid_map(&mut self, pk: Pk) -> Result<Option<UidMap>> {
        Ok(self.work.uid_maps.get(&pk).cloned())
    }

    async fn find_study_query_attributes(&mut self, study_pk: Pk) -> Result<Vec<StudyQueryAttributes>> {
        Ok(self
            .work
            .study_query_attrs
            .values()
            .filter(|attrs| attrs.study_pk == study_pk)
            .cloned()
            .collect())
    }

    async fn find_series_query_attributes(&mut self, series_pk: Pk) -> Result<Vec<SeriesQueryAttributes>> {
        Ok(self
            .work
            .series_query_attrs
            .values()
            .filter(|attrs| attrs.series_pk == series_pk)
            .cloned()
            .collect())
    }

    async fn find_locations_by_storage_and_status(
        &mut self,
        storage_id: &str,
        status: LocationStatus,
        limit: usize,
    ) -> Result<Vec<Location>> {
        Ok(self
            .work
            .locations
            .values()
            .filter(|l| l.storage_id == storage_id && l.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_locations_of_study(&mut self, study_pk: Pk) -> Result<Vec<Location>> {
        let tables = &self.work;
        Ok(tables
            .locations
            .values()
            .filter(|l| {
                l.instance_pk
                    .and_then(|instance_pk| tables.study_pk_of_instance(instance_pk))
                    == Some(study_pk)
            })
            .cloned()
            .collect())
    }

    async fn find_locations_of_instance(&mut self, instance_pk: Pk) -> Result<Vec<Location>> {
        Ok(self
            .work
            .locations
            .values()
            .filter(|l| l.instance_pk == Some(instance_pk))
            .cloned()
            .collect())
    }

    async fn find_locations_for_rejection_purge(
        &mut self,
        kind: RejectionPurgeKind,
        code_pk: Pk,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Location>> {
        let tables = &self.work;
        Ok(tables
            .locations
            .values()
            .filter(|l| {
                let Some(instance) = l.instance_pk.and_then(|pk| tables.instances.get(&pk)) else {
                    return false;
                };
                let code_matches = match kind {
                    RejectionPurgeKind::RejectedInstances => instance.rejection_code_pk == Some(code_pk),
                    RejectionPurgeKind::RejectionNotes => instance.concept_name_code_pk == Some(code_pk),
                };
                code_matches && before.map_or(true, |before| instance.created_time < before)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_study_pks_by_storage_order_by_access_time(
        &mut self,
        storage_id: &str,
        limit: usize,
    ) -> Result<Vec<Pk>> {
        let mut studies: Vec<&Study> = self
            .work
            .studies
            .values()
            .filter(|study| study.storage_ids.contains(storage_id))
            .collect();
        studies.sort_by_key(|study| (study.access_time, study.pk));
        Ok(studies.into_iter().take(limit).map(|study| study.pk).collect())
    }

    async fn find_expired_studies(
        &mut self,
        today: NaiveDate,
        states: &[ExpirationState],
        limit: usize,
    ) -> Result<Vec<Study>> {
        let mut studies: Vec<&Study> = self
            .work
            .studies
            .values()
            .filter(|study| {
                study.expiration_date.map_or(false, |date| date <= today)
                    && states.contains(&study.expiration_state)
            })
            .collect();
        studies.sort_by_key(|study| (study.expiration_date, study.pk));
        Ok(studies.into_iter().take(limit).cloned().collect())
    }

    async fn find_studies_with_unknown_size(
        &mut self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Study>> {
        Ok(self
            .work
            .studies
            .values()
            .filter(|study| study.is_size_unknown() && study.updated_time < updated_before)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_mwl_items_of_patient(&mut self, patient_pk: Pk) -> Result<Vec<MwlItem>> {
        Ok(self
            .work
            .mwl_items
            .values()
            .filter(|item| item.patient_pk == patient_pk)
            .cloned()
            .collect())
    }

    async fn count_instances_of_series(&mut self, series_pk: Pk) -> Result<u64> {
        Ok(self
            .work
            .instances
            .values()
            .filter(|inst| inst.series_pk == series_pk)
            .count() as u64)
    }

    async fn find_instance_rejection_states_of_series(&mut self, series_pk: Pk) -> Result<Vec<RejectionState>> {
        Ok(self
            .work
            .instances
            .values()
            .filter(|inst| inst.series_pk == series_pk)
            .map(Instance::rejection_state)
            .collect())
    }

    async fn count_series_of_study(&mut self, study_pk: Pk) -> Result<u64> {
        Ok(self.work.series_pks_of_study(study_pk).len() as u64)
    }

    async fn find_series_rejection_states_of_study(&mut self, study_pk: Pk) -> Result<Vec<RejectionState>> {
        Ok(self
            .work
            .series
            .values()
            .filter(|series| series.study_pk == study_pk)
            .map(|series| series.rejection_state)
            .collect())
    }

    async fn count_studies_of_patient(&mut self, patient_pk: Pk) -> Result<u64> {
        Ok(self
            .work
            .studies
            .values()
            .filter(|study| study.patient_pk == patient_pk)
            .count() as u64)
    }

    async fn count_patients_merged_with(&mut self, patient_pk: Pk) -> Result<u64> {
        Ok(self
            .work
            .patients
            .values()
            .filter(|p| p.merged_with_pk == Some(patient_pk))
            .count() as u64)
    }

    async fn count_live_references_to_uid_map(&mut self, uid_map_pk: Pk) -> Result<u64> {
        Ok(self
            .work
            .locations
            .values()
            .filter(|l| l.uid_map_pk == Some(uid_map_pk) && l.instance_pk.is_some())
            .count() as u64)
    }

    async fn sum_location_size_of_study(&mut self, study_pk: Pk) -> Result<i64> {
        let tables = &self.work;
        Ok(tables
            .locations
            .values()
            .filter(|l| {
                l.instance_pk
                    .and_then(|instance_pk| tables.study_pk_of_instance(instance_pk))
                    == Some(study_pk)
            })
            .map(|l| l.size)
            .sum())
    }

    // ========== 行锁 ==========

    async fn lock_series(&mut self, _pk: Pk) -> Result<()> {
        // 工作单元已持有全局锁
        Ok(())
    }

    async fn lock_study(&mut self, _pk: Pk) -> Result<()> {
        Ok(())
    }

    // ========== 更新 ==========

    async fn update_location_status(&mut self, pk: Pk, status: LocationStatus) -> Result<u64> {
        Ok(match self.work.locations.get_mut(&pk) {
            Some(location) => {
                location.status = status;
                1
            }
            None => 0,
        })
    }

    async fn detach_location(&mut self, pk: Pk) -> Result<u64> {
        Ok(match self.work.locations.get_mut(&pk) {
            Some(location) => {
                Tables::detach(location);
                1
            }
            None => 0,
        })
    }

    async fn update_series_rejection_state(
        &mut self,
        pk: Pk,
        expected_version: i64,
        state: RejectionState,
    ) -> Result<()> {
        let series = self
            .work
            .series
            .get_mut(&pk)
            .ok_or_else(|| PacsError::not_found(format!("series {}", pk)))?;
        if series.version != expected_version {
            return Err(PacsError::conflict(format!(
                "series {} modified concurrently (version {} != {})",
                pk, series.version, expected_version
            )));
        }
        series.rejection_state = state;
        series.version += 1;
        series.updated_time = Utc::now();
        Ok(())
    }

    async fn update_study_rejection_state(
        &mut self,
        pk: Pk,
        expected_version: i64,
        state: RejectionState,
    ) -> Result<()> {
        let study = self
            .work
            .studies
            .get_mut(&pk)
            .ok_or_else(|| PacsError::not_found(format!("study {}", pk)))?;
        if study.version != expected_version {
            return Err(PacsError::conflict(format!(
                "study {} modified concurrently (version {} != {})",
                pk, study.version, expected_version
            )));
        }
        study.rejection_state = state;
        study.version += 1;
        study.updated_time = Utc::now();
        Ok(())
    }

    async fn claim_expiration_state(
        &mut self,
        study_pk: Pk,
        expected: ExpirationState,
        target: ExpirationState,
    ) -> Result<u64> {
        if expected == target {
            return Ok(0);
        }
        Ok(match self.work.studies.get_mut(&study_pk) {
            Some(study) if study.expiration_state == expected => {
                study.expiration_state = target;
                1
            }
            _ => 0,
        })
    }

    async fn update_study_expiration(
        &mut self,
        study_pk: Pk,
        expiration_date: Option<NaiveDate>,
        state: ExpirationState,
    ) -> Result<u64> {
        Ok(match self.work.studies.get_mut(&study_pk) {
            Some(study) => {
                study.expiration_date = expiration_date;
                study.expiration_state = state;
                1
            }
            None => 0,
        })
    }

    async fn claim_unknown_size_study(&mut self, study_pk: Pk) -> Result<u64> {
        Ok(match self.work.studies.get_mut(&study_pk) {
            Some(study) if study.size == Study::UNKNOWN_SIZE => {
                study.size = Study::CLAIMED_SIZE;
                1
            }
            _ => 0,
        })
    }

    async fn set_study_size_if_claimed(&mut self, study_pk: Pk, size: i64) -> Result<u64> {
        Ok(match self.work.studies.get_mut(&study_pk) {
            Some(study) if study.size == Study::CLAIMED_SIZE => {
                study.size = size;
                1
            }
            _ => 0,
        })
    }

    async fn reset_study_size(&mut self, study_pk: Pk) -> Result<u64> {
        Ok(match self.work.studies.get_mut(&study_pk) {
            Some(study) if study.size != Study::UNKNOWN_SIZE => {
                study.size = Study::UNKNOWN_SIZE;
                1
            }
            _ => 0,
        })
    }

    async fn set_study_storage_ids(&mut self, study_pk: Pk, storage_ids: &StorageIds) -> Result<u64> {
        Ok(match self.work.studies.get_mut(&study_pk) {
            Some(study) if &study.storage_ids != storage_ids => {
                study.storage_ids = storage_ids.clone();
                1
            }
            _ => 0,
        })
    }

    async fn increment_series_failed_retrieves(&mut self, series_pk: Pk, failed_iuids: &str) -> Result<u64> {
        Ok(match self.work.series.get_mut(&series_pk) {
            Some(series) => {
                series.failed_retrieves += 1;
                series.failed_sop_instance_uid_list = Some(failed_iuids.to_string());
                1
            }
            None => 0,
        })
    }

    async fn clear_series_failed_sop_instance_uid_list(&mut self, series_pk: Pk) -> Result<u64> {
        Ok(match self.work.series.get_mut(&series_pk) {
            Some(series) if series.failed_sop_instance_uid_list.is_some() => {
                series.failed_sop_instance_uid_list = None;
                1
            }
            _ => 0,
        })
    }

    // ========== 删除 ==========

    async fn delete_location(&mut self, pk: Pk) -> Result<u64> {
        Ok(self.work.locations.remove(&pk).map_or(0, |_| 1))
    }

    async fn delete_uid_map(&mut self, pk: Pk) -> Result<u64> {
        if self.work.locations.values().any(|l| l.uid_map_pk == Some(pk)) {
            return Err(PacsError::Database(format!("uidmap {} is still referenced", pk)));
        }
        Ok(self.work.uid_maps.remove(&pk).map_or(0, |_| 1))
    }

    async fn delete_instance(&mut self, pk: Pk) -> Result<u64> {
        Ok(self.work.remove_instance(pk))
    }

    async fn delete_series(&mut self, pk: Pk) -> Result<u64> {
        Ok(self.work.remove_series(pk))
    }

    async fn delete_study(&mut self, pk: Pk) -> Result<u64> {
        Ok(self.work.remove_study(pk))
    }

    async fn delete_patient(&mut self, pk: Pk) -> Result<u64> {
        if self.work.studies.values().any(|study| study.patient_pk == pk) {
            return Err(PacsError::Database(format!("patient {} is still referenced by a study", pk)));
        }
        if self.work.mwl_items.values().any(|item| item.patient_pk == pk) {
            return Err(PacsError::Database(format!("patient {} is still referenced by a MWL item", pk)));
        }
        if self.work.patients.values().any(|p| p.merged_with_pk == Some(pk)) {
            return Err(PacsError::Database(format!("patient {} is still referenced by a merged patient", pk)));
        }
        Ok(self.work.patients.remove(&pk).map_or(0, |_| 1))
    }

    async fn delete_series_query_attributes(&mut self, series_pk: Pk) -> Result<u64> {
        let before = self.work.series_query_attrs.len();
        self.work.series_query_attrs.retain(|(pk, _), _| *pk != series_pk);
        Ok((before - self.work.series_query_attrs.len()) as u64)
    }

    async fn delete_study_query_attributes(&mut self, study_pk: Pk) -> Result<u64> {
        let before = self.work.study_query_attrs.len();
        self.work.study_query_attrs.retain(|(pk, _), _| *pk != study_pk);
        Ok((before - self.work.study_query_attrs.len()) as u64)
    }

    async fn delete_mwl_items_of_patient(&mut self, patient_pk: Pk) -> Result<u64> {
        let before = self.work.mwl_items.len();
        self.work.mwl_items.retain(|_, item| item.patient_pk != patient_pk);
        Ok((before - self.work.mwl_items.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_core::Attributes;

    async fn patient_with_study(tx: &mut dyn ArchiveTx) -> (Pk, Pk) {
        let patient = tx
            .create_patient(&NewPatient::from_attributes(&Attributes::new()).unwrap())
            .await
            .unwrap();
        let study = tx.create_study(&NewStudy::new(patient, "1.2.3")).await.unwrap();
        (patient, study)
    }

    #[tokio::test]
    async fn test_dropped_unit_of_work_is_discarded() {
        let store = MemoryArchiveStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            patient_with_study(tx.as_mut()).await;
        }
        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_study(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_publishes() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let (_, study) = patient_with_study(tx.as_mut()).await;
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get_study(study).await.unwrap().unwrap().study_iuid, "1.2.3");
    }

    #[tokio::test]
    async fn test_claim_requires_expected_state_and_distinct_target() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let (_, study) = patient_with_study(tx.as_mut()).await;

        let same = tx
            .claim_expiration_state(study, ExpirationState::Updateable, ExpirationState::Updateable)
            .await
            .unwrap();
        assert_eq!(same, 0);
        let claimed = tx
            .claim_expiration_state(study, ExpirationState::Updateable, ExpirationState::Rejected)
            .await
            .unwrap();
        assert_eq!(claimed, 1);
        let again = tx
            .claim_expiration_state(study, ExpirationState::Updateable, ExpirationState::Rejected)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_stale_version_is_conflict() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let (_, study) = patient_with_study(tx.as_mut()).await;

        tx.update_study_rejection_state(study, 0, RejectionState::Partial).await.unwrap();
        let err = tx
            .update_study_rejection_state(study, 0, RejectionState::None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_patient_with_study_cannot_be_deleted() {
        let store = MemoryArchiveStore::new();
        let mut tx = store.begin().await.unwrap();
        let (patient, study) = patient_with_study(tx.as_mut()).await;

        assert!(tx.delete_patient(patient).await.is_err());
        tx.delete_study(study).await.unwrap();
        assert_eq!(tx.delete_patient(patient).await.unwrap(), 1);
    }
}
