//! PostgreSQL归档数据库
//!
//! 每个工作单元对应一个数据库事务。条件更新以受影响行数判断是否认领成功，
//! 序列化失败与死锁由错误转换映射为 `Conflict`。

use crate::connection::DatabasePool;
use crate::models::*;
use crate::store::{ArchiveStore, ArchiveTx, RejectionPurgeKind};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pacs_core::models::*;
use pacs_core::{PacsError, Result, StorageIds};
use sqlx::{Postgres, Transaction};
use tracing::debug;

const DETACH_LOCATIONS_OF_INSTANCE: &str = r#"
    UPDATE location SET instance_fk = NULL, uidmap_fk = NULL, status = 'TO_DELETE'
    WHERE instance_fk = $1
"#;

const DETACH_LOCATIONS_OF_SERIES: &str = r#"
    UPDATE location SET instance_fk = NULL, uidmap_fk = NULL, status = 'TO_DELETE'
    WHERE instance_fk IN (SELECT pk FROM instance WHERE series_fk = $1)
"#;

const DETACH_LOCATIONS_OF_STUDY: &str = r#"
    UPDATE location SET instance_fk = NULL, uidmap_fk = NULL, status = 'TO_DELETE'
    WHERE instance_fk IN (
        SELECT i.pk FROM instance i JOIN series se ON i.series_fk = se.pk
        WHERE se.study_fk = $1
    )
"#;

/// PostgreSQL归档数据库
#[derive(Debug, Clone)]
pub struct PgArchiveStore {
    pool: DatabasePool,
}

impl PgArchiveStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArchiveStore for PgArchiveStore {
    async fn begin(&self) -> Result<Box<dyn ArchiveTx>> {
        let tx = self.pool.pool().begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

/// PostgreSQL事务
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn limit_of(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn count_of(count: i64) -> u64 {
    u64::try_from(count).unwrap_or_default()
}

impl PgTx {
    async fn count(&mut self, sql: &str, pk: Pk) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(sql).bind(pk).fetch_one(&mut *self.tx).await?;
        Ok(count_of(count))
    }

    async fn execute_by_pk(&mut self, sql: &str, pk: Pk) -> Result<u64> {
        let result = sqlx::query(sql).bind(pk).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    /// 版本条件更新未命中时区分行不存在与并发修改
    async fn versioned_miss(&mut self, table: &str, pk: Pk, expected_version: i64) -> PacsError {
        let sql = format!("SELECT version FROM {} WHERE pk = $1", table);
        match sqlx::query_scalar::<_, i64>(&sql)
            .bind(pk)
            .fetch_optional(&mut *self.tx)
            .await
        {
            Ok(Some(version)) => PacsError::conflict(format!(
                "{} {} modified concurrently (version {} != {})",
                table, pk, version, expected_version
            )),
            Ok(None) => PacsError::not_found(format!("{} {}", table, pk)),
            Err(e) => e.into(),
        }
    }
}

#[async_trait]
impl ArchiveTx for PgTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.rollback().await?;
        debug!("Transaction rolled back");
        Ok(())
    }

    // ========== 入库 ==========

    async fn create_patient(&mut self, patient: &NewPatient) -> Result<Pk> {
        let pk = sqlx::query_scalar(
            "INSERT INTO patient (dicomattrs, merge_fk) VALUES ($1, $2) RETURNING pk",
        )
        .bind(patient.attributes.encoded())
        .bind(patient.merged_with_pk)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(pk)
    }

    async fn create_study(&mut self, study: &NewStudy) -> Result<Pk> {
        let pk = sqlx::query_scalar(r#"
            INSERT INTO study (patient_fk, study_iuid, access_time, rejection_state, expiration_state,
                               expiration_date, study_size, storage_ids, dicomattrs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING pk
        "#)
        .bind(study.patient_pk)
        .bind(&study.study_iuid)
        .bind(study.access_time)
        .bind(study.rejection_state.as_str())
        .bind(study.expiration_state.as_str())
        .bind(study.expiration_date)
        .bind(study.size)
        .bind(study.storage_ids.encode())
        .bind(study.attributes.encoded())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(pk)
    }

    async fn create_series(&mut self, series: &NewSeries) -> Result<Pk> {
        let pk = sqlx::query_scalar(r#"
            INSERT INTO series (study_fk, series_iuid, rejection_state, expiration_date, dicomattrs)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING pk
        "#)
        .bind(series.study_pk)
        .bind(&series.series_iuid)
        .bind(series.rejection_state.as_str())
        .bind(series.expiration_date)
        .bind(series.attributes.encoded())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(pk)
    }

    async fn create_instance(&mut self, instance: &NewInstance) -> Result<Pk> {
        let pk = sqlx::query_scalar(r#"
            INSERT INTO instance (series_fk, sop_iuid, sop_cuid, reject_code_fk, conc_name_code_fk, created_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING pk
        "#)
        .bind(instance.series_pk)
        .bind(&instance.sop_iuid)
        .bind(&instance.sop_cuid)
        .bind(instance.rejection_code_pk)
        .bind(instance.concept_name_code_pk)
        .bind(instance.created_time)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(pk)
    }

    async fn create_location(&mut self, location: &NewLocation) -> Result<Pk> {
        let pk = sqlx::query_scalar(r#"
            INSERT INTO location (instance_fk, storage_id, storage_path, object_size, status, uidmap_fk)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING pk
        "#)
        .bind(location.instance_pk)
        .bind(&location.storage_id)
        .bind(&location.storage_path)
        .bind(location.size)
        .bind(location.status.as_str())
        .bind(location.uid_map_pk)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(pk)
    }

    async fn create_uid_map(&mut self, mapping: &str) -> Result<Pk> {
        let pk = sqlx::query_scalar("INSERT INTO uidmap (uidmap) VALUES ($1) RETURNING pk")
            .bind(mapping)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(pk)
    }

    async fn create_mwl_item(&mut self, item: &NewMwlItem) -> Result<Pk> {
        let pk = sqlx::query_scalar(
            "INSERT INTO mwl_item (patient_fk, sps_id, study_iuid) VALUES ($1, $2, $3) RETURNING pk",
        )
        .bind(item.patient_pk)
        .bind(&item.scheduled_procedure_step_id)
        .bind(&item.study_iuid)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(pk)
    }

    async fn upsert_study_query_attributes(&mut self, attrs: &StudyQueryAttributes) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO study_query_attrs (study_fk, view_id, num_series, num_instances, mods_in_study)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (study_fk, view_id) DO UPDATE
            SET num_series = EXCLUDED.num_series,
                num_instances = EXCLUDED.num_instances,
                mods_in_study = EXCLUDED.mods_in_study
        "#)
        .bind(attrs.study_pk)
        .bind(&attrs.view_id)
        .bind(attrs.num_series)
        .bind(attrs.num_instances)
        .bind(&attrs.mods_in_study)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_series_query_attributes(&mut self, attrs: &SeriesQueryAttributes) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO series_query_attrs (series_fk, view_id, num_instances)
            VALUES ($1, $2, $3)
            ON CONFLICT (series_fk, view_id) DO UPDATE
            SET num_instances = EXCLUDED.num_instances
        "#)
        .bind(attrs.series_pk)
        .bind(&attrs.view_id)
        .bind(attrs.num_instances)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_or_create_code(&mut self, code: &Code) -> Result<CodeEntity> {
        sqlx::query(r#"
            INSERT INTO code (code_value, code_designator, code_meaning)
            VALUES ($1, $2, $3)
            ON CONFLICT (code_value, code_designator) DO NOTHING
        "#)
        .bind(&code.value)
        .bind(&code.designator)
        .bind(&code.meaning)
        .execute(&mut *self.tx)
        .await?;

        let row = sqlx::query_as::<_, DbCode>(
            "SELECT * FROM code WHERE code_value = $1 AND code_designator = $2",
        )
        .bind(&code.value)
        .bind(&code.designator)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn set_patient_merged_with(&mut self, patient_pk: Pk, merged_with: Option<Pk>) -> Result<u64> {
        let result = sqlx::query("UPDATE patient SET merge_fk = $1, updated_time = NOW() WHERE pk = $2")
            .bind(merged_with)
            .bind(patient_pk)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    // ========== 查询 ==========

    async fn get_patient(&mut self, pk: Pk) -> Result<Option<Patient>> {
        let row = sqlx::query_as::<_, DbPatient>("SELECT * FROM patient WHERE pk = $1")
            .bind(pk)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(Patient::from))
    }

    async fn get_study(&mut self, pk: Pk) -> Result<Option<Study>> {
        let row = sqlx::query_as::<_, DbStudy>("SELECT * FROM study WHERE pk = $1")
            .bind(pk)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(Study::try_from).transpose()
    }

    async fn get_series(&mut self, pk: Pk) -> Result<Option<Series>> {
        let row = sqlx::query_as::<_, DbSeries>("SELECT * FROM series WHERE pk = $1")
            .bind(pk)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(Series::try_from).transpose()
    }

    async fn get_instance(&mut self, pk: Pk) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, DbInstance>("SELECT * FROM instance WHERE pk = $1")
            .bind(pk)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(Instance::from))
    }

    async fn get_location(&mut self, pk: Pk) -> Result<Option<Location>> {
        let row = sqlx::query_as::<_, DbLocation>("SELECT * FROM location WHERE pk = $1")
            .bind(pk)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(Location::try_from).transpose()
    }

    async fn get_uid_map(&mut self, pk: Pk) -> Result<Option<UidMap>> {
        let row = sqlx::query_as::<_, DbUidMap>("SELECT * FROM uidmap WHERE pk = $1")
            .bind(pk)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(UidMap::from))
    }

    async fn find_study_query_attributes(&mut self, study_pk: Pk) -> Result<Vec<StudyQueryAttributes>> {
        let rows = sqlx::query_as::<_, DbStudyQueryAttributes>(
            "SELECT * FROM study_query_attrs WHERE study_fk = $1",
        )
        .bind(study_pk)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(StudyQueryAttributes::from).collect())
    }

    async fn find_series_query_attributes(&mut self, series_pk: Pk) -> Result<Vec<SeriesQueryAttributes>> {
        let rows = sqlx::query_as::<_, DbSeriesQueryAttributes>(
            "SELECT * FROM series_query_attrs WHERE series_fk = $1",
        )
        .bind(series_pk)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.into_iter().map(SeriesQueryAttributes::from).collect())
    }

    async fn find_locations_by_storage_and_status(
        &mut self,
        storage_id: &str,
        status: LocationStatus,
        limit: usize,
    ) -> Result<Vec<Location>> {
        let rows = sqlx::query_as::<_, DbLocation>(
            "SELECT * FROM location WHERE storage_id = $1 AND status = $2 ORDER BY pk LIMIT $3",
        )
        .bind(storage_id)
        .bind(status.as_str())
        .bind(limit_of(limit))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(Location::try_from).collect()
    }

    async fn find_locations_of_study(&mut self, study_pk: Pk) -> Result<Vec<Location>> {
        let rows = sqlx::query_as::<_, DbLocation>(r#"
            SELECT l.* FROM location l
            JOIN instance i ON l.instance_fk = i.pk
            JOIN series se ON i.series_fk = se.pk
            WHERE se.study_fk = $1
            ORDER BY l.pk
        "#)
        .bind(study_pk)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(Location::try_from).collect()
    }

    async fn find_locations_of_instance(&mut self, instance_pk: Pk) -> Result<Vec<Location>> {
        let rows = sqlx::query_as::<_, DbLocation>("SELECT * FROM location WHERE instance_fk = $1 ORDER BY pk")
            .bind(instance_pk)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.into_iter().map(Location::try_from).collect()
    }

    async fn find_locations_for_rejection_purge(
        &mut self,
        kind: RejectionPurgeKind,
        code_pk: Pk,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Location>> {
        let code_column = match kind {
            RejectionPurgeKind::RejectedInstances => "reject_code_fk",
            RejectionPurgeKind::RejectionNotes => "conc_name_code_fk",
        };
        let sql = format!(r#"
            SELECT l.* FROM location l
            JOIN instance i ON l.instance_fk = i.pk
            WHERE i.{} = $1 AND ($2::TIMESTAMPTZ IS NULL OR i.created_time < $2)
            ORDER BY l.pk
            LIMIT $3
        "#, code_column);
        let rows = sqlx::query_as::<_, DbLocation>(&sql)
            .bind(code_pk)
            .bind(before)
            .bind(limit_of(limit))
            .fetch_all(&mut *self.tx)
            .await?;
        rows.into_iter().map(Location::try_from).collect()
    }

    async fn find_study_pks_by_storage_order_by_access_time(
        &mut self,
        storage_id: &str,
        limit: usize,
    ) -> Result<Vec<Pk>> {
        // storage_ids 以反斜杠分隔，逐项比较
        let pks = sqlx::query_scalar(r#"
            SELECT pk FROM study
            WHERE $1 = ANY(string_to_array(storage_ids, E'\\'))
            ORDER BY access_time, pk
            LIMIT $2
        "#)
        .bind(storage_id)
        .bind(limit_of(limit))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(pks)
    }

    async fn find_expired_studies(
        &mut self,
        today: NaiveDate,
        states: &[ExpirationState],
        limit: usize,
    ) -> Result<Vec<Study>> {
        let states: Vec<&str> = states.iter().map(ExpirationState::as_str).collect();
        let rows = sqlx::query_as::<_, DbStudy>(r#"
            SELECT * FROM study
            WHERE expiration_date <= $1 AND expiration_state = ANY($2)
            ORDER BY expiration_date, pk
            LIMIT $3
        "#)
        .bind(today)
        .bind(&states)
        .bind(limit_of(limit))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(Study::try_from).collect()
    }

    async fn find_studies_with_unknown_size(
        &mut self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Study>> {
        let rows = sqlx::query_as::<_, DbStudy>(
            "SELECT * FROM study WHERE study_size = -1 AND updated_time < $1 ORDER BY pk LIMIT $2",
        )
        .bind(updated_before)
        .bind(limit_of(limit))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(Study::try_from).collect()
    }

    async fn find_mwl_items_of_patient(&mut self, patient_pk: Pk) -> Result<Vec<MwlItem>> {
        let rows = sqlx::query_as::<_, DbMwlItem>("SELECT * FROM mwl_item WHERE patient_fk = $1")
            .bind(patient_pk)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().map(MwlItem::from).collect())
    }

    async fn count_instances_of_series(&mut self, series_pk: Pk) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM instance WHERE series_fk = $1", series_pk).await
    }

    async fn find_instance_rejection_states_of_series(&mut self, series_pk: Pk) -> Result<Vec<RejectionState>> {
        let rejected: Vec<bool> =
            sqlx::query_scalar("SELECT reject_code_fk IS NOT NULL FROM instance WHERE series_fk = $1")
                .bind(series_pk)
                .fetch_all(&mut *self.tx)
                .await?;
        Ok(rejected
            .into_iter()
            .map(|r| if r { RejectionState::Complete } else { RejectionState::None })
            .collect())
    }

    async fn count_series_of_study(&mut self, study_pk: Pk) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM series WHERE study_fk = $1", study_pk).await
    }

    async fn find_series_rejection_states_of_study(&mut self, study_pk: Pk) -> Result<Vec<RejectionState>> {
        let states: Vec<String> = sqlx::query_scalar("SELECT rejection_state FROM series WHERE study_fk = $1")
            .bind(study_pk)
            .fetch_all(&mut *self.tx)
            .await?;
        states.iter().map(|state| state.parse()).collect()
    }

    async fn count_studies_of_patient(&mut self, patient_pk: Pk) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM study WHERE patient_fk = $1", patient_pk).await
    }

    async fn count_patients_merged_with(&mut self, patient_pk: Pk) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM patient WHERE merge_fk = $1", patient_pk).await
    }

    async fn count_live_references_to_uid_map(&mut self, uid_map_pk: Pk) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM location WHERE uidmap_fk = $1 AND instance_fk IS NOT NULL",
            uid_map_pk,
        )
        .await
    }

    async fn sum_location_size_of_study(&mut self, study_pk: Pk) -> Result<i64> {
        let size = sqlx::query_scalar(r#"
            SELECT COALESCE(SUM(l.object_size), 0)::BIGINT FROM location l
            JOIN instance i ON l.instance_fk = i.pk
            JOIN series se ON i.series_fk = se.pk
            WHERE se.study_fk = $1
        "#)
        .bind(study_pk)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(size)
    }

    // ========== 行锁 ==========

    async fn lock_series(&mut self, pk: Pk) -> Result<()> {
        sqlx::query("SELECT pk FROM series WHERE pk = $1 FOR UPDATE")
            .bind(pk)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn lock_study(&mut self, pk: Pk) -> Result<()> {
        sqlx::query("SELECT pk FROM study WHERE pk = $1 FOR UPDATE")
            .bind(pk)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(())
    }

    // ========== 更新 ==========

    async fn update_location_status(&mut self, pk: Pk, status: LocationStatus) -> Result<u64> {
        let result = sqlx::query("UPDATE location SET status = $1 WHERE pk = $2")
            .bind(status.as_str())
            .bind(pk)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn detach_location(&mut self, pk: Pk) -> Result<u64> {
        self.execute_by_pk(
            "UPDATE location SET instance_fk = NULL, uidmap_fk = NULL, status = 'TO_DELETE' WHERE pk = $1",
            pk,
        )
        .await
    }

    async fn update_series_rejection_state(
        &mut self,
        pk: Pk,
        expected_version: i64,
        state: RejectionState,
    ) -> Result<()> {
        let result = sqlx::query(r#"
            UPDATE series SET rejection_state = $1, version = version + 1, updated_time = NOW()
            WHERE pk = $2 AND version = $3
        "#)
        .bind(state.as_str())
        .bind(pk)
        .bind(expected_version)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.versioned_miss("series", pk, expected_version).await);
        }
        Ok(())
    }

    async fn update_study_rejection_state(
        &mut self,
        pk: Pk,
        expected_version: i64,
        state: RejectionState,
    ) -> Result<()> {
        let result = sqlx::query(r#"
            UPDATE study SET rejection_state = $1, version = version + 1, updated_time = NOW()
            WHERE pk = $2 AND version = $3
        "#)
        .bind(state.as_str())
        .bind(pk)
        .bind(expected_version)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.versioned_miss("study", pk, expected_version).await);
        }
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
        let result = sqlx::query(
            "UPDATE study SET expiration_state = $1 WHERE pk = $2 AND expiration_state = $3",
        )
        .bind(target.as_str())
        .bind(study_pk)
        .bind(expected.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn update_study_expiration(
        &mut self,
        study_pk: Pk,
        expiration_date: Option<NaiveDate>,
        state: ExpirationState,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE study SET expiration_date = $1, expiration_state = $2 WHERE pk = $3",
        )
        .bind(expiration_date)
        .bind(state.as_str())
        .bind(study_pk)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_unknown_size_study(&mut self, study_pk: Pk) -> Result<u64> {
        self.execute_by_pk("UPDATE study SET study_size = -2 WHERE pk = $1 AND study_size = -1", study_pk)
            .await
    }

    async fn set_study_size_if_claimed(&mut self, study_pk: Pk, size: i64) -> Result<u64> {
        let result = sqlx::query("UPDATE study SET study_size = $1 WHERE pk = $2 AND study_size = -2")
            .bind(size)
            .bind(study_pk)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn reset_study_size(&mut self, study_pk: Pk) -> Result<u64> {
        self.execute_by_pk("UPDATE study SET study_size = -1 WHERE pk = $1 AND study_size != -1", study_pk)
            .await
    }

    async fn set_study_storage_ids(&mut self, study_pk: Pk, storage_ids: &StorageIds) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE study SET storage_ids = $1 WHERE pk = $2 AND storage_ids IS DISTINCT FROM $1",
        )
        .bind(storage_ids.encode())
        .bind(study_pk)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn increment_series_failed_retrieves(&mut self, series_pk: Pk, failed_iuids: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE series SET failed_retrieves = failed_retrieves + 1, failed_iuids = $1 WHERE pk = $2",
        )
        .bind(failed_iuids)
        .bind(series_pk)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_series_failed_sop_instance_uid_list(&mut self, series_pk: Pk) -> Result<u64> {
        self.execute_by_pk(
            "UPDATE series SET failed_iuids = NULL WHERE pk = $1 AND failed_iuids IS NOT NULL",
            series_pk,
        )
        .await
    }

    // ========== 删除 ==========

    async fn delete_location(&mut self, pk: Pk) -> Result<u64> {
        self.execute_by_pk("DELETE FROM location WHERE pk = $1", pk).await
    }

    async fn delete_uid_map(&mut self, pk: Pk) -> Result<u64> {
        self.execute_by_pk("DELETE FROM uidmap WHERE pk = $1", pk).await
    }

    async fn delete_instance(&mut self, pk: Pk) -> Result<u64> {
        self.execute_by_pk(DETACH_LOCATIONS_OF_INSTANCE, pk).await?;
        self.execute_by_pk("DELETE FROM instance WHERE pk = $1", pk).await
    }

    async fn delete_series(&mut self, pk: Pk) -> Result<u64> {
        self.execute_by_pk(DETACH_LOCATIONS_OF_SERIES, pk).await?;
        self.execute_by_pk("DELETE FROM instance WHERE series_fk = $1", pk).await?;
        self.execute_by_pk("DELETE FROM series_query_attrs WHERE series_fk = $1", pk).await?;
        self.execute_by_pk("DELETE FROM series WHERE pk = $1", pk).await
    }

    async fn delete_study(&mut self, pk: Pk) -> Result<u64> {
        self.execute_by_pk(DETACH_LOCATIONS_OF_STUDY, pk).await?;
        self.execute_by_pk(
            "DELETE FROM instance WHERE series_fk IN (SELECT pk FROM series WHERE study_fk = $1)",
            pk,
        )
        .await?;
        self.execute_by_pk(
            "DELETE FROM series_query_attrs WHERE series_fk IN (SELECT pk FROM series WHERE study_fk = $1)",
            pk,
        )
        .await?;
        self.execute_by_pk("DELETE FROM series WHERE study_fk = $1", pk).await?;
        self.execute_by_pk("DELETE FROM study_query_attrs WHERE study_fk = $1", pk).await?;
        self.execute_by_pk("DELETE FROM study WHERE pk = $1", pk).await
    }

    async fn delete_patient(&mut self, pk: Pk) -> Result<u64> {
        self.execute_by_pk("DELETE FROM patient WHERE pk = $1", pk).await
    }

    async fn delete_series_query_attributes(&mut self, series_pk: Pk) -> Result<u64> {
        self.execute_by_pk("DELETE FROM series_query_attrs WHERE series_fk = $1", series_pk).await
    }

    async fn delete_study_query_attributes(&mut self, study_pk: Pk) -> Result<u64> {
        self.execute_by_pk("DELETE FROM study_query_attrs WHERE study_fk = $1", study_pk).await
    }

    async fn delete_mwl_items_of_patient(&mut self, patient_pk: Pk) -> Result<u64> {
        self.execute_by_pk("DELETE FROM mwl_item WHERE patient_fk = $1", patient_pk).await
    }
}
