//! 数据库结构

use crate::connection::DatabasePool;
use pacs_core::Result;

/// 数据库结构管理
pub struct DatabaseQueries<'a> {
    pool: &'a DatabasePool,
}

impl<'a> DatabaseQueries<'a> {
    pub fn new(pool: &'a DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        let tables = [
            // 编码表
            r#"
            CREATE TABLE IF NOT EXISTS code (
                pk BIGSERIAL PRIMARY KEY,
                code_value VARCHAR(64) NOT NULL,
                code_designator VARCHAR(64) NOT NULL,
                code_meaning VARCHAR(255) NOT NULL,
                UNIQUE (code_value, code_designator)
            )
            "#,
            // 患者表
            r#"
            CREATE TABLE IF NOT EXISTS patient (
                pk BIGSERIAL PRIMARY KEY,
                dicomattrs BYTEA NOT NULL,
                merge_fk BIGINT REFERENCES patient(pk),
                created_time TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_time TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            // 检查表
            r#"
            CREATE TABLE IF NOT EXISTS study (
                pk BIGSERIAL PRIMARY KEY,
                patient_fk BIGINT NOT NULL REFERENCES patient(pk),
                study_iuid VARCHAR(64) UNIQUE NOT NULL,
                version BIGINT NOT NULL DEFAULT 0,
                created_time TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_time TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                access_time TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                rejection_state VARCHAR(16) NOT NULL DEFAULT 'NONE',
                expiration_state VARCHAR(32) NOT NULL DEFAULT 'UPDATEABLE',
                expiration_date DATE,
                expiration_exporter_id VARCHAR(64),
                study_size BIGINT NOT NULL DEFAULT -1,
                storage_ids VARCHAR(255),
                failed_retrieves INTEGER NOT NULL DEFAULT 0,
                dicomattrs BYTEA NOT NULL
            )
            "#,
            // 系列表
            r#"
            CREATE TABLE IF NOT EXISTS series (
                pk BIGSERIAL PRIMARY KEY,
                study_fk BIGINT NOT NULL REFERENCES study(pk),
                series_iuid VARCHAR(64) NOT NULL,
                version BIGINT NOT NULL DEFAULT 0,
                created_time TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_time TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                rejection_state VARCHAR(16) NOT NULL DEFAULT 'NONE',
                expiration_date DATE,
                failed_retrieves INTEGER NOT NULL DEFAULT 0,
                failed_iuids VARCHAR(4000),
                dicomattrs BYTEA NOT NULL
            )
            "#,
            // 实例表
            r#"
            CREATE TABLE IF NOT EXISTS instance (
                pk BIGSERIAL PRIMARY KEY,
                series_fk BIGINT NOT NULL REFERENCES series(pk),
                sop_iuid VARCHAR(64) NOT NULL,
                sop_cuid VARCHAR(64) NOT NULL,
                reject_code_fk BIGINT REFERENCES code(pk),
                conc_name_code_fk BIGINT REFERENCES code(pk),
                created_time TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            // UID映射表
            r#"
            CREATE TABLE IF NOT EXISTS uidmap (
                pk BIGSERIAL PRIMARY KEY,
                uidmap TEXT NOT NULL
            )
            "#,
            // 存储位置表，实例删除后行仍保留直到物理删除完成
            r#"
            CREATE TABLE IF NOT EXISTS location (
                pk BIGSERIAL PRIMARY KEY,
                instance_fk BIGINT REFERENCES instance(pk),
                storage_id VARCHAR(64) NOT NULL,
                storage_path VARCHAR(255) NOT NULL,
                object_size BIGINT NOT NULL,
                status VARCHAR(32) NOT NULL DEFAULT 'ACTIVE',
                uidmap_fk BIGINT REFERENCES uidmap(pk),
                created_time TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
            "#,
            // 预约工作项表
            r#"
            CREATE TABLE IF NOT EXISTS mwl_item (
                pk BIGSERIAL PRIMARY KEY,
                patient_fk BIGINT NOT NULL REFERENCES patient(pk),
                sps_id VARCHAR(64) NOT NULL,
                study_iuid VARCHAR(64) NOT NULL
            )
            "#,
            // 查询属性缓存表
            r#"
            CREATE TABLE IF NOT EXISTS study_query_attrs (
                study_fk BIGINT NOT NULL REFERENCES study(pk),
                view_id VARCHAR(64) NOT NULL,
                num_series INTEGER NOT NULL,
                num_instances INTEGER NOT NULL,
                mods_in_study VARCHAR(255),
                PRIMARY KEY (study_fk, view_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS series_query_attrs (
                series_fk BIGINT NOT NULL REFERENCES series(pk),
                view_id VARCHAR(64) NOT NULL,
                num_instances INTEGER NOT NULL,
                PRIMARY KEY (series_fk, view_id)
            )
            "#,
        ];

        for table_sql in tables {
            sqlx::query(table_sql).execute(pool).await?;
        }

        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_study_patient_fk ON study(patient_fk)",
            "CREATE INDEX IF NOT EXISTS idx_study_access_time ON study(access_time)",
            "CREATE INDEX IF NOT EXISTS idx_study_expiration ON study(expiration_date, expiration_state)",
            "CREATE INDEX IF NOT EXISTS idx_study_size ON study(study_size)",
            "CREATE INDEX IF NOT EXISTS idx_series_study_fk ON series(study_fk)",
            "CREATE INDEX IF NOT EXISTS idx_instance_series_fk ON instance(series_fk)",
            "CREATE INDEX IF NOT EXISTS idx_instance_reject_code_fk ON instance(reject_code_fk)",
            "CREATE INDEX IF NOT EXISTS idx_instance_conc_name_code_fk ON instance(conc_name_code_fk)",
            "CREATE INDEX IF NOT EXISTS idx_location_instance_fk ON location(instance_fk)",
            "CREATE INDEX IF NOT EXISTS idx_location_storage_status ON location(storage_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_location_uidmap_fk ON location(uidmap_fk)",
            "CREATE INDEX IF NOT EXISTS idx_mwl_item_patient_fk ON mwl_item(patient_fk)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }
}
