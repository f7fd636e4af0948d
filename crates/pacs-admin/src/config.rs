//! 配置管理
//!
//! 分层加载归档清理服务的配置：内置默认值 → TOML 文件 → `PACS__SECTION__KEY` 环境变量。

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use pacs_database::PoolSettings;
use pacs_deletion::DeletionSettings;
use pacs_storage::{RetentionPolicyMatcher, StorageDescriptor, StorageKind, StudyRetentionPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    /// 配置数据
    config: Arc<RwLock<ArchiveConfig>>,
    /// 配置文件路径
    config_path: Option<PathBuf>,
    /// 配置验证器
    validator: ConfigValidator,
}

/// 归档清理服务完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// 数据库配置
    pub database: PoolSettings,
    /// 存储配置
    pub storage: Vec<StorageDescriptor>,
    /// 删除配置
    pub deletion: DeletionConfig,
    /// 保留策略
    pub retention: RetentionConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 删除配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletionConfig {
    /// 每批处理的存储位置或检查数
    pub batch_size: usize,
    /// 删除患者的最后一个检查时一并删除患者
    pub delete_patient_on_delete_last_study: bool,
    /// 清理周期 (秒)
    pub purge_interval_secs: u64,
    /// 是否重试删除失败的对象
    pub retry_failed: bool,
    /// 检查最后更新后多久才计算大小 (秒)
    pub study_size_delay_secs: u64,
    /// 是否删除过期检查
    pub expiration_enabled: bool,
}

/// 保留策略配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub policies: Vec<StudyRetentionPolicy>,
}

/// 日志格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别，支持 `EnvFilter` 语法
    pub level: String,
    /// 日志格式
    pub format: LogFormat,
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: &'static str,
    /// 验证函数
    validator: fn(&ArchiveConfig) -> Result<()>,
}

impl ConfigManager {
    /// 加载配置；未指定文件时只使用默认值和环境变量
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = Self::load_config(config_path)?;
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.map(Path::to_path_buf),
            validator,
        })
    }

    fn load_config(config_path: Option<&Path>) -> Result<ArchiveConfig> {
        let defaults = Config::try_from(&ArchiveConfig::default()).context("Failed to build default configuration")?;
        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("PACS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        let config: ArchiveConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        match config_path {
            Some(path) => info!("Configuration loaded from: {}", path.display()),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }

    /// 获取配置
    pub async fn get_config(&self) -> ArchiveConfig {
        self.config.read().await.clone()
    }

    /// 重新加载配置，验证失败时保留原配置
    pub async fn reload_config(&self) -> Result<()> {
        let new_config = Self::load_config(self.config_path.as_deref())?;
        self.validator.validate(&new_config)?;
        *self.config.write().await = new_config;
        info!("Configuration reloaded");
        Ok(())
    }

    /// 保存配置到文件
    pub async fn save_config(&self, path: &Path) -> Result<()> {
        let rendered = self.config.read().await.to_toml()?;
        tokio::fs::write(path, rendered)
            .await
            .with_context(|| format!("Failed to write configuration file {}", path.display()))?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }
}

impl ArchiveConfig {
    /// 以TOML输出生效配置
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn deletion_settings(&self) -> DeletionSettings {
        DeletionSettings {
            delete_patient_on_delete_last_study: self.deletion.delete_patient_on_delete_last_study,
        }
    }

    pub fn retention_matcher(&self) -> Result<RetentionPolicyMatcher> {
        RetentionPolicyMatcher::new(self.retention.policies.clone()).context("Invalid retention policy")
    }
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "database.max_connections",
                validator: |config| {
                    if config.database.max_connections == 0 {
                        anyhow::bail!("Database max connections cannot be 0");
                    }
                    if config.database.min_connections > config.database.max_connections {
                        anyhow::bail!("Database min connections exceed max connections");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "deletion.batch_size",
                validator: |config| {
                    if config.deletion.batch_size == 0 {
                        anyhow::bail!("Deletion batch size cannot be 0");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "deletion.purge_interval_secs",
                validator: |config| {
                    if config.deletion.purge_interval_secs == 0 {
                        anyhow::bail!("Purge interval cannot be 0");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "storage",
                validator: |config| {
                    let mut seen = HashSet::new();
                    for descriptor in &config.storage {
                        if descriptor.storage_id.is_empty() {
                            anyhow::bail!("Storage id cannot be empty");
                        }
                        if !seen.insert(descriptor.storage_id.as_str()) {
                            anyhow::bail!("Duplicate storage id: {}", descriptor.storage_id);
                        }
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "retention.policies",
                validator: |config| config.retention_matcher().map(|_| ()),
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &ArchiveConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {:#}", rule.field_path, e);
                return Err(e.context(format!("Invalid configuration at {}", rule.field_path)));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            delete_patient_on_delete_last_study: true,
            purge_interval_secs: 60,
            retry_failed: true,
            study_size_delay_secs: 300,
            expiration_enabled: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// 示例配置，`--print-default-config` 输出
pub fn example_config() -> ArchiveConfig {
    ArchiveConfig {
        storage: vec![StorageDescriptor {
            storage_id: "fs1".to_string(),
            kind: StorageKind::Local {
                root_path: "/var/lib/pacs/fs1".to_string(),
            },
        }],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_storage::{Conditions, RetentionPeriod};

    fn temp_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("pacs-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = example_config();
        ConfigValidator::new().validate(&config).unwrap();
        assert_eq!(config.deletion.batch_size, 100);
        assert!(config.deletion_settings().delete_patient_on_delete_last_study);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = ArchiveConfig::default();
        config.deletion.batch_size = 0;
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("deletion.batch_size"));
    }

    #[test]
    fn test_duplicate_storage_rejected() {
        let mut config = example_config();
        config.storage.push(config.storage[0].clone());
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_invalid_retention_regex_rejected() {
        let mut config = ArchiveConfig::default();
        config.retention.policies.push(StudyRetentionPolicy {
            common_name: "broken".to_string(),
            priority: 1,
            conditions: Conditions {
                sending_aet: Some("([".to_string()),
                ..Default::default()
            },
            retention_period: RetentionPeriod::days(30),
        });
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = temp_file(
            r#"
[database]
connection_string = "postgresql://pacs@db/archive"

[[storage]]
storage_id = "fs1"
kind = "local"
root_path = "/data/fs1"

[[storage]]
storage_id = "s3"
kind = "s3"
bucket = "pacs"
region = "eu-west-1"

[deletion]
batch_size = 25
delete_patient_on_delete_last_study = false

[[retention.policies]]
common_name = "ct"
priority = 10
retention_period = "P7Y"

[retention.policies.conditions]
sending_aet = "CT.*"
"#,
        );
        let manager = ConfigManager::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        let config = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(manager.get_config());
        assert_eq!(config.database.connection_string, "postgresql://pacs@db/archive");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.deletion.batch_size, 25);
        assert_eq!(config.deletion.purge_interval_secs, 60);
        assert!(!config.deletion_settings().delete_patient_on_delete_last_study);
        assert_eq!(config.storage.len(), 2);
        assert_eq!(
            config.storage[1].kind,
            StorageKind::S3 {
                bucket: "pacs".to_string(),
                region: "eu-west-1".to_string(),
                endpoint: None,
            }
        );
        let policy = &config.retention.policies[0];
        assert_eq!(policy.retention_period.to_string(), "P7Y");
        assert_eq!(policy.conditions.sending_aet.as_deref(), Some("CT.*"));
    }

    #[test]
    fn test_invalid_file_rejected() {
        let path = temp_file("[deletion]\nbatch_size = 0\n");
        let result = ConfigManager::load(Some(&path));
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_to_toml() {
        let rendered = example_config().to_toml().unwrap();
        assert!(rendered.contains("[deletion]"));
        assert!(rendered.contains("batch_size = 100"));
        assert!(rendered.contains("storage_id = \"fs1\""));
    }
}
