//! # PACS管理模块
//!
//! 归档清理服务的配置模型、分层加载与验证

pub mod config;

pub use config::{
    example_config, ArchiveConfig, ConfigManager, ConfigValidator, DeletionConfig, LogFormat, LoggingConfig,
    RetentionConfig,
};
