//! # PACS数据库模块
//!
//! 归档所有权树的持久化接口。`ArchiveStore` 打开工作单元，`ArchiveTx` 提供清理引擎
//! 需要的全部查询与条件更新。提供PostgreSQL实现与内存实现。

pub mod connection;
pub mod fixtures;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::{DatabasePool, PoolSettings};
pub use memory::MemoryArchiveStore;
pub use models::*;
pub use postgres::PgArchiveStore;
pub use queries::DatabaseQueries;
pub use store::{ArchiveStore, ArchiveTx, RejectionPurgeKind};
