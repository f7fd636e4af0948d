//! # PACS Core
//!
//! 归档清理子系统的核心模块，提供所有权树数据模型、状态枚举、错误定义和通用工具。

pub mod attributes;
pub mod error;
pub mod models;
pub mod utils;

pub use attributes::{Attributes, AttributesBlob, IdWithIssuer};
pub use error::{PacsError, Result};
pub use models::*;
pub use utils::StorageIds;
