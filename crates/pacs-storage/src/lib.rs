//! # PACS存储模块
//!
//! 物理存储后端、检查保留策略、过期与大小计算认领，以及检索失败记录。

pub mod expiration;
pub mod retention;
pub mod retrieve;
pub mod storage;

pub use expiration::{ClaimOutcome, ExpirationClaimer, SizeReport, StudySizeCalculator};
pub use retention::{Conditions, RetentionContext, RetentionPeriod, RetentionPolicyMatcher, StudyRetentionPolicy};
pub use retrieve::RetrieveFailureTracker;
pub use storage::*;
