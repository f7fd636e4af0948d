//! # PACS Deletion
//!
//! 级联删除引擎、患者清理、存储回收与过期检查清理。

pub mod audit;
pub mod code;
pub mod context;
pub mod engine;
pub mod metrics;
pub mod patient;
pub mod reclamation;
pub mod sweeper;

pub use audit::{AuditAction, AuditEmitter, AuditEvent, MemoryAuditEmitter, TracingAuditEmitter};
pub use code::{CodeCache, StoreCodeCache};
pub use context::{DeletionOutcome, DeletionSettings, StudyDeleteContext, StudyDeleteMode};
pub use engine::DeletionService;
pub use metrics::DeletionMetrics;
pub use patient::{ArchivePatientService, PatientCleanup, PatientDeletion, PatientMgtContext, PatientService};
pub use reclamation::{PurgeReport, ReclaimReport, StorageReclaimer};
pub use sweeper::{ExpirationSweeper, SweepReport};
