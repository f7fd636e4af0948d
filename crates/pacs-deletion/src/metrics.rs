//! 清理指标

use crate::context::DeletionOutcome;
use pacs_core::{PacsError, Result};
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

/// 清理相关的prometheus计数器
#[derive(Clone)]
pub struct DeletionMetrics {
    registry: Registry,
    removed_instances_total: IntCounter,
    removed_studies_total: IntCounter,
    deleted_patients_total: IntCounter,
    deleted_locations_total: IntCounter,
    failed_locations_total: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help)).map_err(metrics_error)?;
    registry.register(Box::new(counter.clone())).map_err(metrics_error)?;
    Ok(counter)
}

fn metrics_error(e: prometheus::Error) -> PacsError {
    PacsError::Internal(format!("metrics: {}", e))
}

impl DeletionMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            removed_instances_total: counter(
                &registry,
                "pacs_deletion_removed_instances_total",
                "Instances removed by the deletion engine",
            )?,
            removed_studies_total: counter(
                &registry,
                "pacs_deletion_removed_studies_total",
                "Studies removed by the deletion engine",
            )?,
            deleted_patients_total: counter(
                &registry,
                "pacs_deletion_deleted_patients_total",
                "Patients deleted after their last study was removed",
            )?,
            deleted_locations_total: counter(
                &registry,
                "pacs_deletion_deleted_locations_total",
                "Storage objects physically deleted",
            )?,
            failed_locations_total: counter(
                &registry,
                "pacs_deletion_failed_locations_total",
                "Storage objects that failed to delete",
            )?,
            registry,
        })
    }

    pub fn record_outcome(&self, outcome: &DeletionOutcome) {
        self.removed_instances_total.inc_by(outcome.removed_instances as u64);
        self.removed_studies_total.inc_by(outcome.removed_studies.len() as u64);
        self.deleted_patients_total.inc_by(outcome.deleted_patients.len() as u64);
    }

    pub fn record_purge(&self, deleted: usize, failed: usize) {
        self.deleted_locations_total.inc_by(deleted as u64);
        self.failed_locations_total.inc_by(failed as u64);
    }

    pub fn removed_instances(&self) -> u64 {
        self.removed_instances_total.get()
    }

    pub fn failed_locations(&self) -> u64 {
        self.failed_locations_total.get()
    }

    /// prometheus文本格式
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| PacsError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_export() {
        let metrics = DeletionMetrics::new().unwrap();
        let outcome = DeletionOutcome {
            removed_instances: 3,
            removed_studies: vec![7],
            ..Default::default()
        };
        metrics.record_outcome(&outcome);
        metrics.record_purge(2, 1);

        assert_eq!(metrics.removed_instances(), 3);
        assert_eq!(metrics.failed_locations(), 1);
        let text = metrics.gather_text().unwrap();
        assert!(text.contains("pacs_deletion_removed_instances_total 3"));
        assert!(text.contains("pacs_deletion_deleted_locations_total 2"));
    }
}
