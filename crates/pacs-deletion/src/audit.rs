//! 审计事件

use chrono::{DateTime, Utc};
use pacs_core::models::Pk;
use pacs_core::IdWithIssuer;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// 审计动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Delete => "D",
        }
    }
}

/// 审计事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub action: AuditAction,
    pub patient_pk: Pk,
    pub patient_id: Option<IdWithIssuer>,
    pub timestamp: DateTime<Utc>,
}

/// 审计事件接收者
pub trait AuditEmitter: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// 以结构化日志输出审计事件
#[derive(Debug, Default)]
pub struct TracingAuditEmitter;

impl AuditEmitter for TracingAuditEmitter {
    fn emit(&self, event: &AuditEvent) {
        let patient_id = event
            .patient_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        info!(
            target: "audit",
            event_id = %event.id,
            action = event.action.as_str(),
            patient_pk = event.patient_pk,
            patient_id = %patient_id,
            "Patient record deleted"
        );
    }
}

/// 在内存中收集审计事件
#[derive(Debug, Default)]
pub struct MemoryAuditEmitter {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl AuditEmitter for MemoryAuditEmitter {
    fn emit(&self, event: &AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
