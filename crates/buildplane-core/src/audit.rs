//! Audit log writer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

use crate::{Error, ResourceId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Create,
    Write,
    Delete,
    Start,
    Stop,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub time: DateTime<Utc>,
    /// Actor the change is attributed to.
    pub user_id: ResourceId,
    pub organization_id: ResourceId,
    /// Correlates the record with the request or job that produced it.
    pub request_id: ResourceId,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: ResourceId,
    /// Resource before the change.
    pub old: serde_json::Value,
    /// Resource after the change.
    pub new: serde_json::Value,
    /// HTTP-style status of the audited operation.
    pub status: u16,
    pub additional_fields: serde_json::Value,
}

#[async_trait]
pub trait Auditor: Send + Sync {
    async fn write(&self, entry: AuditEntry) -> Result<()>;
}

/// Auditor that writes records to the log.
#[derive(Debug, Default)]
pub struct LogAuditor;

#[async_trait]
impl Auditor for LogAuditor {
    async fn write(&self, entry: AuditEntry) -> Result<()> {
        info!(
            user_id = %entry.user_id,
            resource_type = %entry.resource_type,
            resource_id = %entry.resource_id,
            action = ?entry.action,
            status = entry.status,
            "audit"
        );
        Ok(())
    }
}

/// Auditor that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditor {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Auditor for MemoryAuditor {
    async fn write(&self, entry: AuditEntry) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| Error::Internal("auditor poisoned".to_string()))?
            .push(entry);
        Ok(())
    }
}
