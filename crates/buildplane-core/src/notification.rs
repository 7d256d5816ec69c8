//! Notification enqueueing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tracing::info;

use crate::{Error, ResourceId, Result};

/// "Workspace manually updated" notification template.
pub const TEMPLATE_WORKSPACE_MANUALLY_UPDATED: ResourceId =
    ResourceId::from_u128(0xd089fe7b_d5c5_4c0c_aaf5_689859f7d392);

/// A notification awaiting delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub recipient_id: ResourceId,
    pub template_id: ResourceId,
    /// Flat string labels rendered into the message.
    pub labels: BTreeMap<String, String>,
    /// Structured payload for richer renderers.
    pub data: serde_json::Value,
    /// Which component enqueued it.
    pub created_by: String,
    /// Entities the notification is about.
    pub targets: Vec<ResourceId>,
}

/// Hands notifications to the delivery subsystem.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn enqueue(&self, notification: Notification) -> Result<()>;
}

/// Notifier that only logs; used when no delivery backend is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn enqueue(&self, notification: Notification) -> Result<()> {
        info!(
            recipient_id = %notification.recipient_id,
            template_id = %notification.template_id,
            created_by = %notification.created_by,
            "Notification enqueued"
        );
        Ok(())
    }
}

/// Notifier that records every notification in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: Mutex<HashSet<ResourceId>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every notification addressed to `recipient_id`.
    pub fn fail_for(&self, recipient_id: ResourceId) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(recipient_id);
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn enqueue(&self, notification: Notification) -> Result<()> {
        let rejected = self
            .failing
            .lock()
            .map(|f| f.contains(&notification.recipient_id))
            .unwrap_or(false);
        if rejected {
            return Err(Error::Internal(format!(
                "cannot deliver to {}",
                notification.recipient_id
            )));
        }
        self.sent
            .lock()
            .map_err(|_| Error::Internal("notifier poisoned".to_string()))?
            .push(notification);
        Ok(())
    }
}
