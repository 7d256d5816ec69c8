//! Pub/sub transport and the events published on it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use crate::{Error, ResourceId, Result};

/// Channel idle workers listen on for newly posted jobs.
pub const JOB_POSTED_CHANNEL: &str = "provisioner_job_posted";

/// Channel carrying state changes for every workspace of one owner.
pub fn workspace_event_channel(owner_id: ResourceId) -> String {
    format!("workspace_owner:{owner_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceEventKind {
    StateChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceEvent {
    pub kind: WorkspaceEventKind,
    pub workspace_id: ResourceId,
}

impl WorkspaceEvent {
    pub fn state_change(workspace_id: ResourceId) -> Self {
        Self {
            kind: WorkspaceEventKind::StateChange,
            workspace_id,
        }
    }
}

/// Message announcing a job to idle workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosted {
    pub provisioner_type: String,
    pub tags: crate::job::Tags,
}

/// Best-effort publish/subscribe transport.
#[async_trait]
pub trait Pubsub: Send + Sync {
    async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<()>;
}

/// Encode and publish a workspace event on the owner's channel.
pub async fn publish_workspace_event(
    pubsub: &dyn Pubsub,
    owner_id: ResourceId,
    event: &WorkspaceEvent,
) -> Result<()> {
    let message = serde_json::to_vec(event)
        .map_err(|e| Error::Internal(format!("encode workspace event: {e}")))?;
    pubsub
        .publish(&workspace_event_channel(owner_id), message)
        .await
}

/// A published message.
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// In-process pub/sub backed by a tokio broadcast channel. Messages reach
/// whoever is subscribed at publish time; only a [`MemoryPubsub::recording`]
/// instance also keeps them for later inspection.
pub struct MemoryPubsub {
    tx: broadcast::Sender<Message>,
    history: Option<Mutex<Vec<Message>>>,
    failing: AtomicBool,
}

impl MemoryPubsub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            history: None,
            failing: AtomicBool::new(false),
        }
    }

    /// A pubsub that retains every published message. Memory grows with
    /// each publish, so this is for tests.
    pub fn recording() -> Self {
        Self {
            history: Some(Mutex::new(Vec::new())),
            ..Self::new()
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    /// Make every subsequent publish fail (transport outage).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Payloads published on `channel`, oldest first. Always empty unless
    /// the pubsub is recording.
    pub fn messages(&self, channel: &str) -> Vec<Vec<u8>> {
        let Some(history) = &self.history else {
            return Vec::new();
        };
        history
            .lock()
            .map(|history| {
                history
                    .iter()
                    .filter(|m| m.channel == channel)
                    .map(|m| m.payload.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MemoryPubsub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pubsub for MemoryPubsub {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Internal("pubsub unavailable".to_string()));
        }
        let message = Message {
            channel: channel.to_string(),
            payload,
        };
        if let Some(Ok(mut history)) = self.history.as_ref().map(|h| h.lock()) {
            history.push(message.clone());
        }
        // No subscribers is not an error.
        let _ = self.tx.send(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_workspace_event() {
        let pubsub = MemoryPubsub::new();
        let mut rx = pubsub.subscribe();
        let owner = ResourceId::new();
        let workspace = ResourceId::new();

        publish_workspace_event(&pubsub, owner, &WorkspaceEvent::state_change(workspace))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel, format!("workspace_owner:{owner}"));
        let event: WorkspaceEvent = serde_json::from_slice(&received.payload).unwrap();
        assert_eq!(event, WorkspaceEvent::state_change(workspace));

        let json: serde_json::Value = serde_json::from_slice(&received.payload).unwrap();
        assert_eq!(json["kind"], "state_change");
    }

    #[tokio::test]
    async fn test_plain_pubsub_keeps_no_history() {
        let pubsub = MemoryPubsub::new();
        let mut rx = pubsub.subscribe();
        for i in 0..3u8 {
            pubsub.publish("jobs", vec![i]).await.unwrap();
        }

        assert!(pubsub.messages("jobs").is_empty());
        assert_eq!(rx.recv().await.unwrap().payload, vec![0]);
    }

    #[tokio::test]
    async fn test_recording_pubsub_keeps_history() {
        let pubsub = MemoryPubsub::recording();
        pubsub.publish("jobs", b"a".to_vec()).await.unwrap();
        pubsub.publish("other", b"b".to_vec()).await.unwrap();
        pubsub.publish("jobs", b"c".to_vec()).await.unwrap();

        assert_eq!(pubsub.messages("jobs"), vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_failing_pubsub() {
        let pubsub = MemoryPubsub::recording();
        pubsub.set_failing(true);
        assert!(pubsub.publish("x", vec![]).await.is_err());
        assert!(pubsub.messages("x").is_empty());
    }
}
