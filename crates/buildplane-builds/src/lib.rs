//! Workspace build operations.
//!
//! [`BuildService`] is the entry point for everything the API does with
//! builds: submitting new ones, canceling their jobs, and presenting builds
//! with their resource trees and timings.

pub mod assemble;
pub mod cancel;
pub mod submit;
pub mod timings;
pub mod view;

pub use assemble::AssembleError;
pub use cancel::ExpectedStatus;
pub use submit::CreateBuildRequest;
pub use view::{
    AgentConnectionTiming, AgentView, AppView, BuildTimings, MetadataView, ProvisionerJobView,
    ResourceView, WorkspaceBuildView,
};

use buildplane_core::audit::Auditor;
use buildplane_core::authz::{Action, Authorizer, Object, Subject};
use buildplane_core::events::{Pubsub, WorkspaceEvent, publish_workspace_event};
use buildplane_core::notification::Notifier;
use buildplane_core::workspace::Workspace;
use buildplane_core::{Error, ResourceId, Result};
use buildplane_db::Store;
use buildplane_scheduler::{GraphBuilder, STALE_INTERVAL};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Build operations over a store and the control plane's collaborators.
#[derive(Clone)]
pub struct BuildService {
    store: Arc<dyn Store>,
    builder: Arc<dyn GraphBuilder>,
    pubsub: Arc<dyn Pubsub>,
    notifier: Arc<dyn Notifier>,
    auditor: Arc<dyn Auditor>,
    authorizer: Arc<dyn Authorizer>,
    stale_interval: Duration,
}

impl BuildService {
    pub fn new(
        store: Arc<dyn Store>,
        builder: Arc<dyn GraphBuilder>,
        pubsub: Arc<dyn Pubsub>,
        notifier: Arc<dyn Notifier>,
        auditor: Arc<dyn Auditor>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            store,
            builder,
            pubsub,
            notifier,
            auditor,
            authorizer,
            stale_interval: STALE_INTERVAL,
        }
    }

    /// Heartbeat age after which a worker no longer counts as available.
    pub fn with_stale_interval(mut self, stale_interval: Duration) -> Self {
        self.stale_interval = stale_interval;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Workspaces the caller may not read are reported as missing, under the
    /// name of whatever was looked up through them.
    fn ensure_readable(
        &self,
        subject: &Subject,
        workspace: &Workspace,
        looked_up: impl FnOnce() -> String,
    ) -> Result<()> {
        if self
            .authorizer
            .authorize(subject, Action::Read, &Object::workspace(workspace))
        {
            Ok(())
        } else {
            Err(Error::NotFound(looked_up()))
        }
    }

    /// Tell watchers of the owner's workspaces that one of them changed.
    async fn publish_state_change(&self, owner_id: ResourceId, workspace_id: ResourceId) {
        let event = WorkspaceEvent::state_change(workspace_id);
        if let Err(e) = publish_workspace_event(self.pubsub.as_ref(), owner_id, &event).await {
            warn!(
                workspace_id = %workspace_id,
                error = %e,
                "Failed to publish workspace update"
            );
        }
    }
}
