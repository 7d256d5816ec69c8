//! Client-facing views of builds and their resource trees.

use buildplane_core::ResourceId;
use buildplane_core::job::{ProvisionerJobStatus, Tags};
use buildplane_core::resource::{
    WorkspaceAgent, WorkspaceAgentLogSource, WorkspaceAgentScript, WorkspaceApp,
    WorkspaceAppStatus, WorkspaceResource,
};
use buildplane_core::timing::{AgentScriptTimingRow, ProvisionerJobTiming, TimingStage};
use buildplane_core::workspace::{WorkspaceStatus, WorkspaceTransition};
use buildplane_scheduler::{JobWithQueuePosition, MatchedProvisioners};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionerJobView {
    pub id: ResourceId,
    pub organization_id: ResourceId,
    pub initiator_id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub status: ProvisionerJobStatus,
    pub worker_id: Option<ResourceId>,
    pub tags: Tags,
    pub queue_position: i64,
    pub queue_size: i64,
}

impl From<&JobWithQueuePosition> for ProvisionerJobView {
    fn from(queued: &JobWithQueuePosition) -> Self {
        let job = &queued.job;
        ProvisionerJobView {
            id: job.id,
            organization_id: job.organization_id,
            initiator_id: job.initiator_id,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            canceled_at: job.canceled_at,
            error: job.error.clone(),
            error_code: job.error_code.clone(),
            status: job.status(),
            worker_id: job.worker_id,
            tags: job.tags.clone(),
            queue_position: queued.queue_position,
            queue_size: queued.queue_size,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppView {
    #[serde(flatten)]
    pub app: WorkspaceApp,
    /// Most recently reported status.
    pub status: Option<WorkspaceAppStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: WorkspaceAgent,
    pub apps: Vec<AppView>,
    pub scripts: Vec<WorkspaceAgentScript>,
    pub log_sources: Vec<WorkspaceAgentLogSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataView {
    pub key: String,
    pub value: Option<String>,
    pub sensitive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceView {
    #[serde(flatten)]
    pub resource: WorkspaceResource,
    pub agents: Vec<AgentView>,
    pub metadata: Vec<MetadataView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceBuildView {
    pub id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub workspace_id: ResourceId,
    pub workspace_name: String,
    pub workspace_owner_id: ResourceId,
    pub workspace_owner_name: String,
    pub workspace_owner_avatar_url: String,
    pub template_version_id: ResourceId,
    pub template_version_name: String,
    pub build_number: i32,
    pub transition: WorkspaceTransition,
    pub initiator_id: ResourceId,
    pub initiator_name: String,
    pub job: ProvisionerJobView,
    pub reason: String,
    pub resources: Vec<ResourceView>,
    pub deadline: Option<DateTime<Utc>>,
    pub max_deadline: Option<DateTime<Utc>>,
    pub status: WorkspaceStatus,
    pub daily_cost: i32,
    pub matched_provisioners: MatchedProvisioners,
    pub template_version_preset_id: Option<ResourceId>,
    pub has_ai_task: Option<bool>,
    pub ai_task_sidebar_app_id: Option<ResourceId>,
}

/// Time from agent creation to its first connection.
#[derive(Debug, Clone, Serialize)]
pub struct AgentConnectionTiming {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub stage: TimingStage,
    pub workspace_agent_id: ResourceId,
    pub workspace_agent_name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildTimings {
    pub provisioner_timings: Vec<ProvisionerJobTiming>,
    pub agent_script_timings: Vec<AgentScriptTimingRow>,
    pub agent_connection_timings: Vec<AgentConnectionTiming>,
}
