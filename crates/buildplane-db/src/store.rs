//! Store traits and implementations.
//!
//! [`Queries`] holds every read the control plane performs. [`Store`] adds
//! the ability to open a transaction; [`StoreTx`] adds the mutations and
//! `commit`. Dropping a transaction without committing rolls it back.

pub mod memory;
pub mod postgres;
mod rows;

pub use memory::{MemoryData, MemoryStore};
pub use postgres::PgStore;

use async_trait::async_trait;
use buildplane_core::ResourceId;
use buildplane_core::job::{EligibleDaemon, ProvisionerJob};
use buildplane_core::resource::{
    WorkspaceAgent, WorkspaceAgentLogSource, WorkspaceAgentScript, WorkspaceApp,
    WorkspaceAppStatus, WorkspaceResource, WorkspaceResourceMetadatum,
};
use buildplane_core::timing::{AgentScriptTimingRow, ProvisionerJobTiming};
use buildplane_core::workspace::{
    Template, TemplateVersion, TemplateVersionPreset, User, Workspace, WorkspaceBuild,
    WorkspaceBuildParameter,
};
use chrono::{DateTime, Utc};

use crate::DbResult;

/// Pagination of a workspace's builds, newest first.
#[derive(Debug, Clone, Default)]
pub struct BuildPage {
    /// Only builds older than this one.
    pub after_id: Option<ResourceId>,
    pub offset: i64,
    /// Zero means no limit.
    pub limit: i64,
    /// Only builds created at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

/// A pending job's place in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRank {
    pub job_id: ResourceId,
    /// 1-based, oldest first.
    pub position: i64,
    /// Number of pending jobs.
    pub size: i64,
}

/// Reads. Batch lookups return whatever rows exist; single-row lookups
/// return [`crate::DbError::NotFound`] when the row is missing.
#[async_trait]
pub trait Queries: Send + Sync {
    async fn get_user(&self, id: ResourceId) -> DbResult<User>;
    async fn get_users_with_roles(&self, roles: &[&str]) -> DbResult<Vec<User>>;

    async fn get_workspace(&self, id: ResourceId) -> DbResult<Workspace>;
    async fn get_workspace_by_owner_and_name(
        &self,
        owner_id: ResourceId,
        name: &str,
    ) -> DbResult<Workspace>;

    async fn get_template(&self, id: ResourceId) -> DbResult<Template>;
    async fn get_template_version(&self, id: ResourceId) -> DbResult<TemplateVersion>;
    async fn get_template_versions_by_ids(
        &self,
        ids: &[ResourceId],
    ) -> DbResult<Vec<TemplateVersion>>;
    async fn get_preset(&self, id: ResourceId) -> DbResult<TemplateVersionPreset>;

    async fn get_build(&self, id: ResourceId) -> DbResult<WorkspaceBuild>;
    async fn get_build_by_number(
        &self,
        workspace_id: ResourceId,
        build_number: i32,
    ) -> DbResult<WorkspaceBuild>;
    /// `None` when the workspace has never been built.
    async fn get_latest_build(&self, workspace_id: ResourceId)
    -> DbResult<Option<WorkspaceBuild>>;
    async fn list_builds(
        &self,
        workspace_id: ResourceId,
        page: &BuildPage,
    ) -> DbResult<Vec<WorkspaceBuild>>;
    async fn get_build_parameters(
        &self,
        build_id: ResourceId,
    ) -> DbResult<Vec<WorkspaceBuildParameter>>;

    async fn get_job(&self, id: ResourceId) -> DbResult<ProvisionerJob>;
    async fn get_jobs_by_ids(&self, ids: &[ResourceId]) -> DbResult<Vec<ProvisionerJob>>;
    /// Rank of each given job among all pending jobs ordered by
    /// (`created_at`, `id`). Jobs that are not pending are omitted.
    async fn get_queue_ranks(&self, job_ids: &[ResourceId]) -> DbResult<Vec<QueueRank>>;
    /// Daemons in the job's organization whose tags are a superset of the
    /// job's tags, for each of the given jobs. Liveness is not considered.
    async fn get_eligible_daemons(&self, job_ids: &[ResourceId])
    -> DbResult<Vec<EligibleDaemon>>;

    async fn get_resources_by_job_ids(
        &self,
        job_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceResource>>;
    async fn get_resource_metadata(
        &self,
        resource_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceResourceMetadatum>>;
    async fn get_agents_by_resource_ids(
        &self,
        resource_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceAgent>>;
    async fn get_apps_by_agent_ids(&self, agent_ids: &[ResourceId]) -> DbResult<Vec<WorkspaceApp>>;
    async fn get_app_statuses_by_app_ids(
        &self,
        app_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceAppStatus>>;
    async fn get_scripts_by_agent_ids(
        &self,
        agent_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceAgentScript>>;
    async fn get_log_sources_by_agent_ids(
        &self,
        agent_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceAgentLogSource>>;

    async fn get_provisioner_timings(&self, job_id: ResourceId)
    -> DbResult<Vec<ProvisionerJobTiming>>;
    async fn get_script_timings(&self, build_id: ResourceId)
    -> DbResult<Vec<AgentScriptTimingRow>>;
}

/// An open transaction.
#[async_trait]
pub trait StoreTx: Queries {
    /// Read a job and lock its row until the transaction ends.
    async fn get_job_for_update(&self, id: ResourceId) -> DbResult<ProvisionerJob>;
    async fn update_job_cancel(
        &self,
        id: ResourceId,
        canceled_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> DbResult<()>;
    async fn insert_job(&self, job: &ProvisionerJob) -> DbResult<()>;
    /// Mark a job started and completed at `at` without a worker.
    async fn complete_job(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<()>;
    async fn insert_build(&self, build: &WorkspaceBuild) -> DbResult<()>;
    async fn insert_build_parameters(&self, parameters: &[WorkspaceBuildParameter])
    -> DbResult<()>;
    async fn mark_workspace_deleted(&self, id: ResourceId) -> DbResult<()>;
    async fn commit(self: Box<Self>) -> DbResult<()>;
}

#[async_trait]
pub trait Store: Queries {
    async fn begin(&self) -> DbResult<Box<dyn StoreTx>>;
}
