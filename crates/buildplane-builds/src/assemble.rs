//! Presentation of builds with their jobs and resource trees.
//!
//! Assembly runs in two phases. The fetch phase batch-loads everything the
//! requested builds reference. The assembly phase groups those rows into
//! trees and orders them. Nothing is cached between reads.

use buildplane_core::authz::{Action, Object, Subject};
use buildplane_core::job::{EligibleDaemon, ProvisionerJobStatus};
use buildplane_core::resource::{
    WorkspaceAgent, WorkspaceAgentLogSource, WorkspaceAgentScript, WorkspaceApp,
    WorkspaceAppStatus, WorkspaceResource, WorkspaceResourceMetadatum,
};
use buildplane_core::workspace::{
    TemplateVersion, Workspace, WorkspaceBuild, WorkspaceBuildParameter, WorkspaceStatus,
};
use buildplane_core::{Error, ResourceId, Result};
use buildplane_db::{BuildPage, DbError, Queries};
use buildplane_scheduler::{JobQueue, JobWithQueuePosition, MatchedProvisioners, matched_provisioners};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use crate::BuildService;
use crate::view::{
    AgentView, AppView, MetadataView, ProvisionerJobView, ResourceView, WorkspaceBuildView,
};

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("job {job_id} of build {build_id} not found")]
    MissingJob {
        build_id: ResourceId,
        job_id: ResourceId,
    },

    #[error("template version {template_version_id} of build {build_id} not found")]
    MissingTemplateVersion {
        build_id: ResourceId,
        template_version_id: ResourceId,
    },

    #[error(transparent)]
    Store(#[from] DbError),
}

impl From<AssembleError> for Error {
    fn from(err: AssembleError) -> Self {
        match err {
            AssembleError::Store(e) => e.into(),
            missing => {
                error!(error = %missing, "Build references a missing row");
                Error::Internal(missing.to_string())
            }
        }
    }
}

/// Rows referenced by a set of builds.
#[derive(Debug, Default)]
struct BuildData {
    jobs: Vec<JobWithQueuePosition>,
    eligible: Vec<EligibleDaemon>,
    versions: Vec<TemplateVersion>,
    resources: Vec<WorkspaceResource>,
    metadata: Vec<WorkspaceResourceMetadatum>,
    agents: Vec<WorkspaceAgent>,
    apps: Vec<WorkspaceApp>,
    statuses: Vec<WorkspaceAppStatus>,
    scripts: Vec<WorkspaceAgentScript>,
    log_sources: Vec<WorkspaceAgentLogSource>,
}

async fn fetch_build_data<Q: Queries + ?Sized>(
    store: &Q,
    builds: &[WorkspaceBuild],
) -> std::result::Result<BuildData, DbError> {
    let job_ids: Vec<ResourceId> = builds.iter().map(|b| b.job_id).collect();
    let version_ids: Vec<ResourceId> = builds.iter().map(|b| b.template_version_id).collect();

    let queue = JobQueue::new(store);
    let jobs = queue.with_queue_position(&job_ids).await?;
    let pending_ids: Vec<ResourceId> = jobs
        .iter()
        .filter(|j| j.job.status() == ProvisionerJobStatus::Pending)
        .map(|j| j.job.id)
        .collect();
    let eligible = queue.eligible_workers(&pending_ids).await?;
    let versions = store.get_template_versions_by_ids(&version_ids).await?;
    let resources = store.get_resources_by_job_ids(&job_ids).await?;

    let mut data = BuildData {
        jobs,
        eligible,
        versions,
        resources,
        ..Default::default()
    };
    if data.resources.is_empty() {
        return Ok(data);
    }

    let resource_ids: Vec<ResourceId> = data.resources.iter().map(|r| r.id).collect();
    data.metadata = store.get_resource_metadata(&resource_ids).await?;
    data.agents = store.get_agents_by_resource_ids(&resource_ids).await?;
    if data.agents.is_empty() {
        return Ok(data);
    }

    let agent_ids: Vec<ResourceId> = data.agents.iter().map(|a| a.id).collect();
    let ((apps, statuses), scripts, log_sources) = futures::try_join!(
        async {
            let apps = store.get_apps_by_agent_ids(&agent_ids).await?;
            let app_ids: Vec<ResourceId> = apps.iter().map(|a| a.id).collect();
            let statuses = if app_ids.is_empty() {
                Vec::new()
            } else {
                store.get_app_statuses_by_app_ids(&app_ids).await?
            };
            Ok::<_, DbError>((apps, statuses))
        },
        store.get_scripts_by_agent_ids(&agent_ids),
        store.get_log_sources_by_agent_ids(&agent_ids),
    )?;
    data.apps = apps;
    data.statuses = statuses;
    data.scripts = scripts;
    data.log_sources = log_sources;
    Ok(data)
}

fn group_by<T, K: Eq + Hash>(items: Vec<T>, key: impl Fn(&T) -> K) -> HashMap<K, Vec<T>> {
    let mut groups: HashMap<K, Vec<T>> = HashMap::new();
    for item in items {
        groups.entry(key(&item)).or_default().push(item);
    }
    groups
}

/// Order agents by `display_order`, then name.
pub fn sort_agents(agents: &mut [AgentView]) {
    agents.sort_by(|a, b| {
        a.agent
            .display_order
            .cmp(&b.agent.display_order)
            .then_with(|| a.agent.name.cmp(&b.agent.name))
    });
}

/// Order resources by their lowest agent `display_order`, then name.
/// Resources without agents sort after every resource with one.
pub fn sort_resources(resources: &mut [ResourceView]) {
    fn first_order(resource: &ResourceView) -> i32 {
        resource
            .agents
            .iter()
            .map(|a| a.agent.display_order)
            .min()
            .unwrap_or(i32::MAX)
    }
    resources.sort_by(|a, b| {
        first_order(a)
            .cmp(&first_order(b))
            .then_with(|| a.resource.name.cmp(&b.resource.name))
    });
}

/// Resource trees keyed by job id.
fn resource_trees(data: BuildData) -> HashMap<ResourceId, Vec<ResourceView>> {
    let mut metadata = group_by(data.metadata, |m| m.workspace_resource_id);
    let mut agents = group_by(data.agents, |a| a.resource_id);
    let mut apps = group_by(data.apps, |a| a.agent_id);
    let mut scripts = group_by(data.scripts, |s| s.workspace_agent_id);
    let mut log_sources = group_by(data.log_sources, |l| l.workspace_agent_id);
    let mut latest_status: HashMap<ResourceId, WorkspaceAppStatus> = HashMap::new();
    for status in data.statuses {
        match latest_status.get(&status.app_id) {
            Some(current) if current.created_at >= status.created_at => {}
            _ => {
                latest_status.insert(status.app_id, status);
            }
        }
    }

    let mut trees: HashMap<ResourceId, Vec<ResourceView>> = HashMap::new();
    for resource in data.resources {
        let mut agent_views: Vec<AgentView> = agents
            .remove(&resource.id)
            .unwrap_or_default()
            .into_iter()
            .map(|agent| AgentView {
                apps: apps
                    .remove(&agent.id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|app| AppView {
                        status: latest_status.remove(&app.id),
                        app,
                    })
                    .collect(),
                scripts: scripts.remove(&agent.id).unwrap_or_default(),
                log_sources: log_sources.remove(&agent.id).unwrap_or_default(),
                agent,
            })
            .collect();
        sort_agents(&mut agent_views);

        let metadata = metadata
            .remove(&resource.id)
            .unwrap_or_default()
            .into_iter()
            .map(|m| MetadataView {
                key: m.key,
                value: m.value,
                sensitive: m.sensitive,
            })
            .collect();
        trees.entry(resource.job_id).or_default().push(ResourceView {
            resource,
            agents: agent_views,
            metadata,
        });
    }
    for resources in trees.values_mut() {
        sort_resources(resources);
    }
    trees
}

/// Summary of one build and its job.
pub(crate) fn build_view(
    workspace: &Workspace,
    build: &WorkspaceBuild,
    queued: &JobWithQueuePosition,
    template_version_name: &str,
    resources: Vec<ResourceView>,
    matched_provisioners: MatchedProvisioners,
) -> WorkspaceBuildView {
    WorkspaceBuildView {
        id: build.id,
        created_at: build.created_at,
        updated_at: build.updated_at,
        workspace_id: workspace.id,
        workspace_name: workspace.name.clone(),
        workspace_owner_id: workspace.owner_id,
        workspace_owner_name: workspace.owner_username.clone(),
        workspace_owner_avatar_url: workspace.owner_avatar_url.clone(),
        template_version_id: build.template_version_id,
        template_version_name: template_version_name.to_string(),
        build_number: build.build_number,
        transition: build.transition,
        initiator_id: build.initiator_id,
        initiator_name: build.initiator_username.clone(),
        job: ProvisionerJobView::from(queued),
        reason: build.reason.clone(),
        resources,
        deadline: build.deadline,
        max_deadline: build.max_deadline,
        status: WorkspaceStatus::from_job(queued.job.status(), build.transition),
        daily_cost: build.daily_cost,
        matched_provisioners,
        template_version_preset_id: build.template_version_preset_id,
        has_ai_task: build.has_ai_task,
        ai_task_sidebar_app_id: build.ai_task_sidebar_app_id,
    }
}

fn assemble_builds(
    workspace: &Workspace,
    builds: Vec<WorkspaceBuild>,
    mut data: BuildData,
    now: DateTime<Utc>,
    stale_interval: Duration,
) -> std::result::Result<Vec<WorkspaceBuildView>, AssembleError> {
    let jobs: HashMap<ResourceId, JobWithQueuePosition> = std::mem::take(&mut data.jobs)
        .into_iter()
        .map(|j| (j.job.id, j))
        .collect();
    let versions: HashMap<ResourceId, String> = std::mem::take(&mut data.versions)
        .into_iter()
        .map(|v| (v.id, v.name))
        .collect();
    let eligible = group_by(std::mem::take(&mut data.eligible), |e| e.job_id);
    let mut trees = resource_trees(data);

    builds
        .into_iter()
        .map(|build| {
            let queued = jobs.get(&build.job_id).ok_or(AssembleError::MissingJob {
                build_id: build.id,
                job_id: build.job_id,
            })?;
            let version_name =
                versions
                    .get(&build.template_version_id)
                    .ok_or(AssembleError::MissingTemplateVersion {
                        build_id: build.id,
                        template_version_id: build.template_version_id,
                    })?;
            let matched = matched_provisioners(
                eligible
                    .get(&build.job_id)
                    .into_iter()
                    .flatten()
                    .map(|e| &e.daemon),
                now,
                stale_interval,
            );
            let resources = trees.remove(&build.job_id).unwrap_or_default();
            Ok(build_view(workspace, &build, queued, version_name, resources, matched))
        })
        .collect()
}

impl BuildService {
    async fn assemble(
        &self,
        workspace: &Workspace,
        builds: Vec<WorkspaceBuild>,
    ) -> Result<Vec<WorkspaceBuildView>> {
        if builds.is_empty() {
            return Ok(Vec::new());
        }
        let data = fetch_build_data(self.store.as_ref(), &builds)
            .await
            .map_err(AssembleError::from)?;
        debug!(
            workspace_id = %workspace.id,
            builds = builds.len(),
            resources = data.resources.len(),
            agents = data.agents.len(),
            "Fetched build data"
        );
        Ok(assemble_builds(
            workspace,
            builds,
            data,
            Utc::now(),
            self.stale_interval,
        )?)
    }

    async fn assemble_one(
        &self,
        workspace: &Workspace,
        build: WorkspaceBuild,
    ) -> Result<WorkspaceBuildView> {
        let build_id = build.id;
        self.assemble(workspace, vec![build])
            .await?
            .pop()
            .ok_or_else(|| Error::Internal(format!("build {build_id} was not assembled")))
    }

    /// A single build by id.
    pub async fn build(&self, subject: &Subject, build_id: ResourceId) -> Result<WorkspaceBuildView> {
        let build = self.store.get_build(build_id).await?;
        let workspace = self.store.get_workspace(build.workspace_id).await?;
        self.ensure_readable(subject, &workspace, || format!("build {build_id}"))?;
        self.assemble_one(&workspace, build).await
    }

    /// A page of a workspace's builds, newest first.
    pub async fn builds_for_workspace(
        &self,
        subject: &Subject,
        workspace_id: ResourceId,
        page: &BuildPage,
    ) -> Result<Vec<WorkspaceBuildView>> {
        if page.offset < 0 || page.limit < 0 {
            return Err(Error::InvalidInput(
                "offset and limit must not be negative".to_string(),
            ));
        }
        let workspace = self.store.get_workspace(workspace_id).await?;
        self.ensure_readable(subject, &workspace, || format!("workspace {workspace_id}"))?;
        if let Some(after_id) = page.after_id {
            match self.store.get_build(after_id).await {
                Ok(after) if after.workspace_id == workspace_id => {}
                Ok(_) => {
                    return Err(Error::InvalidInput(format!(
                        "build {after_id} does not belong to workspace {workspace_id}"
                    )));
                }
                Err(e) if e.is_not_found() => {
                    return Err(Error::InvalidInput(format!(
                        "no build exists with id {after_id}"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        let builds = self.store.list_builds(workspace_id, page).await?;
        self.assemble(&workspace, builds).await
    }

    /// A build addressed by owner, workspace name and build number.
    pub async fn build_by_number(
        &self,
        subject: &Subject,
        owner_id: ResourceId,
        workspace_name: &str,
        build_number: i32,
    ) -> Result<WorkspaceBuildView> {
        let workspace = self
            .store
            .get_workspace_by_owner_and_name(owner_id, workspace_name)
            .await?;
        self.ensure_readable(subject, &workspace, || {
            format!("workspace {workspace_name} of user {owner_id}")
        })?;
        let build = self
            .store
            .get_build_by_number(workspace.id, build_number)
            .await?;
        self.assemble_one(&workspace, build).await
    }

    pub async fn parameters(
        &self,
        subject: &Subject,
        build_id: ResourceId,
    ) -> Result<Vec<WorkspaceBuildParameter>> {
        let build = self.store.get_build(build_id).await?;
        let workspace = self.store.get_workspace(build.workspace_id).await?;
        self.ensure_readable(subject, &workspace, || format!("build {build_id}"))?;
        Ok(self.store.get_build_parameters(build.id).await?)
    }

    /// Raw provisioner state of a build. Callers that may not update the
    /// template are told the build does not exist.
    pub async fn provisioner_state(
        &self,
        subject: &Subject,
        build_id: ResourceId,
    ) -> Result<Vec<u8>> {
        let build = self.store.get_build(build_id).await?;
        let workspace = self.store.get_workspace(build.workspace_id).await?;
        self.ensure_readable(subject, &workspace, || format!("build {build_id}"))?;
        let template = self.store.get_template(workspace.template_id).await?;
        if !self
            .authorizer
            .authorize(subject, Action::Update, &Object::template(&template))
        {
            return Err(Error::NotFound(format!("build {build_id}")));
        }
        Ok(build.provisioner_state)
    }
}
