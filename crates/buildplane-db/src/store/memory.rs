//! In-memory store.
//!
//! A transaction holds the store's lock for its whole lifetime and works on
//! a private copy of the data, published on commit. Transactions are
//! therefore fully serialized, which subsumes the job row lock.

use async_trait::async_trait;
use buildplane_core::ResourceId;
use buildplane_core::job::{EligibleDaemon, ProvisionerDaemon, ProvisionerJob, ProvisionerJobStatus, tags_satisfy};
use buildplane_core::resource::{
    WorkspaceAgent, WorkspaceAgentLogSource, WorkspaceAgentScript, WorkspaceApp,
    WorkspaceAppStatus, WorkspaceResource, WorkspaceResourceMetadatum,
};
use buildplane_core::timing::{
    AgentScriptTimingRow, ProvisionerJobTiming, WorkspaceAgentScriptTiming,
};
use buildplane_core::workspace::{
    Template, TemplateVersion, TemplateVersionPreset, User, Workspace, WorkspaceBuild,
    WorkspaceBuildParameter,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{BuildPage, Queries, QueueRank, Store, StoreTx};
use crate::{DbError, DbResult};

/// Every table of the in-memory store. Rows keep insertion order, which is
/// the order batch reads return them in.
#[derive(Debug, Clone, Default)]
pub struct MemoryData {
    pub users: Vec<User>,
    pub workspaces: Vec<Workspace>,
    pub templates: Vec<Template>,
    pub template_versions: Vec<TemplateVersion>,
    pub presets: Vec<TemplateVersionPreset>,
    pub builds: Vec<WorkspaceBuild>,
    pub build_parameters: Vec<WorkspaceBuildParameter>,
    pub jobs: Vec<ProvisionerJob>,
    pub daemons: Vec<ProvisionerDaemon>,
    pub resources: Vec<WorkspaceResource>,
    pub metadata: Vec<WorkspaceResourceMetadatum>,
    pub agents: Vec<WorkspaceAgent>,
    pub apps: Vec<WorkspaceApp>,
    pub app_statuses: Vec<WorkspaceAppStatus>,
    pub scripts: Vec<WorkspaceAgentScript>,
    pub log_sources: Vec<WorkspaceAgentLogSource>,
    pub provisioner_timings: Vec<ProvisionerJobTiming>,
    pub script_timings: Vec<WorkspaceAgentScriptTiming>,
}

fn not_found(kind: &str, id: impl Display) -> DbError {
    DbError::NotFound(format!("{kind} {id}"))
}

fn id_set(ids: &[ResourceId]) -> HashSet<ResourceId> {
    ids.iter().copied().collect()
}

impl MemoryData {
    pub fn job(&self, id: ResourceId) -> DbResult<ProvisionerJob> {
        self.jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| not_found("provisioner job", id))
    }

    pub fn build(&self, id: ResourceId) -> DbResult<WorkspaceBuild> {
        self.builds
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| not_found("workspace build", id))
    }

    fn user(&self, id: ResourceId) -> DbResult<User> {
        self.users
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .ok_or_else(|| not_found("user", id))
    }

    fn users_with_roles(&self, roles: &[&str]) -> Vec<User> {
        self.users
            .iter()
            .filter(|u| roles.iter().any(|role| u.has_role(role)))
            .cloned()
            .collect()
    }

    fn workspace(&self, id: ResourceId) -> DbResult<Workspace> {
        self.workspaces
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| not_found("workspace", id))
    }

    fn workspace_by_owner_and_name(&self, owner_id: ResourceId, name: &str) -> DbResult<Workspace> {
        self.workspaces
            .iter()
            .find(|w| w.owner_id == owner_id && w.name == name && !w.deleted)
            .cloned()
            .ok_or_else(|| not_found("workspace", name))
    }

    fn template(&self, id: ResourceId) -> DbResult<Template> {
        self.templates
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| not_found("template", id))
    }

    fn template_version(&self, id: ResourceId) -> DbResult<TemplateVersion> {
        self.template_versions
            .iter()
            .find(|v| v.id == id)
            .cloned()
            .ok_or_else(|| not_found("template version", id))
    }

    fn template_versions_by_ids(&self, ids: &[ResourceId]) -> Vec<TemplateVersion> {
        let ids = id_set(ids);
        self.template_versions
            .iter()
            .filter(|v| ids.contains(&v.id))
            .cloned()
            .collect()
    }

    fn preset(&self, id: ResourceId) -> DbResult<TemplateVersionPreset> {
        self.presets
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| not_found("template version preset", id))
    }

    fn build_by_number(&self, workspace_id: ResourceId, number: i32) -> DbResult<WorkspaceBuild> {
        self.builds
            .iter()
            .find(|b| b.workspace_id == workspace_id && b.build_number == number)
            .cloned()
            .ok_or_else(|| not_found("workspace build number", number))
    }

    fn latest_build(&self, workspace_id: ResourceId) -> Option<WorkspaceBuild> {
        self.builds
            .iter()
            .filter(|b| b.workspace_id == workspace_id)
            .max_by_key(|b| b.build_number)
            .cloned()
    }

    fn list_builds(&self, workspace_id: ResourceId, page: &BuildPage) -> Vec<WorkspaceBuild> {
        let mut builds: Vec<WorkspaceBuild> = self
            .builds
            .iter()
            .filter(|b| b.workspace_id == workspace_id)
            .filter(|b| page.since.is_none_or(|since| b.created_at >= since))
            .cloned()
            .collect();

        if let Some(after_id) = page.after_id {
            match self.builds.iter().find(|b| b.id == after_id) {
                Some(after) => builds.retain(|b| b.build_number < after.build_number),
                None => builds.clear(),
            }
        }

        builds.sort_by(|a, b| b.build_number.cmp(&a.build_number));
        let page_iter = builds.into_iter().skip(page.offset.max(0) as usize);
        if page.limit > 0 {
            page_iter.take(page.limit as usize).collect()
        } else {
            page_iter.collect()
        }
    }

    fn build_parameters(&self, build_id: ResourceId) -> Vec<WorkspaceBuildParameter> {
        self.build_parameters
            .iter()
            .filter(|p| p.workspace_build_id == build_id)
            .cloned()
            .collect()
    }

    fn jobs_by_ids(&self, ids: &[ResourceId]) -> Vec<ProvisionerJob> {
        let ids = id_set(ids);
        self.jobs
            .iter()
            .filter(|j| ids.contains(&j.id))
            .cloned()
            .collect()
    }

    fn queue_ranks(&self, ids: &[ResourceId]) -> Vec<QueueRank> {
        let mut pending: Vec<&ProvisionerJob> = self
            .jobs
            .iter()
            .filter(|j| j.status() == ProvisionerJobStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let size = pending.len() as i64;
        pending
            .iter()
            .enumerate()
            .filter(|(_, job)| ids.contains(&job.id))
            .map(|(i, job)| QueueRank {
                job_id: job.id,
                position: i as i64 + 1,
                size,
            })
            .collect()
    }

    fn eligible_daemons(&self, job_ids: &[ResourceId]) -> Vec<EligibleDaemon> {
        job_ids
            .iter()
            .filter_map(|id| self.jobs.iter().find(|j| j.id == *id))
            .flat_map(|job| {
                self.daemons
                    .iter()
                    .filter(move |d| {
                        d.organization_id == job.organization_id && tags_satisfy(&d.tags, &job.tags)
                    })
                    .map(move |d| EligibleDaemon {
                        job_id: job.id,
                        daemon: d.clone(),
                    })
            })
            .collect()
    }

    fn resources_by_job_ids(&self, job_ids: &[ResourceId]) -> Vec<WorkspaceResource> {
        let ids = id_set(job_ids);
        self.resources
            .iter()
            .filter(|r| ids.contains(&r.job_id))
            .cloned()
            .collect()
    }

    fn resource_metadata(&self, resource_ids: &[ResourceId]) -> Vec<WorkspaceResourceMetadatum> {
        let ids = id_set(resource_ids);
        self.metadata
            .iter()
            .filter(|m| ids.contains(&m.workspace_resource_id))
            .cloned()
            .collect()
    }

    fn agents_by_resource_ids(&self, resource_ids: &[ResourceId]) -> Vec<WorkspaceAgent> {
        let ids = id_set(resource_ids);
        self.agents
            .iter()
            .filter(|a| ids.contains(&a.resource_id))
            .cloned()
            .collect()
    }

    fn apps_by_agent_ids(&self, agent_ids: &[ResourceId]) -> Vec<WorkspaceApp> {
        let ids = id_set(agent_ids);
        self.apps
            .iter()
            .filter(|a| ids.contains(&a.agent_id))
            .cloned()
            .collect()
    }

    fn app_statuses_by_app_ids(&self, app_ids: &[ResourceId]) -> Vec<WorkspaceAppStatus> {
        let ids = id_set(app_ids);
        self.app_statuses
            .iter()
            .filter(|s| ids.contains(&s.app_id))
            .cloned()
            .collect()
    }

    fn scripts_by_agent_ids(&self, agent_ids: &[ResourceId]) -> Vec<WorkspaceAgentScript> {
        let ids = id_set(agent_ids);
        self.scripts
            .iter()
            .filter(|s| ids.contains(&s.workspace_agent_id))
            .cloned()
            .collect()
    }

    fn log_sources_by_agent_ids(&self, agent_ids: &[ResourceId]) -> Vec<WorkspaceAgentLogSource> {
        let ids = id_set(agent_ids);
        self.log_sources
            .iter()
            .filter(|s| ids.contains(&s.workspace_agent_id))
            .cloned()
            .collect()
    }

    fn provisioner_timings(&self, job_id: ResourceId) -> Vec<ProvisionerJobTiming> {
        self.provisioner_timings
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Script timings of a build, joined through script → agent → resource → job.
    fn script_timings(&self, build_id: ResourceId) -> Vec<AgentScriptTimingRow> {
        let Some(build) = self.builds.iter().find(|b| b.id == build_id) else {
            return Vec::new();
        };
        let resource_ids: HashSet<ResourceId> = self
            .resources
            .iter()
            .filter(|r| r.job_id == build.job_id)
            .map(|r| r.id)
            .collect();
        let agents: HashMap<ResourceId, &WorkspaceAgent> = self
            .agents
            .iter()
            .filter(|a| resource_ids.contains(&a.resource_id))
            .map(|a| (a.id, a))
            .collect();
        let scripts: HashMap<ResourceId, (&WorkspaceAgentScript, &WorkspaceAgent)> = self
            .scripts
            .iter()
            .filter_map(|s| agents.get(&s.workspace_agent_id).map(|a| (s.id, (s, *a))))
            .collect();

        self.script_timings
            .iter()
            .filter_map(|t| {
                scripts.get(&t.script_id).map(|(script, agent)| AgentScriptTimingRow {
                    script_id: t.script_id,
                    started_at: t.started_at,
                    ended_at: t.ended_at,
                    exit_code: t.exit_code,
                    stage: t.stage,
                    status: t.status.clone(),
                    display_name: script.display_name.clone(),
                    workspace_agent_id: agent.id,
                    workspace_agent_name: agent.name.clone(),
                })
            })
            .collect()
    }

    fn job_mut(&mut self, id: ResourceId) -> DbResult<&mut ProvisionerJob> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| not_found("provisioner job", id))
    }

    fn insert_job(&mut self, job: &ProvisionerJob) -> DbResult<()> {
        if self.jobs.iter().any(|j| j.id == job.id) {
            return Err(DbError::Duplicate(format!("provisioner job {}", job.id)));
        }
        self.jobs.push(job.clone());
        Ok(())
    }

    fn insert_build(&mut self, build: &WorkspaceBuild) -> DbResult<()> {
        if self.builds.iter().any(|b| {
            b.id == build.id
                || (b.workspace_id == build.workspace_id && b.build_number == build.build_number)
        }) {
            return Err(DbError::Duplicate(format!(
                "workspace build {} #{}",
                build.workspace_id, build.build_number
            )));
        }
        if !self.jobs.iter().any(|j| j.id == build.job_id) {
            return Err(DbError::InvalidData(format!(
                "workspace build references missing job {}",
                build.job_id
            )));
        }
        self.builds.push(build.clone());
        Ok(())
    }
}

type Faults = Arc<Mutex<HashSet<&'static str>>>;

fn check(faults: &Faults, op: &'static str) -> DbResult<()> {
    let injected = faults.lock().map(|f| f.contains(op)).unwrap_or(false);
    if injected {
        return Err(DbError::Unavailable(format!("{op} failed")));
    }
    Ok(())
}

fn poisoned<T>(_: T) -> DbError {
    DbError::Unavailable("memory store poisoned".to_string())
}

/// Store keeping every table in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<AsyncMutex<MemoryData>>,
    faults: Faults,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate the tables directly, outside any transaction.
    pub async fn seed(&self, f: impl FnOnce(&mut MemoryData)) {
        let mut data = self.data.lock().await;
        f(&mut data);
    }

    /// Copy of the committed tables.
    pub async fn snapshot(&self) -> MemoryData {
        self.data.lock().await.clone()
    }

    /// Make the named operation (e.g. `"get_apps_by_agent_ids"`) fail from
    /// now on.
    pub fn fail_query(&self, op: &'static str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(op);
        }
    }

    async fn read<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&MemoryData) -> DbResult<T> + Send,
    ) -> DbResult<T> {
        check(&self.faults, op)?;
        let data = self.data.lock().await;
        f(&data)
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryData>,
    working: Mutex<MemoryData>,
    faults: Faults,
}

impl MemoryTx {
    async fn read<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&MemoryData) -> DbResult<T> + Send,
    ) -> DbResult<T> {
        check(&self.faults, op)?;
        let data = self.working.lock().map_err(poisoned)?;
        f(&data)
    }

    fn write<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut MemoryData) -> DbResult<T>,
    ) -> DbResult<T> {
        check(&self.faults, op)?;
        let mut data = self.working.lock().map_err(poisoned)?;
        f(&mut data)
    }
}

macro_rules! memory_queries {
    ($ty:ty) => {
        #[async_trait]
        impl Queries for $ty {
            async fn get_user(&self, id: ResourceId) -> DbResult<User> {
                self.read("get_user", move |d| d.user(id)).await
            }

            async fn get_users_with_roles(&self, roles: &[&str]) -> DbResult<Vec<User>> {
                self.read("get_users_with_roles", |d| Ok(d.users_with_roles(roles)))
                    .await
            }

            async fn get_workspace(&self, id: ResourceId) -> DbResult<Workspace> {
                self.read("get_workspace", move |d| d.workspace(id)).await
            }

            async fn get_workspace_by_owner_and_name(
                &self,
                owner_id: ResourceId,
                name: &str,
            ) -> DbResult<Workspace> {
                self.read("get_workspace_by_owner_and_name", |d| {
                    d.workspace_by_owner_and_name(owner_id, name)
                })
                .await
            }

            async fn get_template(&self, id: ResourceId) -> DbResult<Template> {
                self.read("get_template", move |d| d.template(id)).await
            }

            async fn get_template_version(&self, id: ResourceId) -> DbResult<TemplateVersion> {
                self.read("get_template_version", move |d| d.template_version(id))
                    .await
            }

            async fn get_template_versions_by_ids(
                &self,
                ids: &[ResourceId],
            ) -> DbResult<Vec<TemplateVersion>> {
                self.read("get_template_versions_by_ids", |d| {
                    Ok(d.template_versions_by_ids(ids))
                })
                .await
            }

            async fn get_preset(&self, id: ResourceId) -> DbResult<TemplateVersionPreset> {
                self.read("get_preset", move |d| d.preset(id)).await
            }

            async fn get_build(&self, id: ResourceId) -> DbResult<WorkspaceBuild> {
                self.read("get_build", move |d| d.build(id)).await
            }

            async fn get_build_by_number(
                &self,
                workspace_id: ResourceId,
                build_number: i32,
            ) -> DbResult<WorkspaceBuild> {
                self.read("get_build_by_number", move |d| {
                    d.build_by_number(workspace_id, build_number)
                })
                .await
            }

            async fn get_latest_build(
                &self,
                workspace_id: ResourceId,
            ) -> DbResult<Option<WorkspaceBuild>> {
                self.read("get_latest_build", move |d| Ok(d.latest_build(workspace_id)))
                    .await
            }

            async fn list_builds(
                &self,
                workspace_id: ResourceId,
                page: &BuildPage,
            ) -> DbResult<Vec<WorkspaceBuild>> {
                self.read("list_builds", |d| Ok(d.list_builds(workspace_id, page)))
                    .await
            }

            async fn get_build_parameters(
                &self,
                build_id: ResourceId,
            ) -> DbResult<Vec<WorkspaceBuildParameter>> {
                self.read("get_build_parameters", move |d| {
                    Ok(d.build_parameters(build_id))
                })
                .await
            }

            async fn get_job(&self, id: ResourceId) -> DbResult<ProvisionerJob> {
                self.read("get_job", move |d| d.job(id)).await
            }

            async fn get_jobs_by_ids(&self, ids: &[ResourceId]) -> DbResult<Vec<ProvisionerJob>> {
                self.read("get_jobs_by_ids", |d| Ok(d.jobs_by_ids(ids))).await
            }

            async fn get_queue_ranks(&self, job_ids: &[ResourceId]) -> DbResult<Vec<QueueRank>> {
                self.read("get_queue_ranks", |d| Ok(d.queue_ranks(job_ids))).await
            }

            async fn get_eligible_daemons(
                &self,
                job_ids: &[ResourceId],
            ) -> DbResult<Vec<EligibleDaemon>> {
                self.read("get_eligible_daemons", |d| Ok(d.eligible_daemons(job_ids)))
                    .await
            }

            async fn get_resources_by_job_ids(
                &self,
                job_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceResource>> {
                self.read("get_resources_by_job_ids", |d| {
                    Ok(d.resources_by_job_ids(job_ids))
                })
                .await
            }

            async fn get_resource_metadata(
                &self,
                resource_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceResourceMetadatum>> {
                self.read("get_resource_metadata", |d| {
                    Ok(d.resource_metadata(resource_ids))
                })
                .await
            }

            async fn get_agents_by_resource_ids(
                &self,
                resource_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceAgent>> {
                self.read("get_agents_by_resource_ids", |d| {
                    Ok(d.agents_by_resource_ids(resource_ids))
                })
                .await
            }

            async fn get_apps_by_agent_ids(
                &self,
                agent_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceApp>> {
                self.read("get_apps_by_agent_ids", |d| Ok(d.apps_by_agent_ids(agent_ids)))
                    .await
            }

            async fn get_app_statuses_by_app_ids(
                &self,
                app_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceAppStatus>> {
                self.read("get_app_statuses_by_app_ids", |d| {
                    Ok(d.app_statuses_by_app_ids(app_ids))
                })
                .await
            }

            async fn get_scripts_by_agent_ids(
                &self,
                agent_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceAgentScript>> {
                self.read("get_scripts_by_agent_ids", |d| {
                    Ok(d.scripts_by_agent_ids(agent_ids))
                })
                .await
            }

            async fn get_log_sources_by_agent_ids(
                &self,
                agent_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceAgentLogSource>> {
                self.read("get_log_sources_by_agent_ids", |d| {
                    Ok(d.log_sources_by_agent_ids(agent_ids))
                })
                .await
            }

            async fn get_provisioner_timings(
                &self,
                job_id: ResourceId,
            ) -> DbResult<Vec<ProvisionerJobTiming>> {
                self.read("get_provisioner_timings", move |d| {
                    Ok(d.provisioner_timings(job_id))
                })
                .await
            }

            async fn get_script_timings(
                &self,
                build_id: ResourceId,
            ) -> DbResult<Vec<AgentScriptTimingRow>> {
                self.read("get_script_timings", move |d| Ok(d.script_timings(build_id)))
                    .await
            }
        }
    };
}

memory_queries!(MemoryStore);
memory_queries!(MemoryTx);

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> DbResult<Box<dyn StoreTx>> {
        check(&self.faults, "begin")?;
        let guard = self.data.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working: Mutex::new(working),
            faults: self.faults.clone(),
        }))
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get_job_for_update(&self, id: ResourceId) -> DbResult<ProvisionerJob> {
        // The transaction already holds the only lock.
        self.read("get_job_for_update", move |d| d.job(id)).await
    }

    async fn update_job_cancel(
        &self,
        id: ResourceId,
        canceled_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        self.write("update_job_cancel", |d| {
            let job = d.job_mut(id)?;
            job.canceled_at = Some(canceled_at);
            job.completed_at = completed_at;
            job.updated_at = canceled_at;
            Ok(())
        })
    }

    async fn insert_job(&self, job: &ProvisionerJob) -> DbResult<()> {
        self.write("insert_job", |d| d.insert_job(job))
    }

    async fn complete_job(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<()> {
        self.write("complete_job", |d| {
            let job = d.job_mut(id)?;
            job.started_at = Some(at);
            job.completed_at = Some(at);
            job.updated_at = at;
            Ok(())
        })
    }

    async fn insert_build(&self, build: &WorkspaceBuild) -> DbResult<()> {
        self.write("insert_build", |d| d.insert_build(build))
    }

    async fn insert_build_parameters(
        &self,
        parameters: &[WorkspaceBuildParameter],
    ) -> DbResult<()> {
        self.write("insert_build_parameters", |d| {
            d.build_parameters.extend_from_slice(parameters);
            Ok(())
        })
    }

    async fn mark_workspace_deleted(&self, id: ResourceId) -> DbResult<()> {
        self.write("mark_workspace_deleted", |d| {
            let workspace = d
                .workspaces
                .iter_mut()
                .find(|w| w.id == id)
                .ok_or_else(|| not_found("workspace", id))?;
            workspace.deleted = true;
            Ok(())
        })
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        check(&self.faults, "commit")?;
        let MemoryTx {
            mut guard, working, ..
        } = *self;
        *guard = working.into_inner().map_err(poisoned)?;
        Ok(())
    }
}
