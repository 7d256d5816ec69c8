//! Build graph construction.
//!
//! A [`GraphBuilder`] turns a build request into the build row, its
//! provisioner job and the workers eligible to run it, writing both rows
//! through the caller's transaction.

use async_trait::async_trait;
use buildplane_core::authz::{Action, AuthorizeFn, Object};
use buildplane_core::job::{
    EligibleDaemon, PROVISIONER_TERRAFORM, ProvisionerJob, WorkspaceBuildJobInput,
};
use buildplane_core::workspace::{
    REASON_INITIATOR, Template, TemplateVersion, Workspace, WorkspaceBuild,
    WorkspaceBuildParameter, WorkspaceTransition,
};
use buildplane_core::{Error, ResourceId, Result};
use buildplane_db::{DbError, StoreTx};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::queue::{STALE_INTERVAL, is_live};

/// A named rich parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub name: String,
    pub value: String,
}

/// Everything needed to construct one build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub workspace_id: ResourceId,
    pub initiator_id: ResourceId,
    pub initiator_username: String,
    pub transition: WorkspaceTransition,
    pub template_version_id: Option<ResourceId>,
    pub template_version_preset_id: Option<ResourceId>,
    pub rich_parameter_values: Vec<ParameterValue>,
    pub provisioner_state: Option<Vec<u8>>,
    pub orphan: bool,
    pub log_level: Option<String>,
    pub reason: Option<String>,
    /// The workspace's latest build before this one.
    pub previous: Option<WorkspaceBuild>,
}

/// Rows written for a new build.
#[derive(Debug, Clone)]
pub struct BuiltWorkspace {
    pub workspace: Workspace,
    pub template: Template,
    pub build: WorkspaceBuild,
    pub job: ProvisionerJob,
    pub parameters: Vec<WorkspaceBuildParameter>,
    /// Workers able to run the job, live or not.
    pub eligible: Vec<EligibleDaemon>,
}

#[async_trait]
pub trait GraphBuilder: Send + Sync {
    async fn build(
        &self,
        tx: &dyn StoreTx,
        request: BuildRequest,
        authorize: &AuthorizeFn<'_>,
    ) -> Result<BuiltWorkspace>;
}

/// Builds a single provisioner job per workspace build.
#[derive(Debug, Clone)]
pub struct WorkspaceBuilder {
    stale_interval: Duration,
}

impl WorkspaceBuilder {
    pub fn new(stale_interval: Duration) -> Self {
        Self { stale_interval }
    }
}

impl Default for WorkspaceBuilder {
    fn default() -> Self {
        Self::new(STALE_INTERVAL)
    }
}

/// Not found while resolving a client-supplied reference is bad input.
fn invalid_reference(err: DbError, what: &str, id: ResourceId) -> Error {
    if err.is_not_found() {
        Error::InvalidInput(format!("{what} {id} not found"))
    } else {
        err.into()
    }
}

fn merge_parameters(
    previous: Vec<WorkspaceBuildParameter>,
    requested: &[ParameterValue],
    build_id: ResourceId,
) -> Vec<WorkspaceBuildParameter> {
    let mut merged: Vec<WorkspaceBuildParameter> = previous
        .into_iter()
        .map(|p| WorkspaceBuildParameter {
            workspace_build_id: build_id,
            ..p
        })
        .collect();
    for value in requested {
        match merged.iter_mut().find(|p| p.name == value.name) {
            Some(existing) => existing.value = value.value.clone(),
            None => merged.push(WorkspaceBuildParameter {
                workspace_build_id: build_id,
                name: value.name.clone(),
                value: value.value.clone(),
            }),
        }
    }
    merged
}

impl WorkspaceBuilder {
    async fn resolve_version(
        &self,
        tx: &dyn StoreTx,
        request: &BuildRequest,
        template: &Template,
    ) -> Result<TemplateVersion> {
        let version_id = match (request.template_version_id, &request.previous) {
            (Some(id), _) => id,
            (None, Some(previous)) if request.transition != WorkspaceTransition::Start => {
                previous.template_version_id
            }
            _ => template.active_version_id,
        };
        let version = tx
            .get_template_version(version_id)
            .await
            .map_err(|e| invalid_reference(e, "template version", version_id))?;
        if version.template_id != template.id {
            return Err(Error::InvalidInput(format!(
                "template version {version_id} does not belong to template {}",
                template.name
            )));
        }
        Ok(version)
    }
}

#[async_trait]
impl GraphBuilder for WorkspaceBuilder {
    async fn build(
        &self,
        tx: &dyn StoreTx,
        request: BuildRequest,
        authorize: &AuthorizeFn<'_>,
    ) -> Result<BuiltWorkspace> {
        let workspace = tx.get_workspace(request.workspace_id).await?;
        if workspace.deleted {
            return Err(Error::InvalidState(format!(
                "workspace {} has been deleted",
                workspace.name
            )));
        }
        let template = tx.get_template(workspace.template_id).await?;

        let action = match request.transition {
            WorkspaceTransition::Delete => Action::Delete,
            WorkspaceTransition::Start | WorkspaceTransition::Stop => Action::Update,
        };
        if !authorize(action, &Object::workspace(&workspace)) {
            return Err(Error::Forbidden(format!(
                "not authorized to {} workspace {}",
                request.transition, workspace.name
            )));
        }

        let version = self.resolve_version(tx, &request, &template).await?;

        if let Some(preset_id) = request.template_version_preset_id {
            let preset = tx
                .get_preset(preset_id)
                .await
                .map_err(|e| invalid_reference(e, "template version preset", preset_id))?;
            if preset.template_version_id != version.id {
                return Err(Error::InvalidInput(format!(
                    "preset {} does not belong to template version {}",
                    preset.name, version.name
                )));
            }
        }

        let previous_parameters = match &request.previous {
            Some(previous) => tx.get_build_parameters(previous.id).await?,
            None => Vec::new(),
        };

        let provisioner_state = match request.provisioner_state {
            Some(state) if !state.is_empty() => state,
            _ if request.orphan => Vec::new(),
            _ => request
                .previous
                .as_ref()
                .map(|p| p.provisioner_state.clone())
                .unwrap_or_default(),
        };

        let now = Utc::now();
        let build_id = ResourceId::new();
        let build_number = request.previous.as_ref().map_or(1, |p| p.build_number + 1);
        let input = serde_json::to_value(WorkspaceBuildJobInput {
            workspace_build_id: build_id,
            log_level: request.log_level.clone(),
            dry_run: false,
        })
        .map_err(|e| Error::Internal(format!("encode job input: {e}")))?;

        let mut job = ProvisionerJob {
            id: ResourceId::new(),
            organization_id: workspace.organization_id,
            initiator_id: request.initiator_id,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            canceled_at: None,
            error: None,
            error_code: None,
            worker_id: None,
            provisioner: PROVISIONER_TERRAFORM.to_string(),
            tags: version.provisioner_tags.clone(),
            input,
        };
        tx.insert_job(&job).await?;

        let reason = match request.transition {
            WorkspaceTransition::Start => request
                .reason
                .clone()
                .unwrap_or_else(|| REASON_INITIATOR.to_string()),
            _ => REASON_INITIATOR.to_string(),
        };
        let build = WorkspaceBuild {
            id: build_id,
            created_at: now,
            updated_at: now,
            workspace_id: workspace.id,
            template_version_id: version.id,
            build_number,
            transition: request.transition,
            initiator_id: request.initiator_id,
            initiator_username: request.initiator_username.clone(),
            provisioner_state,
            job_id: job.id,
            deadline: None,
            max_deadline: None,
            reason,
            daily_cost: 0,
            template_version_preset_id: request.template_version_preset_id,
            has_ai_task: None,
            ai_task_sidebar_app_id: None,
        };
        tx.insert_build(&build).await.map_err(|e| match e {
            DbError::Duplicate(_) => Error::InvalidState(format!(
                "build number {build_number} already exists for workspace {}",
                workspace.name
            )),
            other => other.into(),
        })?;

        let parameters = merge_parameters(previous_parameters, &request.rich_parameter_values, build.id);
        tx.insert_build_parameters(&parameters).await?;

        let eligible = tx.get_eligible_daemons(&[job.id]).await?;
        debug!(
            job_id = %job.id,
            eligible = eligible.len(),
            "Resolved eligible provisioners"
        );

        if request.orphan && request.transition == WorkspaceTransition::Delete {
            let live = eligible
                .iter()
                .any(|e| is_live(&e.daemon, now, self.stale_interval));
            if !live {
                tx.complete_job(job.id, now).await?;
                tx.mark_workspace_deleted(workspace.id).await?;
                job.started_at = Some(now);
                job.completed_at = Some(now);
                job.updated_at = now;
                info!(
                    workspace_id = %workspace.id,
                    build_id = %build.id,
                    "No live provisioner for orphan delete, completed job immediately"
                );
            }
        }

        Ok(BuiltWorkspace {
            workspace,
            template,
            build,
            job,
            parameters,
            eligible,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildplane_core::job::ProvisionerJobStatus;
    use buildplane_core::workspace::TemplateVersionPreset;
    use buildplane_db::fixtures::Fixture;
    use buildplane_db::{MemoryStore, Queries, Store};
    use chrono::Duration as ChronoDuration;

    fn request(fixture: &Fixture, transition: WorkspaceTransition) -> BuildRequest {
        BuildRequest {
            workspace_id: fixture.workspace.id,
            initiator_id: fixture.owner.id,
            initiator_username: fixture.owner.username.clone(),
            transition,
            template_version_id: None,
            template_version_preset_id: None,
            rich_parameter_values: Vec::new(),
            provisioner_state: None,
            orphan: false,
            log_level: None,
            reason: None,
            previous: None,
        }
    }

    fn allow_all(_: Action, _: &Object) -> bool {
        true
    }

    fn deny_all(_: Action, _: &Object) -> bool {
        false
    }

    async fn build_committed(
        store: &MemoryStore,
        request: BuildRequest,
    ) -> Result<BuiltWorkspace> {
        let tx = store.begin().await?;
        let built = WorkspaceBuilder::default()
            .build(&*tx, request, &allow_all)
            .await?;
        tx.commit().await?;
        Ok(built)
    }

    #[tokio::test]
    async fn test_first_build_is_number_one_and_pending() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        fixture.seed(&store).await;

        let built = build_committed(&store, request(&fixture, WorkspaceTransition::Start))
            .await
            .unwrap();

        assert_eq!(built.build.build_number, 1);
        assert_eq!(built.build.template_version_id, fixture.version.id);
        assert_eq!(built.build.reason, REASON_INITIATOR);
        assert_eq!(built.job.status(), ProvisionerJobStatus::Pending);
        assert_eq!(built.job.tags, fixture.version.provisioner_tags);
        assert_eq!(
            built.job.input["workspace_build_id"],
            serde_json::json!(built.build.id)
        );
        assert!(store.get_build(built.build.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_build_numbers_increase_by_one() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        fixture.seed(&store).await;

        let mut previous = None;
        for expected in 1..=3 {
            let mut req = request(&fixture, WorkspaceTransition::Start);
            req.previous = previous.clone();
            let built = build_committed(&store, req).await.unwrap();
            assert_eq!(built.build.build_number, expected);
            previous = Some(built.build);
        }
    }

    #[tokio::test]
    async fn test_stop_reuses_previous_version_and_state() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        fixture.seed(&store).await;
        let (mut previous, _) = fixture
            .seed_build(&store, 1, WorkspaceTransition::Start)
            .await;
        previous.provisioner_state = b"tfstate".to_vec();

        // A newer active version exists but stop keeps the built one.
        let newer = TemplateVersion {
            id: ResourceId::new(),
            name: "v2".to_string(),
            ..fixture.version.clone()
        };
        let newer_id = newer.id;
        let template_id = fixture.template.id;
        store
            .seed(move |d| {
                d.template_versions.push(newer);
                if let Some(t) = d.templates.iter_mut().find(|t| t.id == template_id) {
                    t.active_version_id = newer_id;
                }
            })
            .await;

        let mut req = request(&fixture, WorkspaceTransition::Stop);
        req.previous = Some(previous.clone());
        req.reason = Some("autostop".to_string());
        let built = build_committed(&store, req).await.unwrap();

        assert_eq!(built.build.template_version_id, fixture.version.id);
        assert_eq!(built.build.provisioner_state, b"tfstate".to_vec());
        // Reason only applies to start.
        assert_eq!(built.build.reason, REASON_INITIATOR);

        let mut req = request(&fixture, WorkspaceTransition::Start);
        req.previous = Some(built.build);
        let started = build_committed(&store, req).await.unwrap();
        assert_eq!(started.build.template_version_id, newer_id);
    }

    #[tokio::test]
    async fn test_parameters_overlay_previous_values() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        fixture.seed(&store).await;
        let (previous, _) = fixture
            .seed_build(&store, 1, WorkspaceTransition::Start)
            .await;
        let previous_id = previous.id;
        store
            .seed(move |d| {
                d.build_parameters.extend([
                    WorkspaceBuildParameter {
                        workspace_build_id: previous_id,
                        name: "region".to_string(),
                        value: "eu".to_string(),
                    },
                    WorkspaceBuildParameter {
                        workspace_build_id: previous_id,
                        name: "cpu".to_string(),
                        value: "2".to_string(),
                    },
                ]);
            })
            .await;

        let mut req = request(&fixture, WorkspaceTransition::Start);
        req.previous = Some(previous);
        req.rich_parameter_values = vec![
            ParameterValue {
                name: "cpu".to_string(),
                value: "4".to_string(),
            },
            ParameterValue {
                name: "disk".to_string(),
                value: "20".to_string(),
            },
        ];
        let built = build_committed(&store, req).await.unwrap();

        let stored = store.get_build_parameters(built.build.id).await.unwrap();
        let values: Vec<(&str, &str)> = stored
            .iter()
            .map(|p| (p.name.as_str(), p.value.as_str()))
            .collect();
        assert_eq!(values, vec![("region", "eu"), ("cpu", "4"), ("disk", "20")]);
        assert_eq!(built.parameters, stored);
    }

    #[tokio::test]
    async fn test_denied_authorization_is_forbidden() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        fixture.seed(&store).await;

        let tx = store.begin().await.unwrap();
        let result = WorkspaceBuilder::default()
            .build(&*tx, request(&fixture, WorkspaceTransition::Delete), &deny_all)
            .await;
        assert!(matches!(result, Err(Error::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_version_from_another_template_is_rejected() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        fixture.seed(&store).await;
        let foreign = TemplateVersion {
            id: ResourceId::new(),
            template_id: ResourceId::new(),
            ..fixture.version.clone()
        };
        let foreign_id = foreign.id;
        store.seed(move |d| d.template_versions.push(foreign)).await;

        let mut req = request(&fixture, WorkspaceTransition::Start);
        req.template_version_id = Some(foreign_id);
        let result = build_committed(&store, req).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let mut req = request(&fixture, WorkspaceTransition::Start);
        req.template_version_id = Some(ResourceId::new());
        let result = build_committed(&store, req).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_preset_must_belong_to_version() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        fixture.seed(&store).await;
        let preset = TemplateVersionPreset {
            id: ResourceId::new(),
            template_version_id: ResourceId::new(),
            name: "large".to_string(),
        };
        let preset_id = preset.id;
        store.seed(move |d| d.presets.push(preset)).await;

        let mut req = request(&fixture, WorkspaceTransition::Start);
        req.template_version_preset_id = Some(preset_id);
        let result = build_committed(&store, req).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_orphan_delete_without_live_worker_completes_job() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        fixture.seed(&store).await;
        let stale = fixture.daemon("stale", Some(Utc::now() - ChronoDuration::hours(1)));
        store.seed(move |d| d.daemons.push(stale)).await;

        let mut req = request(&fixture, WorkspaceTransition::Delete);
        req.orphan = true;
        let built = build_committed(&store, req).await.unwrap();

        assert!(built.job.completed_at.is_some());
        assert_eq!(built.job.status(), ProvisionerJobStatus::Succeeded);
        assert_eq!(built.eligible.len(), 1);
        let stored = store.get_job(built.job.id).await.unwrap();
        assert!(stored.completed_at.is_some());
        assert!(store.get_workspace(fixture.workspace.id).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn test_orphan_delete_with_live_worker_stays_pending() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        fixture.seed(&store).await;
        let live = fixture.daemon("live", Some(Utc::now()));
        store.seed(move |d| d.daemons.push(live)).await;

        let mut req = request(&fixture, WorkspaceTransition::Delete);
        req.orphan = true;
        let built = build_committed(&store, req).await.unwrap();

        assert_eq!(built.job.status(), ProvisionerJobStatus::Pending);
        assert!(!store.get_workspace(fixture.workspace.id).await.unwrap().deleted);
    }
}
