//! Build submission.
//!
//! The build and its job are written in one transaction. Everything after
//! the commit (job announcement, audit, notifications, the workspace
//! event) is best-effort: failures are logged and never undo the build.

use buildplane_core::audit::{AuditAction, AuditEntry};
use buildplane_core::authz::{Subject, with_prebuilt_fallback};
use buildplane_core::notification::{Notification, TEMPLATE_WORKSPACE_MANUALLY_UPDATED};
use buildplane_core::workspace::{
    ROLE_OWNER, ROLE_TEMPLATE_ADMIN, WorkspaceBuild, WorkspaceTransition,
};
use buildplane_core::{Error, ResourceId, Result};
use buildplane_db::{Queries, Store, StoreTx};
use buildplane_scheduler::{
    BuildRequest, BuiltWorkspace, JobWithQueuePosition, ParameterValue, announce_job,
    matched_provisioners,
};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::BuildService;
use crate::assemble::build_view;
use crate::view::WorkspaceBuildView;

/// Log level a build may request from its provisioner.
const LOG_LEVEL_DEBUG: &str = "debug";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBuildRequest {
    pub transition: WorkspaceTransition,
    #[serde(default)]
    pub template_version_id: Option<ResourceId>,
    #[serde(default)]
    pub template_version_preset_id: Option<ResourceId>,
    #[serde(default)]
    pub rich_parameter_values: Vec<ParameterValue>,
    #[serde(default)]
    pub provisioner_state: Option<Vec<u8>>,
    /// Delete the workspace's records without tearing down its resources.
    #[serde(default)]
    pub orphan: bool,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl CreateBuildRequest {
    pub fn new(transition: WorkspaceTransition) -> Self {
        Self {
            transition,
            template_version_id: None,
            template_version_preset_id: None,
            rich_parameter_values: Vec::new(),
            provisioner_state: None,
            orphan: false,
            log_level: None,
            reason: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.orphan && self.transition != WorkspaceTransition::Delete {
            return Err(Error::InvalidInput(
                "orphan is only permitted when deleting a workspace".to_string(),
            ));
        }
        if self.orphan && self.provisioner_state.as_ref().is_some_and(|s| !s.is_empty()) {
            return Err(Error::InvalidInput(
                "provisioner_state cannot be specified together with orphan".to_string(),
            ));
        }
        if let Some(level) = &self.log_level {
            if level != LOG_LEVEL_DEBUG {
                return Err(Error::InvalidInput(format!(
                    "unsupported log level {level:?}; only {LOG_LEVEL_DEBUG:?} is allowed"
                )));
            }
        }
        Ok(())
    }
}

impl BuildService {
    /// Create a new build of a workspace.
    pub async fn submit(
        &self,
        subject: &Subject,
        workspace_id: ResourceId,
        request: CreateBuildRequest,
    ) -> Result<WorkspaceBuildView> {
        request.validate()?;

        let tx = self.store.begin().await?;
        let previous = tx.get_latest_build(workspace_id).await?;
        let build_request = BuildRequest {
            workspace_id,
            initiator_id: subject.user_id,
            initiator_username: subject.username.clone(),
            transition: request.transition,
            template_version_id: request.template_version_id,
            template_version_preset_id: request.template_version_preset_id,
            rich_parameter_values: request.rich_parameter_values.clone(),
            provisioner_state: request.provisioner_state.clone(),
            orphan: request.orphan,
            log_level: request.log_level.clone(),
            reason: request.reason.clone(),
            previous: previous.clone(),
        };
        let authorize = with_prebuilt_fallback(self.authorizer.as_ref(), subject);
        let built = self
            .builder
            .build(tx.as_ref(), build_request, &authorize)
            .await?;
        let version = tx
            .get_template_version(built.build.template_version_id)
            .await?;
        tx.commit().await?;

        info!(
            workspace_id = %built.workspace.id,
            build_id = %built.build.id,
            build_number = built.build.build_number,
            transition = %built.build.transition,
            job_id = %built.job.id,
            "Created workspace build"
        );

        if let Err(e) = announce_job(self.pubsub.as_ref(), &built.job).await {
            warn!(job_id = %built.job.id, error = %e, "Failed to announce provisioner job");
        }
        if request.orphan && built.job.completed_at.is_some() {
            self.audit_orphan_delete(&built, previous.as_ref()).await;
        }
        if let Some(version_id) = request.template_version_id {
            if previous
                .as_ref()
                .is_none_or(|p| p.template_version_id != version_id)
            {
                self.notify_manual_update(subject, &built, &request.rich_parameter_values)
                    .await;
            }
        }
        self.publish_state_change(built.workspace.owner_id, built.workspace.id)
            .await;

        let matched = matched_provisioners(
            built
                .eligible
                .iter()
                .filter(|e| e.job_id == built.job.id)
                .map(|e| &e.daemon),
            Utc::now(),
            self.stale_interval,
        );
        let queued = JobWithQueuePosition {
            job: built.job.clone(),
            queue_position: 0,
            queue_size: 0,
        };
        Ok(build_view(
            &built.workspace,
            &built.build,
            &queued,
            &version.name,
            Vec::new(),
            matched,
        ))
    }

    /// Record an orphan delete the builder finished without a provisioner.
    async fn audit_orphan_delete(&self, built: &BuiltWorkspace, previous: Option<&WorkspaceBuild>) {
        let BuiltWorkspace {
            workspace,
            build,
            job,
            ..
        } = built;
        warn!(
            workspace_id = %workspace.id,
            build_id = %build.id,
            "Orphaned workspace deleted without a provisioner; resources may still exist"
        );
        let entry = AuditEntry {
            time: Utc::now(),
            user_id: job.initiator_id,
            organization_id: workspace.organization_id,
            request_id: job.id,
            action: AuditAction::Delete,
            resource_type: "workspace_build".to_string(),
            resource_id: build.id,
            old: serde_json::to_value(previous).unwrap_or_default(),
            new: serde_json::to_value(build).unwrap_or_default(),
            status: 200,
            additional_fields: json!({
                "workspace_name": workspace.name,
                "build_number": build.build_number.to_string(),
                "build_reason": build.reason,
                "workspace_id": workspace.id,
                "workspace_owner": workspace.owner_username,
            }),
        };
        if let Err(e) = self.auditor.write(entry).await {
            warn!(build_id = %build.id, error = %e, "Failed to write audit record");
        }
    }

    /// Tell template admins a user moved a workspace to another version.
    /// `parameters` are the values the request changed, not the merged set.
    async fn notify_manual_update(
        &self,
        subject: &Subject,
        built: &BuiltWorkspace,
        parameters: &[ParameterValue],
    ) {
        let BuiltWorkspace {
            workspace,
            template,
            ..
        } = built;
        let store = self.store.as_ref();
        let roles = [ROLE_OWNER, ROLE_TEMPLATE_ADMIN];
        let lookups = futures::try_join!(
            store.get_users_with_roles(&roles),
            store.get_template_version(template.active_version_id),
            store.get_user(workspace.owner_id),
            store.get_user(subject.user_id),
        );
        let (admins, active_version, owner, initiator) = match lookups {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    workspace_id = %workspace.id,
                    error = %e,
                    "Failed to load recipients for workspace update notification"
                );
                return;
            }
        };

        let labels: BTreeMap<String, String> = [
            ("organization", template.organization_name.as_str()),
            ("initiator", initiator.name.as_str()),
            ("workspace", workspace.name.as_str()),
            ("template", template.name.as_str()),
            ("version", active_version.name.as_str()),
            ("workspace_owner_username", owner.username.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let data = json!({
            "workspace": { "id": workspace.id, "name": workspace.name },
            "template": { "id": template.id, "name": template.name },
            "template_version": { "id": active_version.id, "name": active_version.name },
            "owner": { "id": owner.id, "name": owner.name, "email": owner.email },
            "parameters": parameters
                .iter()
                .map(|p| json!({ "name": p.name, "value": p.value }))
                .collect::<Vec<_>>(),
        });

        let recipients: Vec<ResourceId> = admins
            .iter()
            .map(|u| u.id)
            .filter(|id| *id != subject.user_id)
            .collect();
        let deliveries = recipients.iter().map(|recipient_id| {
            self.notifier.enqueue(Notification {
                recipient_id: *recipient_id,
                template_id: TEMPLATE_WORKSPACE_MANUALLY_UPDATED,
                labels: labels.clone(),
                data: data.clone(),
                created_by: "api-workspaces-updated".to_string(),
                targets: vec![
                    workspace.id,
                    workspace.owner_id,
                    template.id,
                    workspace.organization_id,
                ],
            })
        });
        let results = join_all(deliveries).await;
        for (recipient_id, result) in recipients.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    recipient_id = %recipient_id,
                    workspace_id = %workspace.id,
                    error = %e,
                    "Failed to notify template admin"
                );
            }
        }
    }
}
