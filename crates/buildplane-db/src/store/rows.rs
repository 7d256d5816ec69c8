//! Database rows and their conversion into domain types.

use buildplane_core::ResourceId;
use buildplane_core::job::{EligibleDaemon, ProvisionerDaemon, ProvisionerJob, Tags};
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
use sqlx::types::Json;
use std::str::FromStr;
use uuid::Uuid;

use super::QueueRank;
use crate::{DbError, DbResult};

fn parse<T: FromStr>(column: &str, value: &str) -> DbResult<T> {
    value
        .parse()
        .map_err(|_| DbError::InvalidData(format!("unknown {column}: {value}")))
}

/// Convert every row, failing on the first one that does not map.
pub fn convert<R, T>(rows: Vec<R>) -> DbResult<Vec<T>>
where
    T: TryFrom<R, Error = DbError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub name: String,
    pub email: String,
    pub roles: Vec<String>,
}

impl TryFrom<UserRow> for User {
    type Error = DbError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row.id.into(),
            username: row.username,
            name: row.name,
            email: row.email,
            roles: row.roles,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkspaceRow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub owner_id: Uuid,
    pub owner_username: String,
    pub owner_avatar_url: String,
    pub template_id: Uuid,
    pub name: String,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = DbError;

    fn try_from(row: WorkspaceRow) -> Result<Self, Self::Error> {
        Ok(Workspace {
            id: row.id.into(),
            organization_id: row.organization_id.into(),
            owner_id: row.owner_id.into(),
            owner_username: row.owner_username,
            owner_avatar_url: row.owner_avatar_url,
            template_id: row.template_id.into(),
            name: row.name,
            deleted: row.deleted,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TemplateRow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub organization_name: String,
    pub name: String,
    pub active_version_id: Uuid,
    pub allow_user_cancel_workspace_jobs: bool,
}

impl TryFrom<TemplateRow> for Template {
    type Error = DbError;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        Ok(Template {
            id: row.id.into(),
            organization_id: row.organization_id.into(),
            organization_name: row.organization_name,
            name: row.name,
            active_version_id: row.active_version_id.into(),
            allow_user_cancel_workspace_jobs: row.allow_user_cancel_workspace_jobs,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TemplateVersionRow {
    pub id: Uuid,
    pub template_id: Uuid,
    pub name: String,
    pub provisioner_tags: Json<Tags>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TemplateVersionRow> for TemplateVersion {
    type Error = DbError;

    fn try_from(row: TemplateVersionRow) -> Result<Self, Self::Error> {
        Ok(TemplateVersion {
            id: row.id.into(),
            template_id: row.template_id.into(),
            name: row.name,
            provisioner_tags: row.provisioner_tags.0,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PresetRow {
    pub id: Uuid,
    pub template_version_id: Uuid,
    pub name: String,
}

impl TryFrom<PresetRow> for TemplateVersionPreset {
    type Error = DbError;

    fn try_from(row: PresetRow) -> Result<Self, Self::Error> {
        Ok(TemplateVersionPreset {
            id: row.id.into(),
            template_version_id: row.template_version_id.into(),
            name: row.name,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub workspace_id: Uuid,
    pub template_version_id: Uuid,
    pub build_number: i32,
    pub transition: String,
    pub initiator_id: Uuid,
    pub initiator_username: Option<String>,
    pub provisioner_state: Vec<u8>,
    pub job_id: Uuid,
    pub deadline: Option<DateTime<Utc>>,
    pub max_deadline: Option<DateTime<Utc>>,
    pub reason: String,
    pub daily_cost: i32,
    pub template_version_preset_id: Option<Uuid>,
    pub has_ai_task: Option<bool>,
    pub ai_task_sidebar_app_id: Option<Uuid>,
}

impl TryFrom<BuildRow> for WorkspaceBuild {
    type Error = DbError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        Ok(WorkspaceBuild {
            id: row.id.into(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            workspace_id: row.workspace_id.into(),
            template_version_id: row.template_version_id.into(),
            build_number: row.build_number,
            transition: parse("transition", &row.transition)?,
            initiator_id: row.initiator_id.into(),
            initiator_username: row.initiator_username.unwrap_or_default(),
            provisioner_state: row.provisioner_state,
            job_id: row.job_id.into(),
            deadline: row.deadline,
            max_deadline: row.max_deadline,
            reason: row.reason,
            daily_cost: row.daily_cost,
            template_version_preset_id: row.template_version_preset_id.map(Into::into),
            has_ai_task: row.has_ai_task,
            ai_task_sidebar_app_id: row.ai_task_sidebar_app_id.map(Into::into),
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildParameterRow {
    pub workspace_build_id: Uuid,
    pub name: String,
    pub value: String,
}

impl TryFrom<BuildParameterRow> for WorkspaceBuildParameter {
    type Error = DbError;

    fn try_from(row: BuildParameterRow) -> Result<Self, Self::Error> {
        Ok(WorkspaceBuildParameter {
            workspace_build_id: row.workspace_build_id.into(),
            name: row.name,
            value: row.value,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub initiator_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub worker_id: Option<Uuid>,
    pub provisioner: String,
    pub tags: Json<Tags>,
    pub input: serde_json::Value,
}

impl TryFrom<JobRow> for ProvisionerJob {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(ProvisionerJob {
            id: row.id.into(),
            organization_id: row.organization_id.into(),
            initiator_id: row.initiator_id.into(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            canceled_at: row.canceled_at,
            error: row.error,
            error_code: row.error_code,
            worker_id: row.worker_id.map(Into::into),
            provisioner: row.provisioner,
            tags: row.tags.0,
            input: row.input,
        })
    }
}

/// A daemon joined with the job it is eligible for.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EligibleDaemonRow {
    pub job_id: Uuid,
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub tags: Json<Tags>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EligibleDaemonRow> for EligibleDaemon {
    type Error = DbError;

    fn try_from(row: EligibleDaemonRow) -> Result<Self, Self::Error> {
        Ok(EligibleDaemon {
            job_id: row.job_id.into(),
            daemon: ProvisionerDaemon {
                id: row.id.into(),
                organization_id: row.organization_id.into(),
                name: row.name,
                tags: row.tags.0,
                last_seen_at: row.last_seen_at,
                created_at: row.created_at,
            },
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueRankRow {
    pub job_id: Uuid,
    pub queue_position: i64,
    pub queue_size: i64,
}

impl TryFrom<QueueRankRow> for QueueRank {
    type Error = DbError;

    fn try_from(row: QueueRankRow) -> Result<Self, Self::Error> {
        Ok(QueueRank {
            job_id: row.job_id.into(),
            position: row.queue_position,
            size: row.queue_size,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub job_id: Uuid,
    pub transition: String,
    pub resource_type: String,
    pub name: String,
    pub hide: bool,
    pub icon: String,
    pub daily_cost: i32,
}

impl TryFrom<ResourceRow> for WorkspaceResource {
    type Error = DbError;

    fn try_from(row: ResourceRow) -> Result<Self, Self::Error> {
        Ok(WorkspaceResource {
            id: row.id.into(),
            created_at: row.created_at,
            job_id: row.job_id.into(),
            transition: parse("transition", &row.transition)?,
            resource_type: row.resource_type,
            name: row.name,
            hide: row.hide,
            icon: row.icon,
            daily_cost: row.daily_cost,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MetadatumRow {
    pub workspace_resource_id: Uuid,
    pub key: String,
    pub value: Option<String>,
    pub sensitive: bool,
}

impl TryFrom<MetadatumRow> for WorkspaceResourceMetadatum {
    type Error = DbError;

    fn try_from(row: MetadatumRow) -> Result<Self, Self::Error> {
        Ok(WorkspaceResourceMetadatum {
            workspace_resource_id: row.workspace_resource_id.into(),
            key: row.key,
            value: row.value,
            sensitive: row.sensitive,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub resource_id: Uuid,
    pub name: String,
    pub operating_system: String,
    pub architecture: String,
    pub display_order: i32,
    pub first_connected_at: Option<DateTime<Utc>>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl TryFrom<AgentRow> for WorkspaceAgent {
    type Error = DbError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        Ok(WorkspaceAgent {
            id: row.id.into(),
            created_at: row.created_at,
            resource_id: row.resource_id.into(),
            name: row.name,
            operating_system: row.operating_system,
            architecture: row.architecture,
            display_order: row.display_order,
            first_connected_at: row.first_connected_at,
            last_connected_at: row.last_connected_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppRow {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub slug: String,
    pub display_name: String,
    pub url: Option<String>,
    pub icon: String,
    pub external: bool,
    pub hidden: bool,
    pub display_order: i32,
}

impl TryFrom<AppRow> for WorkspaceApp {
    type Error = DbError;

    fn try_from(row: AppRow) -> Result<Self, Self::Error> {
        Ok(WorkspaceApp {
            id: row.id.into(),
            agent_id: row.agent_id.into(),
            slug: row.slug,
            display_name: row.display_name,
            url: row.url,
            icon: row.icon,
            external: row.external,
            hidden: row.hidden,
            display_order: row.display_order,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppStatusRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub agent_id: Uuid,
    pub app_id: Uuid,
    pub state: String,
    pub message: String,
    pub uri: Option<String>,
}

impl TryFrom<AppStatusRow> for WorkspaceAppStatus {
    type Error = DbError;

    fn try_from(row: AppStatusRow) -> Result<Self, Self::Error> {
        Ok(WorkspaceAppStatus {
            id: row.id.into(),
            created_at: row.created_at,
            agent_id: row.agent_id.into(),
            app_id: row.app_id.into(),
            state: parse("app status state", &row.state)?,
            message: row.message,
            uri: row.uri,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScriptRow {
    pub id: Uuid,
    pub workspace_agent_id: Uuid,
    pub log_source_id: Uuid,
    pub display_name: String,
    pub script: String,
    pub cron: String,
    pub run_on_start: bool,
    pub run_on_stop: bool,
    pub start_blocks_login: bool,
    pub timeout_seconds: i32,
}

impl TryFrom<ScriptRow> for WorkspaceAgentScript {
    type Error = DbError;

    fn try_from(row: ScriptRow) -> Result<Self, Self::Error> {
        Ok(WorkspaceAgentScript {
            id: row.id.into(),
            workspace_agent_id: row.workspace_agent_id.into(),
            log_source_id: row.log_source_id.into(),
            display_name: row.display_name,
            script: row.script,
            cron: row.cron,
            run_on_start: row.run_on_start,
            run_on_stop: row.run_on_stop,
            start_blocks_login: row.start_blocks_login,
            timeout_seconds: row.timeout_seconds,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LogSourceRow {
    pub id: Uuid,
    pub workspace_agent_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub display_name: String,
    pub icon: String,
}

impl TryFrom<LogSourceRow> for WorkspaceAgentLogSource {
    type Error = DbError;

    fn try_from(row: LogSourceRow) -> Result<Self, Self::Error> {
        Ok(WorkspaceAgentLogSource {
            id: row.id.into(),
            workspace_agent_id: row.workspace_agent_id.into(),
            created_at: row.created_at,
            display_name: row.display_name,
            icon: row.icon,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProvisionerTimingRow {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub stage: String,
    pub source: String,
    pub action: String,
    pub resource: String,
}

impl TryFrom<ProvisionerTimingRow> for ProvisionerJobTiming {
    type Error = DbError;

    fn try_from(row: ProvisionerTimingRow) -> Result<Self, Self::Error> {
        Ok(ProvisionerJobTiming {
            job_id: row.job_id.into(),
            started_at: row.started_at,
            ended_at: row.ended_at,
            stage: parse("timing stage", &row.stage)?,
            source: row.source,
            action: row.action,
            resource: row.resource,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScriptTimingRow {
    pub script_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub exit_code: i32,
    pub stage: String,
    pub status: String,
    pub display_name: String,
    pub workspace_agent_id: Uuid,
    pub workspace_agent_name: String,
}

impl TryFrom<ScriptTimingRow> for AgentScriptTimingRow {
    type Error = DbError;

    fn try_from(row: ScriptTimingRow) -> Result<Self, Self::Error> {
        Ok(AgentScriptTimingRow {
            script_id: row.script_id.into(),
            started_at: row.started_at,
            ended_at: row.ended_at,
            exit_code: row.exit_code,
            stage: parse("timing stage", &row.stage)?,
            status: row.status,
            display_name: row.display_name,
            workspace_agent_id: ResourceId::from_uuid(row.workspace_agent_id),
            workspace_agent_name: row.workspace_agent_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildplane_core::workspace::WorkspaceTransition;

    fn build_row(transition: &str) -> BuildRow {
        BuildRow {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            workspace_id: Uuid::now_v7(),
            template_version_id: Uuid::now_v7(),
            build_number: 3,
            transition: transition.to_string(),
            initiator_id: Uuid::now_v7(),
            initiator_username: None,
            provisioner_state: vec![1, 2],
            job_id: Uuid::now_v7(),
            deadline: None,
            max_deadline: None,
            reason: "initiator".to_string(),
            daily_cost: 0,
            template_version_preset_id: None,
            has_ai_task: None,
            ai_task_sidebar_app_id: None,
        }
    }

    #[test]
    fn test_build_row_conversion() {
        let build = WorkspaceBuild::try_from(build_row("stop")).unwrap();
        assert_eq!(build.transition, WorkspaceTransition::Stop);
        assert_eq!(build.initiator_username, "");
        assert_eq!(build.provisioner_state, vec![1, 2]);
    }

    #[test]
    fn test_unknown_transition_is_invalid_data() {
        let err = WorkspaceBuild::try_from(build_row("restart")).unwrap_err();
        assert!(matches!(err, DbError::InvalidData(_)));
    }
}
