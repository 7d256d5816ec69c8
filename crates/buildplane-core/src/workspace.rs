//! Workspaces, templates and workspace builds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::job::{ProvisionerJobStatus, Tags};

/// Role granting every permission, including canceling any build.
pub const ROLE_OWNER: &str = "owner";
/// Role administering templates; receives workspace update notifications.
pub const ROLE_TEMPLATE_ADMIN: &str = "template-admin";

/// Owner of every prebuilt workspace until it is claimed by a user.
pub const PREBUILDS_SYSTEM_USER_ID: ResourceId =
    ResourceId::from_u128(0xc42fdf75_3097_471c_8c33_fb52454d81c0);

/// Default build reason when the caller supplies none.
pub const REASON_INITIATOR: &str = "initiator";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: ResourceId,
    pub username: String,
    pub name: String,
    pub email: String,
    pub roles: Vec<String>,
}

impl User {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: ResourceId,
    pub organization_id: ResourceId,
    pub owner_id: ResourceId,
    pub owner_username: String,
    pub owner_avatar_url: String,
    pub template_id: ResourceId,
    pub name: String,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn is_prebuild(&self) -> bool {
        self.owner_id == PREBUILDS_SYSTEM_USER_ID
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: ResourceId,
    pub organization_id: ResourceId,
    pub organization_name: String,
    pub name: String,
    pub active_version_id: ResourceId,
    pub allow_user_cancel_workspace_jobs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub id: ResourceId,
    pub template_id: ResourceId,
    pub name: String,
    /// Tags every job built from this version requires of its worker.
    pub provisioner_tags: Tags,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVersionPreset {
    pub id: ResourceId,
    pub template_version_id: ResourceId,
    pub name: String,
}

/// Requested direction of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceTransition {
    Start,
    Stop,
    Delete,
}

impl WorkspaceTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceTransition::Start => "start",
            WorkspaceTransition::Stop => "stop",
            WorkspaceTransition::Delete => "delete",
        }
    }
}

impl std::fmt::Display for WorkspaceTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkspaceTransition {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(WorkspaceTransition::Start),
            "stop" => Ok(WorkspaceTransition::Stop),
            "delete" => Ok(WorkspaceTransition::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown transition {other:?}"
            ))),
        }
    }
}

/// A single build of a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceBuild {
    pub id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub workspace_id: ResourceId,
    pub template_version_id: ResourceId,
    pub build_number: i32,
    pub transition: WorkspaceTransition,
    pub initiator_id: ResourceId,
    pub initiator_username: String,
    /// Opaque state handed to the provisioner on the next build.
    #[serde(skip)]
    pub provisioner_state: Vec<u8>,
    pub job_id: ResourceId,
    pub deadline: Option<DateTime<Utc>>,
    pub max_deadline: Option<DateTime<Utc>>,
    pub reason: String,
    pub daily_cost: i32,
    pub template_version_preset_id: Option<ResourceId>,
    pub has_ai_task: Option<bool>,
    pub ai_task_sidebar_app_id: Option<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceBuildParameter {
    pub workspace_build_id: ResourceId,
    pub name: String,
    pub value: String,
}

/// Client-facing status of a workspace, a function of its latest build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Canceling,
    Canceled,
    Deleting,
    Deleted,
}

impl WorkspaceStatus {
    /// Combine the job's derived status with the build's transition.
    pub fn from_job(status: ProvisionerJobStatus, transition: WorkspaceTransition) -> Self {
        use WorkspaceTransition::*;
        match (status, transition) {
            (ProvisionerJobStatus::Pending, _) => WorkspaceStatus::Pending,
            (ProvisionerJobStatus::Running, Start) => WorkspaceStatus::Starting,
            (ProvisionerJobStatus::Running, Stop) => WorkspaceStatus::Stopping,
            (ProvisionerJobStatus::Running, Delete) => WorkspaceStatus::Deleting,
            (ProvisionerJobStatus::Succeeded, Start) => WorkspaceStatus::Running,
            (ProvisionerJobStatus::Succeeded, Stop) => WorkspaceStatus::Stopped,
            (ProvisionerJobStatus::Succeeded, Delete) => WorkspaceStatus::Deleted,
            (ProvisionerJobStatus::Canceling, _) => WorkspaceStatus::Canceling,
            (ProvisionerJobStatus::Canceled, _) => WorkspaceStatus::Canceled,
            (ProvisionerJobStatus::Failed, _) => WorkspaceStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_delete_reports_deleted() {
        assert_eq!(
            WorkspaceStatus::from_job(ProvisionerJobStatus::Succeeded, WorkspaceTransition::Delete),
            WorkspaceStatus::Deleted
        );
        assert_eq!(
            WorkspaceStatus::from_job(ProvisionerJobStatus::Succeeded, WorkspaceTransition::Start),
            WorkspaceStatus::Running
        );
    }

    #[test]
    fn test_running_status_follows_transition() {
        assert_eq!(
            WorkspaceStatus::from_job(ProvisionerJobStatus::Running, WorkspaceTransition::Stop),
            WorkspaceStatus::Stopping
        );
        assert_eq!(
            WorkspaceStatus::from_job(ProvisionerJobStatus::Running, WorkspaceTransition::Delete),
            WorkspaceStatus::Deleting
        );
    }

    #[test]
    fn test_transition_parse() {
        assert_eq!(
            "delete".parse::<WorkspaceTransition>().unwrap(),
            WorkspaceTransition::Delete
        );
        assert!("restart".parse::<WorkspaceTransition>().is_err());
    }

    #[test]
    fn test_prebuild_detection() {
        let mut ws = Workspace {
            id: ResourceId::new(),
            organization_id: ResourceId::new(),
            owner_id: PREBUILDS_SYSTEM_USER_ID,
            owner_username: "prebuilds".to_string(),
            owner_avatar_url: String::new(),
            template_id: ResourceId::new(),
            name: "prebuild-1".to_string(),
            deleted: false,
            created_at: Utc::now(),
        };
        assert!(ws.is_prebuild());
        ws.owner_id = ResourceId::new();
        assert!(!ws.is_prebuild());
    }
}
