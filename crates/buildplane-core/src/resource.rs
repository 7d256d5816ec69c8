//! The infrastructure tree a completed job produces.
//!
//! resource → agents → {apps, scripts, log sources}; resource → metadata.
//! All of these rows are written by job completion and only read here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::workspace::WorkspaceTransition;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceResource {
    pub id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub job_id: ResourceId,
    pub transition: WorkspaceTransition,
    pub resource_type: String,
    pub name: String,
    pub hide: bool,
    pub icon: String,
    pub daily_cost: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceResourceMetadatum {
    pub workspace_resource_id: ResourceId,
    pub key: String,
    pub value: Option<String>,
    pub sensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceAgent {
    pub id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub resource_id: ResourceId,
    pub name: String,
    pub operating_system: String,
    pub architecture: String,
    /// Presentation order within the resource; lower sorts first.
    pub display_order: i32,
    pub first_connected_at: Option<DateTime<Utc>>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceApp {
    pub id: ResourceId,
    pub agent_id: ResourceId,
    pub slug: String,
    pub display_name: String,
    pub url: Option<String>,
    pub icon: String,
    pub external: bool,
    pub hidden: bool,
    pub display_order: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatusState {
    Working,
    Idle,
    Complete,
    Failure,
}

impl std::str::FromStr for AppStatusState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "working" => Ok(AppStatusState::Working),
            "idle" => Ok(AppStatusState::Idle),
            "complete" => Ok(AppStatusState::Complete),
            "failure" => Ok(AppStatusState::Failure),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown app status state {other:?}"
            ))),
        }
    }
}

/// A status report for an app; the newest one per app is current.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceAppStatus {
    pub id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub agent_id: ResourceId,
    pub app_id: ResourceId,
    pub state: AppStatusState,
    pub message: String,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceAgentScript {
    pub id: ResourceId,
    pub workspace_agent_id: ResourceId,
    pub log_source_id: ResourceId,
    pub display_name: String,
    pub script: String,
    pub cron: String,
    pub run_on_start: bool,
    pub run_on_stop: bool,
    pub start_blocks_login: bool,
    pub timeout_seconds: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceAgentLogSource {
    pub id: ResourceId,
    pub workspace_agent_id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub display_name: String,
    pub icon: String,
}
