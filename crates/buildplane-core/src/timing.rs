//! Timing events recorded while a build runs.
//!
//! Provisioner stage timings and agent script timings are stored rows;
//! agent connection timings are derived from agent rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Phase of a build a timing belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingStage {
    Init,
    Plan,
    Graph,
    Apply,
    Start,
    Stop,
    Cron,
    Connect,
}

impl TimingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimingStage::Init => "init",
            TimingStage::Plan => "plan",
            TimingStage::Graph => "graph",
            TimingStage::Apply => "apply",
            TimingStage::Start => "start",
            TimingStage::Stop => "stop",
            TimingStage::Cron => "cron",
            TimingStage::Connect => "connect",
        }
    }
}

impl std::str::FromStr for TimingStage {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(TimingStage::Init),
            "plan" => Ok(TimingStage::Plan),
            "graph" => Ok(TimingStage::Graph),
            "apply" => Ok(TimingStage::Apply),
            "start" => Ok(TimingStage::Start),
            "stop" => Ok(TimingStage::Stop),
            "cron" => Ok(TimingStage::Cron),
            "connect" => Ok(TimingStage::Connect),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown timing stage {other:?}"
            ))),
        }
    }
}

/// One provisioner stage step (e.g. a terraform resource apply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerJobTiming {
    pub job_id: ResourceId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub stage: TimingStage,
    pub source: String,
    pub action: String,
    pub resource: String,
}

/// One run of an agent script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceAgentScriptTiming {
    pub script_id: ResourceId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub exit_code: i32,
    pub stage: TimingStage,
    pub status: String,
}

/// A script timing joined with the script and agent that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentScriptTimingRow {
    pub script_id: ResourceId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub exit_code: i32,
    pub stage: TimingStage,
    pub status: String,
    pub display_name: String,
    pub workspace_agent_id: ResourceId,
    pub workspace_agent_name: String,
}

/// Zero-valued timestamps (the Unix epoch or anything before it) mark a
/// timing whose start or end was never recorded.
pub fn is_zero_time(t: &DateTime<Utc>) -> bool {
    t.timestamp() <= 0
}
