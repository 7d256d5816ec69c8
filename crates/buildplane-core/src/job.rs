//! Provisioner jobs and the daemons that execute them.
//!
//! A job is the dispatchable unit of work backing one workspace build. Its
//! status is never stored; it is derived from the lifecycle timestamps a
//! worker (or a cancellation) writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ResourceId;

/// Tag set used to match jobs to workers.
pub type Tags = BTreeMap<String, String>;

/// The only provisioner type this control plane dispatches to.
pub const PROVISIONER_TERRAFORM: &str = "terraform";

/// True when a worker advertising `offered` can serve a job requiring
/// `required`: every required tag must be present with the same value.
pub fn tags_satisfy(offered: &Tags, required: &Tags) -> bool {
    required
        .iter()
        .all(|(key, value)| offered.get(key) == Some(value))
}

/// A provisioner job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerJob {
    /// Unique identifier for this job.
    pub id: ResourceId,
    /// Organization whose workers may claim the job.
    pub organization_id: ResourceId,
    /// User that caused the job to be created.
    pub initiator_id: ResourceId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when a worker claims the job.
    pub started_at: Option<DateTime<Utc>>,
    /// Set once the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when cancellation was requested.
    pub canceled_at: Option<DateTime<Utc>>,
    /// Failure message reported by the worker, if any.
    pub error: Option<String>,
    pub error_code: Option<String>,
    /// Worker that claimed the job.
    pub worker_id: Option<ResourceId>,
    /// Provisioner type (e.g. "terraform").
    pub provisioner: String,
    /// Tags a worker must offer to claim this job.
    pub tags: Tags,
    /// Opaque job input handed to the worker.
    pub input: serde_json::Value,
}

impl ProvisionerJob {
    /// Immutable view of the fields the status is derived from.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            started_at: self.started_at,
            completed_at: self.completed_at,
            canceled_at: self.canceled_at,
            failed: self.error.as_deref().is_some_and(|e| !e.is_empty()),
            worker_id: self.worker_id,
        }
    }

    pub fn status(&self) -> ProvisionerJobStatus {
        ProvisionerJobStatus::derive(&self.snapshot())
    }
}

/// Input recorded on a workspace build job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceBuildJobInput {
    pub workspace_build_id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// The status-bearing fields of a job at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    /// A non-empty error was reported.
    pub failed: bool,
    pub worker_id: Option<ResourceId>,
}

/// Derived status of a provisioner job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerJobStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Finished without error.
    Succeeded,
    /// Cancellation requested; the worker has not yet acknowledged it.
    Canceling,
    /// Canceled and finished.
    Canceled,
    /// Finished with an error.
    Failed,
}

impl ProvisionerJobStatus {
    /// Total function over every combination of the lifecycle fields.
    pub fn derive(job: &JobSnapshot) -> Self {
        match (job.canceled_at, job.started_at, job.completed_at) {
            (Some(_), _, None) => ProvisionerJobStatus::Canceling,
            (Some(_), _, Some(_)) if job.failed => ProvisionerJobStatus::Failed,
            (Some(_), _, Some(_)) => ProvisionerJobStatus::Canceled,
            (None, None, _) => ProvisionerJobStatus::Pending,
            (None, Some(_), Some(_)) if job.failed => ProvisionerJobStatus::Failed,
            (None, Some(_), Some(_)) => ProvisionerJobStatus::Succeeded,
            (None, Some(_), None) => ProvisionerJobStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisionerJobStatus::Succeeded
                | ProvisionerJobStatus::Canceled
                | ProvisionerJobStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionerJobStatus::Pending => "pending",
            ProvisionerJobStatus::Running => "running",
            ProvisionerJobStatus::Succeeded => "succeeded",
            ProvisionerJobStatus::Canceling => "canceling",
            ProvisionerJobStatus::Canceled => "canceled",
            ProvisionerJobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProvisionerJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A heartbeating worker registered with the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerDaemon {
    pub id: ResourceId,
    pub organization_id: ResourceId,
    pub name: String,
    pub tags: Tags,
    /// Last heartbeat; unset if the daemon never reported in.
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A daemon eligible to serve a particular job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibleDaemon {
    pub job_id: ResourceId,
    pub daemon: ProvisionerDaemon,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(started: bool, completed: bool, canceled: bool, failed: bool) -> JobSnapshot {
        let now = Utc::now();
        JobSnapshot {
            started_at: started.then_some(now),
            completed_at: completed.then_some(now),
            canceled_at: canceled.then_some(now),
            failed,
            worker_id: started.then(ResourceId::new),
        }
    }

    #[test]
    fn test_derive_lifecycle() {
        use ProvisionerJobStatus::*;
        assert_eq!(ProvisionerJobStatus::derive(&snapshot(false, false, false, false)), Pending);
        assert_eq!(ProvisionerJobStatus::derive(&snapshot(true, false, false, false)), Running);
        assert_eq!(ProvisionerJobStatus::derive(&snapshot(true, true, false, false)), Succeeded);
        assert_eq!(ProvisionerJobStatus::derive(&snapshot(true, true, false, true)), Failed);
    }

    #[test]
    fn test_derive_cancellation() {
        use ProvisionerJobStatus::*;
        // Running job asked to cancel: the worker still owns it.
        assert_eq!(ProvisionerJobStatus::derive(&snapshot(true, false, true, false)), Canceling);
        // Pending job canceled instantly.
        assert_eq!(ProvisionerJobStatus::derive(&snapshot(false, true, true, false)), Canceled);
        assert_eq!(ProvisionerJobStatus::derive(&snapshot(true, true, true, false)), Canceled);
        assert_eq!(ProvisionerJobStatus::derive(&snapshot(true, true, true, true)), Failed);
    }

    #[test]
    fn test_empty_error_is_not_failure() {
        let now = Utc::now();
        let job = ProvisionerJob {
            id: ResourceId::new(),
            organization_id: ResourceId::new(),
            initiator_id: ResourceId::new(),
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            completed_at: Some(now),
            canceled_at: None,
            error: Some(String::new()),
            error_code: None,
            worker_id: None,
            provisioner: PROVISIONER_TERRAFORM.to_string(),
            tags: Tags::new(),
            input: serde_json::Value::Null,
        };
        assert_eq!(job.status(), ProvisionerJobStatus::Succeeded);
        assert!(job.status().is_terminal());
    }

    #[test]
    fn test_tags_satisfy_requires_superset() {
        let mut offered = Tags::new();
        offered.insert("scope".to_string(), "organization".to_string());
        offered.insert("region".to_string(), "eu".to_string());

        let mut required = Tags::new();
        required.insert("scope".to_string(), "organization".to_string());
        assert!(tags_satisfy(&offered, &required));

        required.insert("region".to_string(), "us".to_string());
        assert!(!tags_satisfy(&offered, &required));

        assert!(tags_satisfy(&Tags::new(), &Tags::new()));
        assert!(!tags_satisfy(&Tags::new(), &offered));
    }
}
