//! Cancellation of a build's provisioner job.
//!
//! A pending job is finished immediately. A job a worker already claimed is
//! only marked canceled; the worker observes `canceled_at` and completes it.

use buildplane_core::authz::Subject;
use buildplane_core::job::ProvisionerJobStatus;
use buildplane_core::workspace::ROLE_OWNER;
use buildplane_core::{Error, ResourceId, Result};
use buildplane_db::{Queries, Store, StoreTx};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::BuildService;

/// Status the caller believes the job is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedStatus {
    Pending,
    Running,
}

impl ExpectedStatus {
    pub fn job_status(&self) -> ProvisionerJobStatus {
        match self {
            ExpectedStatus::Pending => ProvisionerJobStatus::Pending,
            ExpectedStatus::Running => ProvisionerJobStatus::Running,
        }
    }
}

impl std::str::FromStr for ExpectedStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExpectedStatus::Pending),
            "running" => Ok(ExpectedStatus::Running),
            other => Err(Error::InvalidInput(format!(
                "invalid expect_status {other:?}; only 'running' or 'pending' are allowed"
            ))),
        }
    }
}

impl BuildService {
    /// Cancel the job behind a build.
    ///
    /// Anyone who can see the workspace may cancel a pending job. Canceling a
    /// job that already started needs the template to allow it or the owner
    /// role. Builds of workspaces the caller cannot see are not found.
    pub async fn cancel(
        &self,
        subject: &Subject,
        build_id: ResourceId,
        expect_status: Option<ExpectedStatus>,
    ) -> Result<()> {
        let tx = self.store.begin().await?;
        let build = tx.get_build(build_id).await?;
        let workspace = tx.get_workspace(build.workspace_id).await?;
        self.ensure_readable(subject, &workspace, || format!("build {build_id}"))?;
        let job = tx.get_job_for_update(build.job_id).await?;
        let template = tx.get_template(workspace.template_id).await?;

        let status = job.status();
        let allowed = status == ProvisionerJobStatus::Pending
            || template.allow_user_cancel_workspace_jobs
            || subject.has_role(ROLE_OWNER);
        if !allowed {
            return Err(Error::Forbidden(
                "user is not allowed to cancel workspace builds".to_string(),
            ));
        }
        if job.completed_at.is_some() {
            return Err(Error::InvalidState("job has already completed".to_string()));
        }
        if job.canceled_at.is_some() {
            return Err(Error::InvalidState(
                "job has already been marked as canceled".to_string(),
            ));
        }
        if let Some(expected) = expect_status {
            if expected.job_status() != status {
                return Err(Error::PreconditionFailed(format!(
                    "job is not in the expected state: expected {}, got {status}",
                    expected.job_status()
                )));
            }
        }

        let now = Utc::now();
        // Without a worker nothing else will ever complete the job.
        let completed_at = job.worker_id.is_none().then_some(now);
        tx.update_job_cancel(job.id, now, completed_at).await?;
        tx.commit().await?;

        info!(
            build_id = %build.id,
            job_id = %job.id,
            previous_status = %status,
            canceled_by = %subject.user_id,
            "Canceled workspace build"
        );
        self.publish_state_change(workspace.owner_id, workspace.id)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use buildplane_core::events::workspace_event_channel;
    use buildplane_core::workspace::WorkspaceTransition;
    use chrono::{DateTime, Duration};

    /// Mark the job claimed by a worker.
    async fn start_job(h: &Harness, job_id: ResourceId) -> DateTime<Utc> {
        let started = Utc::now() - Duration::seconds(30);
        h.store
            .seed(move |d| {
                if let Some(job) = d.jobs.iter_mut().find(|j| j.id == job_id) {
                    job.started_at = Some(started);
                    job.worker_id = Some(ResourceId::new());
                }
            })
            .await;
        started
    }

    #[test]
    fn test_expected_status_parse() {
        assert_eq!(
            "running".parse::<ExpectedStatus>().unwrap(),
            ExpectedStatus::Running
        );
        let err = "succeeded".parse::<ExpectedStatus>().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cancel_pending_job_completes_it() {
        let h = Harness::new().await;
        let (build, job) = h
            .fixture
            .seed_build(&h.store, 1, WorkspaceTransition::Start)
            .await;
        // Policy forbids user cancellation, but pending jobs are exempt.
        let subject = Subject::from(&h.fixture.owner);

        h.service.cancel(&subject, build.id, None).await.unwrap();

        let canceled = h.store.snapshot().await.job(job.id).unwrap();
        assert!(canceled.canceled_at.is_some());
        assert_eq!(canceled.completed_at, canceled.canceled_at);
        assert_eq!(canceled.status(), ProvisionerJobStatus::Canceled);

        let events = h
            .pubsub
            .messages(&workspace_event_channel(h.fixture.workspace.owner_id));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_running_job_leaves_it_to_the_worker() {
        let h = Harness::new().await;
        let (build, job) = h
            .fixture
            .seed_build(&h.store, 1, WorkspaceTransition::Start)
            .await;
        start_job(&h, job.id).await;
        let subject = Subject::from(&h.fixture.site_owner);

        h.service
            .cancel(&subject, build.id, Some(ExpectedStatus::Running))
            .await
            .unwrap();

        let canceled = h.store.snapshot().await.job(job.id).unwrap();
        assert!(canceled.canceled_at.is_some());
        assert!(canceled.completed_at.is_none());
        assert_eq!(canceled.status(), ProvisionerJobStatus::Canceling);
    }

    #[tokio::test]
    async fn test_cancel_running_job_is_forbidden_without_permission() {
        let h = Harness::new().await;
        let (build, job) = h
            .fixture
            .seed_build(&h.store, 1, WorkspaceTransition::Start)
            .await;
        start_job(&h, job.id).await;
        let subject = Subject::from(&h.fixture.owner);

        let err = h.service.cancel(&subject, build.id, None).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let template_id = h.fixture.template.id;
        h.store
            .seed(move |d| {
                if let Some(t) = d.templates.iter_mut().find(|t| t.id == template_id) {
                    t.allow_user_cancel_workspace_jobs = true;
                }
            })
            .await;
        h.service.cancel(&subject, build.id, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_expect_pending_on_running_job_fails_without_mutation() {
        let h = Harness::new().await;
        let (build, job) = h
            .fixture
            .seed_build(&h.store, 1, WorkspaceTransition::Start)
            .await;
        let started = start_job(&h, job.id).await;
        let subject = Subject::from(&h.fixture.site_owner);

        let err = h
            .service
            .cancel(&subject, build.id, Some(ExpectedStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));

        let unchanged = h.store.snapshot().await.job(job.id).unwrap();
        assert_eq!(unchanged.started_at, Some(started));
        assert!(unchanged.canceled_at.is_none());
        assert!(unchanged.completed_at.is_none());
        assert!(
            h.pubsub
                .messages(&workspace_event_channel(h.fixture.workspace.owner_id))
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_cancel_twice_is_rejected() {
        let h = Harness::new().await;
        let (build, job) = h
            .fixture
            .seed_build(&h.store, 1, WorkspaceTransition::Start)
            .await;
        start_job(&h, job.id).await;
        let subject = Subject::from(&h.fixture.site_owner);

        h.service.cancel(&subject, build.id, None).await.unwrap();
        let first = h.store.snapshot().await.job(job.id).unwrap();

        let err = h.service.cancel(&subject, build.id, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let second = h.store.snapshot().await.job(job.id).unwrap();
        assert_eq!(first.canceled_at, second.canceled_at);
    }

    #[tokio::test]
    async fn test_cancel_completed_job_is_rejected() {
        let h = Harness::new().await;
        let (build, job) = h
            .fixture
            .seed_build(&h.store, 1, WorkspaceTransition::Start)
            .await;
        let job_id = job.id;
        h.store
            .seed(move |d| {
                if let Some(job) = d.jobs.iter_mut().find(|j| j.id == job_id) {
                    job.started_at = Some(Utc::now());
                    job.completed_at = Some(Utc::now());
                }
            })
            .await;
        let subject = Subject::from(&h.fixture.site_owner);

        let err = h.service.cancel(&subject, build.id, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(msg) if msg.contains("completed")));
        let unchanged = h.store.snapshot().await.job(job.id).unwrap();
        assert!(unchanged.canceled_at.is_none());
    }

    #[tokio::test]
    async fn test_stranger_cannot_cancel_pending_build() {
        let h = Harness::new().await;
        let (build, job) = h
            .fixture
            .seed_build(&h.store, 1, WorkspaceTransition::Start)
            .await;
        let bob = Subject::from(&h.fixture.member);

        let err = h.service.cancel(&bob, build.id, None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let unchanged = h.store.snapshot().await.job(job.id).unwrap();
        assert!(unchanged.canceled_at.is_none());
        assert!(unchanged.completed_at.is_none());
        assert!(
            h.pubsub
                .messages(&workspace_event_channel(h.fixture.workspace.owner_id))
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_build() {
        let h = Harness::new().await;
        let subject = Subject::from(&h.fixture.owner);
        let err = h
            .service
            .cancel(&subject, ResourceId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_undo_cancel() {
        let h = Harness::new().await;
        let (build, job) = h
            .fixture
            .seed_build(&h.store, 1, WorkspaceTransition::Start)
            .await;
        h.pubsub.set_failing(true);

        h.service
            .cancel(&Subject::from(&h.fixture.owner), build.id, None)
            .await
            .unwrap();
        let canceled = h.store.snapshot().await.job(job.id).unwrap();
        assert!(canceled.canceled_at.is_some());
    }
}
