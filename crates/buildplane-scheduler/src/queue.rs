//! Read-time view of the provisioner job queue.
//!
//! Nothing here is stored: queue positions and worker matches are
//! recomputed from the jobs and daemons on every read.

use buildplane_core::ResourceId;
use buildplane_core::events::{JOB_POSTED_CHANNEL, JobPosted, Pubsub};
use buildplane_core::job::{EligibleDaemon, ProvisionerDaemon, ProvisionerJob, ProvisionerJobStatus};
use buildplane_core::{Error, Result};
use buildplane_db::{DbResult, Queries, QueueRank};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub use buildplane_config::system::DEFAULT_STALE_INTERVAL as STALE_INTERVAL;

/// A job with its rank among pending jobs.
#[derive(Debug, Clone, Serialize)]
pub struct JobWithQueuePosition {
    pub job: ProvisionerJob,
    /// 1-based rank among pending jobs; 0 when the job is not pending.
    pub queue_position: i64,
    /// Number of pending jobs; 0 when the job is not pending.
    pub queue_size: i64,
}

/// Advisory summary of the workers able to run a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedProvisioners {
    /// Eligible workers, live or not.
    pub count: usize,
    /// Eligible workers seen within the stale interval.
    pub available: usize,
    pub most_recently_seen: Option<DateTime<Utc>>,
    /// Names of the live workers, sorted.
    pub names: Vec<String>,
}

/// Queue view over a store or an open transaction.
pub struct JobQueue<'a, Q: Queries + ?Sized> {
    store: &'a Q,
}

impl<'a, Q: Queries + ?Sized> JobQueue<'a, Q> {
    pub fn new(store: &'a Q) -> Self {
        Self { store }
    }

    /// Load the given jobs and rank the pending ones by (`created_at`, `id`).
    pub async fn with_queue_position(
        &self,
        ids: &[ResourceId],
    ) -> DbResult<Vec<JobWithQueuePosition>> {
        let jobs = self.store.get_jobs_by_ids(ids).await?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let pending_ids: Vec<ResourceId> = jobs
            .iter()
            .filter(|j| j.status() == ProvisionerJobStatus::Pending)
            .map(|j| j.id)
            .collect();
        let ranks: HashMap<ResourceId, QueueRank> = if pending_ids.is_empty() {
            HashMap::new()
        } else {
            self.store
                .get_queue_ranks(&pending_ids)
                .await?
                .into_iter()
                .map(|rank| (rank.job_id, rank))
                .collect()
        };

        Ok(jobs
            .into_iter()
            .map(|job| match ranks.get(&job.id) {
                Some(rank) => JobWithQueuePosition {
                    job,
                    queue_position: rank.position,
                    queue_size: rank.size,
                },
                None => JobWithQueuePosition {
                    job,
                    queue_position: 0,
                    queue_size: 0,
                },
            })
            .collect())
    }

    /// Eligible workers of the given pending jobs.
    pub async fn eligible_workers(&self, pending_ids: &[ResourceId]) -> DbResult<Vec<EligibleDaemon>> {
        if pending_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store.get_eligible_daemons(pending_ids).await
    }
}

/// A worker is live when it was seen within `stale_interval` of `now`.
pub fn is_live(daemon: &ProvisionerDaemon, now: DateTime<Utc>, stale_interval: Duration) -> bool {
    let Some(seen) = daemon.last_seen_at else {
        return false;
    };
    match TimeDelta::from_std(stale_interval)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
    {
        Some(cutoff) => seen > cutoff,
        None => true,
    }
}

/// Summarise the eligible workers of one job.
pub fn matched_provisioners<'a>(
    daemons: impl IntoIterator<Item = &'a ProvisionerDaemon>,
    now: DateTime<Utc>,
    stale_interval: Duration,
) -> MatchedProvisioners {
    let mut matched = MatchedProvisioners::default();
    for daemon in daemons {
        matched.count += 1;
        if let Some(seen) = daemon.last_seen_at {
            if matched.most_recently_seen.is_none_or(|latest| seen > latest) {
                matched.most_recently_seen = Some(seen);
            }
        }
        if is_live(daemon, now, stale_interval) {
            matched.available += 1;
            matched.names.push(daemon.name.clone());
        }
    }
    matched.names.sort();
    matched
}

/// Tell idle workers a job is waiting.
pub async fn announce_job(pubsub: &dyn Pubsub, job: &ProvisionerJob) -> Result<()> {
    let message = JobPosted {
        provisioner_type: job.provisioner.clone(),
        tags: job.tags.clone(),
    };
    let payload = serde_json::to_vec(&message)
        .map_err(|e| Error::Internal(format!("encode job posted message: {e}")))?;
    pubsub.publish(JOB_POSTED_CHANNEL, payload).await?;
    debug!(job_id = %job.id, "Announced provisioner job");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildplane_core::events::MemoryPubsub;
    use buildplane_db::MemoryStore;
    use buildplane_db::fixtures::{Fixture, tags};
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_queue_position_ranks_pending_jobs() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let now = Utc::now();
        let first = fixture.job(now - ChronoDuration::seconds(30));
        let second = fixture.job(now - ChronoDuration::seconds(20));
        let mut running = fixture.job(now - ChronoDuration::seconds(40));
        running.started_at = Some(now);
        let ids = [second.id, running.id, first.id];
        store
            .seed(|d| d.jobs = vec![first.clone(), second.clone(), running.clone()])
            .await;

        let jobs = JobQueue::new(&store).with_queue_position(&ids).await.unwrap();
        let by_id: HashMap<ResourceId, &JobWithQueuePosition> =
            jobs.iter().map(|j| (j.job.id, j)).collect();

        assert_eq!(by_id[&first.id].queue_position, 1);
        assert_eq!(by_id[&second.id].queue_position, 2);
        assert_eq!(by_id[&second.id].queue_size, 2);
        assert_eq!(by_id[&running.id].queue_position, 0);
        assert_eq!(by_id[&running.id].queue_size, 0);
    }

    #[tokio::test]
    async fn test_queue_position_ties_break_on_id() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let at = Utc::now();
        let a = fixture.job(at);
        let b = fixture.job(at);
        let (low, high) = if a.id < b.id { (a, b) } else { (b, a) };
        let ids = [high.id, low.id];
        store.seed(|d| d.jobs = vec![high.clone(), low.clone()]).await;

        let jobs = JobQueue::new(&store).with_queue_position(&ids).await.unwrap();
        let low_pos = jobs.iter().find(|j| j.job.id == low.id).unwrap().queue_position;
        let high_pos = jobs.iter().find(|j| j.job.id == high.id).unwrap().queue_position;
        assert_eq!((low_pos, high_pos), (1, 2));
    }

    #[tokio::test]
    async fn test_no_pending_jobs_skips_queue_scan() {
        let store = MemoryStore::new();
        let fixture = Fixture::new();
        let mut done = fixture.job(Utc::now());
        done.started_at = Some(Utc::now());
        done.completed_at = Some(Utc::now());
        let id = done.id;
        store.seed(|d| d.jobs.push(done)).await;
        store.fail_query("get_queue_ranks");

        let jobs = JobQueue::new(&store).with_queue_position(&[id]).await.unwrap();
        assert_eq!(jobs[0].queue_position, 0);
    }

    #[test]
    fn test_matched_provisioners_counts_live_workers() {
        let fixture = Fixture::new();
        let now = Utc::now();
        let fresh = fixture.daemon("fresh", Some(now - ChronoDuration::seconds(10)));
        let stale = fixture.daemon("stale", Some(now - ChronoDuration::seconds(300)));
        let never = fixture.daemon("never", None);
        let also_fresh = fixture.daemon("another", Some(now - ChronoDuration::seconds(5)));

        let matched = matched_provisioners(
            [&fresh, &stale, &never, &also_fresh],
            now,
            STALE_INTERVAL,
        );
        assert_eq!(matched.count, 4);
        assert_eq!(matched.available, 2);
        assert_eq!(matched.most_recently_seen, also_fresh.last_seen_at);
        assert_eq!(matched.names, vec!["another".to_string(), "fresh".to_string()]);
    }

    #[test]
    fn test_matched_provisioners_empty() {
        let matched = matched_provisioners(std::iter::empty(), Utc::now(), STALE_INTERVAL);
        assert_eq!(matched, MatchedProvisioners::default());
    }

    #[tokio::test]
    async fn test_announce_job_payload() {
        let pubsub = MemoryPubsub::recording();
        let fixture = Fixture::new();
        let mut job = fixture.job(Utc::now());
        job.tags = tags(&[("scope", "organization"), ("os", "linux")]);

        announce_job(&pubsub, &job).await.unwrap();

        let messages = pubsub.messages(JOB_POSTED_CHANNEL);
        assert_eq!(messages.len(), 1);
        let posted: serde_json::Value = serde_json::from_slice(&messages[0]).unwrap();
        assert_eq!(posted["provisioner_type"], "terraform");
        assert_eq!(posted["tags"]["os"], "linux");
    }
}
