//! Timing aggregation for a single build.

use buildplane_core::authz::Subject;
use buildplane_core::resource::WorkspaceAgent;
use buildplane_core::timing::{
    AgentScriptTimingRow, ProvisionerJobTiming, TimingStage, is_zero_time,
};
use buildplane_core::{ResourceId, Result};
use buildplane_db::Queries;
use tracing::debug;

use crate::BuildService;
use crate::view::{AgentConnectionTiming, BuildTimings};

/// Combine stored timings and agent rows into the three timing lists.
/// Entries whose start or end was never recorded are dropped, as are agents
/// without a first connection.
pub fn aggregate_timings(
    provisioner: Vec<ProvisionerJobTiming>,
    scripts: Vec<AgentScriptTimingRow>,
    agents: Vec<WorkspaceAgent>,
) -> BuildTimings {
    let provisioner_timings = provisioner
        .into_iter()
        .filter(|t| {
            let zero = is_zero_time(&t.started_at) || is_zero_time(&t.ended_at);
            if zero {
                debug!(
                    job_id = %t.job_id,
                    stage = t.stage.as_str(),
                    resource = %t.resource,
                    "Dropping provisioner timing with unset bounds"
                );
            }
            !zero
        })
        .collect();

    let agent_script_timings = scripts
        .into_iter()
        .filter(|t| {
            let zero = is_zero_time(&t.started_at) || is_zero_time(&t.ended_at);
            if zero {
                debug!(
                    script_id = %t.script_id,
                    agent_id = %t.workspace_agent_id,
                    "Dropping script timing with unset bounds"
                );
            }
            !zero
        })
        .collect();

    let agent_connection_timings = agents
        .into_iter()
        .filter_map(|agent| match agent.first_connected_at {
            Some(connected) if !is_zero_time(&connected) => Some(AgentConnectionTiming {
                started_at: agent.created_at,
                ended_at: connected,
                stage: TimingStage::Connect,
                workspace_agent_id: agent.id,
                workspace_agent_name: agent.name,
            }),
            _ => {
                debug!(agent_id = %agent.id, "Agent never connected");
                None
            }
        })
        .collect();

    BuildTimings {
        provisioner_timings,
        agent_script_timings,
        agent_connection_timings,
    }
}

impl BuildService {
    pub async fn timings(&self, subject: &Subject, build_id: ResourceId) -> Result<BuildTimings> {
        let build = self.store.get_build(build_id).await?;
        let workspace = self.store.get_workspace(build.workspace_id).await?;
        self.ensure_readable(subject, &workspace, || format!("build {build_id}"))?;
        let store = self.store.as_ref();
        let job_ids = [build.job_id];
        let (provisioner, scripts, resources) = futures::try_join!(
            store.get_provisioner_timings(build.job_id),
            store.get_script_timings(build.id),
            store.get_resources_by_job_ids(&job_ids),
        )?;
        let resource_ids: Vec<ResourceId> = resources.iter().map(|r| r.id).collect();
        let agents = if resource_ids.is_empty() {
            Vec::new()
        } else {
            store.get_agents_by_resource_ids(&resource_ids).await?
        };
        Ok(aggregate_timings(provisioner, scripts, agents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use buildplane_core::resource::WorkspaceAgentScript;
    use buildplane_core::timing::WorkspaceAgentScriptTiming;
    use buildplane_core::workspace::WorkspaceTransition;
    use buildplane_db::fixtures::{agent, resource};
    use chrono::{DateTime, Duration, Utc};

    fn epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(0, 0).unwrap()
    }

    fn provisioner_timing(
        job_id: ResourceId,
        resource: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> ProvisionerJobTiming {
        ProvisionerJobTiming {
            job_id,
            started_at,
            ended_at,
            stage: TimingStage::Apply,
            source: "terraform".to_string(),
            action: "create".to_string(),
            resource: resource.to_string(),
        }
    }

    fn script(agent_id: ResourceId, name: &str) -> WorkspaceAgentScript {
        WorkspaceAgentScript {
            id: ResourceId::new(),
            workspace_agent_id: agent_id,
            log_source_id: ResourceId::new(),
            display_name: name.to_string(),
            script: "echo hi".to_string(),
            cron: String::new(),
            run_on_start: true,
            run_on_stop: false,
            start_blocks_login: false,
            timeout_seconds: 0,
        }
    }

    fn script_timing(
        script_id: ResourceId,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> WorkspaceAgentScriptTiming {
        WorkspaceAgentScriptTiming {
            script_id,
            started_at,
            ended_at,
            exit_code: 0,
            stage: TimingStage::Start,
            status: "ok".to_string(),
        }
    }

    #[test]
    fn test_zero_timings_are_dropped() {
        let job_id = ResourceId::new();
        let now = Utc::now();
        let provisioner = vec![
            provisioner_timing(job_id, "a", now - Duration::seconds(5), now),
            provisioner_timing(job_id, "b", epoch(), now),
            provisioner_timing(job_id, "c", now, epoch()),
            provisioner_timing(job_id, "d", now - Duration::seconds(2), now),
        ];

        let timings = aggregate_timings(provisioner, Vec::new(), Vec::new());
        let resources: Vec<&str> = timings
            .provisioner_timings
            .iter()
            .map(|t| t.resource.as_str())
            .collect();
        assert_eq!(resources, vec!["a", "d"]);
    }

    #[test]
    fn test_unconnected_agents_are_dropped() {
        let resource_id = ResourceId::new();
        let mut connected = agent(resource_id, "connected", 0);
        connected.first_connected_at = Some(connected.created_at + Duration::seconds(12));
        let waiting = agent(resource_id, "waiting", 1);
        let mut unset = agent(resource_id, "unset", 2);
        unset.first_connected_at = Some(epoch());

        let timings = aggregate_timings(
            Vec::new(),
            Vec::new(),
            vec![waiting, connected.clone(), unset],
        );
        assert_eq!(timings.agent_connection_timings.len(), 1);
        let timing = &timings.agent_connection_timings[0];
        assert_eq!(timing.workspace_agent_id, connected.id);
        assert_eq!(timing.started_at, connected.created_at);
        assert_eq!(Some(timing.ended_at), connected.first_connected_at);
        assert_eq!(timing.stage, TimingStage::Connect);
    }

    #[tokio::test]
    async fn test_build_timings() {
        let h = Harness::new().await;
        let (build, job) = h
            .fixture
            .seed_build(&h.store, 1, WorkspaceTransition::Start)
            .await;
        let now = Utc::now();
        let container = resource(job.id, "container");
        let mut dev = agent(container.id, "dev", 0);
        dev.first_connected_at = Some(now);
        let startup = script(dev.id, "startup");
        let cleanup = script(dev.id, "cleanup");
        let rows_job = job.id;
        let (startup_id, cleanup_id) = (startup.id, cleanup.id);
        h.store
            .seed(move |d| {
                d.resources.push(container);
                d.agents.push(dev);
                d.scripts.extend([startup, cleanup]);
                d.script_timings.extend([
                    script_timing(startup_id, now - Duration::seconds(3), now),
                    script_timing(cleanup_id, epoch(), epoch()),
                ]);
                d.provisioner_timings.extend([
                    provisioner_timing(rows_job, "docker_container.dev", now - Duration::seconds(9), now),
                    provisioner_timing(rows_job, "docker_volume.home", epoch(), now),
                ]);
            })
            .await;

        let timings = h.service.timings(&h.owner(), build.id).await.unwrap();
        assert_eq!(timings.provisioner_timings.len(), 1);
        assert_eq!(timings.provisioner_timings[0].resource, "docker_container.dev");
        assert_eq!(timings.agent_script_timings.len(), 1);
        assert_eq!(timings.agent_script_timings[0].display_name, "startup");
        assert_eq!(timings.agent_script_timings[0].workspace_agent_name, "dev");
        assert_eq!(timings.agent_connection_timings.len(), 1);
        for t in &timings.provisioner_timings {
            assert!(!is_zero_time(&t.started_at) && !is_zero_time(&t.ended_at));
        }
    }

    #[tokio::test]
    async fn test_timings_are_hidden_from_other_users() {
        let h = Harness::new().await;
        let (build, _) = h
            .fixture
            .seed_build(&h.store, 1, WorkspaceTransition::Start)
            .await;
        let bob = Subject::from(&h.fixture.member);

        let err = h.service.timings(&bob, build.id).await.unwrap_err();
        assert!(matches!(err, buildplane_core::Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_timings_for_build_without_resources() {
        let h = Harness::new().await;
        let (build, _) = h
            .fixture
            .seed_build(&h.store, 1, WorkspaceTransition::Start)
            .await;
        h.store.fail_query("get_agents_by_resource_ids");

        let timings = h.service.timings(&h.owner(), build.id).await.unwrap();
        assert!(timings.provisioner_timings.is_empty());
        assert!(timings.agent_connection_timings.is_empty());
    }
}
