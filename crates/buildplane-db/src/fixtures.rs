//! Seed data for tests against [`MemoryStore`].

use buildplane_core::ResourceId;
use buildplane_core::job::{PROVISIONER_TERRAFORM, ProvisionerDaemon, ProvisionerJob, Tags};
use buildplane_core::resource::{WorkspaceAgent, WorkspaceResource};
use buildplane_core::workspace::{
    ROLE_OWNER, ROLE_TEMPLATE_ADMIN, Template, TemplateVersion, User, Workspace, WorkspaceBuild,
    WorkspaceTransition,
};
use chrono::{DateTime, Duration, Utc};

use crate::MemoryStore;

/// One organization with a template, its active version, a workspace and
/// four users: the workspace owner, another member, a template admin and a
/// site owner.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub organization_id: ResourceId,
    pub owner: User,
    pub member: User,
    pub template_admin: User,
    pub site_owner: User,
    pub template: Template,
    pub version: TemplateVersion,
    pub workspace: Workspace,
}

fn user(username: &str, roles: &[&str]) -> User {
    User {
        id: ResourceId::new(),
        username: username.to_string(),
        name: username.to_uppercase(),
        email: format!("{username}@example.com"),
        roles: roles.iter().map(|r| r.to_string()).collect(),
    }
}

pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Fixture {
    pub fn new() -> Self {
        let organization_id = ResourceId::new();
        let owner = user("alice", &[]);
        let member = user("bob", &[]);
        let template_admin = user("tadmin", &[ROLE_TEMPLATE_ADMIN]);
        let site_owner = user("root", &[ROLE_OWNER]);
        let template_id = ResourceId::new();
        let version = TemplateVersion {
            id: ResourceId::new(),
            template_id,
            name: "v1".to_string(),
            provisioner_tags: tags(&[("scope", "organization")]),
            created_at: Utc::now() - Duration::days(1),
        };
        let template = Template {
            id: template_id,
            organization_id,
            organization_name: "acme".to_string(),
            name: "docker".to_string(),
            active_version_id: version.id,
            allow_user_cancel_workspace_jobs: false,
        };
        let workspace = Workspace {
            id: ResourceId::new(),
            organization_id,
            owner_id: owner.id,
            owner_username: owner.username.clone(),
            owner_avatar_url: String::new(),
            template_id,
            name: "dev".to_string(),
            deleted: false,
            created_at: Utc::now() - Duration::hours(1),
        };
        Self {
            organization_id,
            owner,
            member,
            template_admin,
            site_owner,
            template,
            version,
            workspace,
        }
    }

    /// Insert users, template, version and workspace.
    pub async fn seed(&self, store: &MemoryStore) {
        let fixture = self.clone();
        store
            .seed(move |d| {
                d.users.extend([
                    fixture.owner,
                    fixture.member,
                    fixture.template_admin,
                    fixture.site_owner,
                ]);
                d.templates.push(fixture.template);
                d.template_versions.push(fixture.version);
                d.workspaces.push(fixture.workspace);
            })
            .await;
    }

    /// A pending job in the fixture's organization requiring the version's
    /// tags.
    pub fn job(&self, created_at: DateTime<Utc>) -> ProvisionerJob {
        ProvisionerJob {
            id: ResourceId::new(),
            organization_id: self.organization_id,
            initiator_id: self.owner.id,
            created_at,
            updated_at: created_at,
            started_at: None,
            completed_at: None,
            canceled_at: None,
            error: None,
            error_code: None,
            worker_id: None,
            provisioner: PROVISIONER_TERRAFORM.to_string(),
            tags: self.version.provisioner_tags.clone(),
            input: serde_json::Value::Null,
        }
    }

    pub fn build(
        &self,
        job: &ProvisionerJob,
        build_number: i32,
        transition: WorkspaceTransition,
    ) -> WorkspaceBuild {
        WorkspaceBuild {
            id: ResourceId::new(),
            created_at: job.created_at,
            updated_at: job.created_at,
            workspace_id: self.workspace.id,
            template_version_id: self.version.id,
            build_number,
            transition,
            initiator_id: self.owner.id,
            initiator_username: self.owner.username.clone(),
            provisioner_state: Vec::new(),
            job_id: job.id,
            deadline: None,
            max_deadline: None,
            reason: "initiator".to_string(),
            daily_cost: 0,
            template_version_preset_id: None,
            has_ai_task: None,
            ai_task_sidebar_app_id: None,
        }
    }

    /// A worker offering the version's tags.
    pub fn daemon(&self, name: &str, last_seen_at: Option<DateTime<Utc>>) -> ProvisionerDaemon {
        ProvisionerDaemon {
            id: ResourceId::new(),
            organization_id: self.organization_id,
            name: name.to_string(),
            tags: self.version.provisioner_tags.clone(),
            last_seen_at,
            created_at: Utc::now() - Duration::days(1),
        }
    }

    /// Insert a pending job and its build, returning both.
    pub async fn seed_build(
        &self,
        store: &MemoryStore,
        build_number: i32,
        transition: WorkspaceTransition,
    ) -> (WorkspaceBuild, ProvisionerJob) {
        let job = self.job(Utc::now() - Duration::minutes(10) + Duration::seconds(build_number as i64));
        let build = self.build(&job, build_number, transition);
        let (b, j) = (build.clone(), job.clone());
        store
            .seed(move |d| {
                d.jobs.push(j);
                d.builds.push(b);
            })
            .await;
        (build, job)
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

pub fn resource(job_id: ResourceId, name: &str) -> WorkspaceResource {
    WorkspaceResource {
        id: ResourceId::new(),
        created_at: Utc::now(),
        job_id,
        transition: WorkspaceTransition::Start,
        resource_type: "docker_container".to_string(),
        name: name.to_string(),
        hide: false,
        icon: String::new(),
        daily_cost: 0,
    }
}

pub fn agent(resource_id: ResourceId, name: &str, display_order: i32) -> WorkspaceAgent {
    WorkspaceAgent {
        id: ResourceId::new(),
        created_at: Utc::now() - Duration::minutes(5),
        resource_id,
        name: name.to_string(),
        operating_system: "linux".to_string(),
        architecture: "amd64".to_string(),
        display_order,
        first_connected_at: None,
        last_connected_at: None,
    }
}
