//! PostgreSQL store.

use async_trait::async_trait;
use buildplane_core::ResourceId;
use buildplane_core::id::uuids;
use buildplane_core::job::{EligibleDaemon, ProvisionerJob};
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
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::ops::{Deref, DerefMut};
use tokio::sync::{Mutex, MutexGuard};

use super::rows::*;
use super::{BuildPage, Queries, QueueRank, Store, StoreTx};
use crate::{DbError, DbResult};

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> DbResult<Conn<'_>> {
        Ok(Conn::Pool(self.pool.acquire().await?))
    }
}

/// Transaction over a [`PgStore`]. Rolled back by sqlx when dropped
/// without commit.
pub struct PgTx {
    tx: Mutex<Transaction<'static, Postgres>>,
}

impl PgTx {
    async fn conn(&self) -> DbResult<Conn<'_>> {
        Ok(Conn::Tx(self.tx.lock().await))
    }
}

enum Conn<'a> {
    Pool(PoolConnection<Postgres>),
    Tx(MutexGuard<'a, Transaction<'static, Postgres>>),
}

impl Deref for Conn<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            Conn::Pool(conn) => conn,
            Conn::Tx(tx) => tx,
        }
    }
}

impl DerefMut for Conn<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            Conn::Pool(conn) => conn,
            Conn::Tx(tx) => tx,
        }
    }
}

fn insert_error(err: sqlx::Error, what: String) -> DbError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return DbError::Duplicate(what);
        }
        if db.is_foreign_key_violation() {
            return DbError::InvalidData(what);
        }
    }
    DbError::Database(err)
}

const WORKSPACE_SELECT: &str = r#"
    SELECT w.id, w.organization_id, w.owner_id, u.username AS owner_username,
           u.avatar_url AS owner_avatar_url, w.template_id, w.name, w.deleted, w.created_at
    FROM workspaces w
    JOIN users u ON u.id = w.owner_id
"#;

const TEMPLATE_SELECT: &str = r#"
    SELECT t.id, t.organization_id, o.name AS organization_name, t.name,
           t.active_version_id, t.allow_user_cancel_workspace_jobs
    FROM templates t
    JOIN organizations o ON o.id = t.organization_id
"#;

const BUILD_SELECT: &str = r#"
    SELECT wb.id, wb.created_at, wb.updated_at, wb.workspace_id, wb.template_version_id,
           wb.build_number, wb.transition, wb.initiator_id, u.username AS initiator_username,
           wb.provisioner_state, wb.job_id, wb.deadline, wb.max_deadline, wb.reason,
           wb.daily_cost, wb.template_version_preset_id, wb.has_ai_task,
           wb.ai_task_sidebar_app_id
    FROM workspace_builds wb
    LEFT JOIN users u ON u.id = wb.initiator_id
"#;

/// SQL for every query, shared by the pool and the transaction.
mod sql {
    use super::*;

    pub async fn get_user(conn: &mut PgConnection, id: ResourceId) -> DbResult<User> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, name, email, roles FROM users WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("user {id}")))?;
        row.try_into()
    }

    pub async fn get_users_with_roles(conn: &mut PgConnection, roles: &[&str]) -> DbResult<Vec<User>> {
        let roles: Vec<String> = roles.iter().map(|r| r.to_string()).collect();
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, name, email, roles FROM users WHERE roles && $1 ORDER BY username",
        )
        .bind(roles)
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_workspace(conn: &mut PgConnection, id: ResourceId) -> DbResult<Workspace> {
        let row = sqlx::query_as::<_, WorkspaceRow>(&format!("{WORKSPACE_SELECT} WHERE w.id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("workspace {id}")))?;
        row.try_into()
    }

    pub async fn get_workspace_by_owner_and_name(
        conn: &mut PgConnection,
        owner_id: ResourceId,
        name: &str,
    ) -> DbResult<Workspace> {
        let row = sqlx::query_as::<_, WorkspaceRow>(&format!(
            "{WORKSPACE_SELECT} WHERE w.owner_id = $1 AND w.name = $2 AND NOT w.deleted"
        ))
        .bind(owner_id.as_uuid())
        .bind(name)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("workspace {name}")))?;
        row.try_into()
    }

    pub async fn get_template(conn: &mut PgConnection, id: ResourceId) -> DbResult<Template> {
        let row = sqlx::query_as::<_, TemplateRow>(&format!("{TEMPLATE_SELECT} WHERE t.id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("template {id}")))?;
        row.try_into()
    }

    pub async fn get_template_version(
        conn: &mut PgConnection,
        id: ResourceId,
    ) -> DbResult<TemplateVersion> {
        let row = sqlx::query_as::<_, TemplateVersionRow>(
            "SELECT id, template_id, name, provisioner_tags, created_at FROM template_versions WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("template version {id}")))?;
        row.try_into()
    }

    pub async fn get_template_versions_by_ids(
        conn: &mut PgConnection,
        ids: &[ResourceId],
    ) -> DbResult<Vec<TemplateVersion>> {
        let rows = sqlx::query_as::<_, TemplateVersionRow>(
            "SELECT id, template_id, name, provisioner_tags, created_at FROM template_versions WHERE id = ANY($1)",
        )
        .bind(uuids(ids))
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_preset(
        conn: &mut PgConnection,
        id: ResourceId,
    ) -> DbResult<TemplateVersionPreset> {
        let row = sqlx::query_as::<_, PresetRow>(
            "SELECT id, template_version_id, name FROM template_version_presets WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("template version preset {id}")))?;
        row.try_into()
    }

    pub async fn get_build(conn: &mut PgConnection, id: ResourceId) -> DbResult<WorkspaceBuild> {
        let row = sqlx::query_as::<_, BuildRow>(&format!("{BUILD_SELECT} WHERE wb.id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("workspace build {id}")))?;
        row.try_into()
    }

    pub async fn get_build_by_number(
        conn: &mut PgConnection,
        workspace_id: ResourceId,
        build_number: i32,
    ) -> DbResult<WorkspaceBuild> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "{BUILD_SELECT} WHERE wb.workspace_id = $1 AND wb.build_number = $2"
        ))
        .bind(workspace_id.as_uuid())
        .bind(build_number)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("workspace build number {build_number}")))?;
        row.try_into()
    }

    pub async fn get_latest_build(
        conn: &mut PgConnection,
        workspace_id: ResourceId,
    ) -> DbResult<Option<WorkspaceBuild>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "{BUILD_SELECT} WHERE wb.workspace_id = $1 ORDER BY wb.build_number DESC LIMIT 1"
        ))
        .bind(workspace_id.as_uuid())
        .fetch_optional(conn)
        .await?;
        row.map(WorkspaceBuild::try_from).transpose()
    }

    pub async fn list_builds(
        conn: &mut PgConnection,
        workspace_id: ResourceId,
        page: &BuildPage,
    ) -> DbResult<Vec<WorkspaceBuild>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            r#"{BUILD_SELECT}
            WHERE wb.workspace_id = $1
              AND ($2::uuid IS NULL OR wb.build_number <
                   (SELECT build_number FROM workspace_builds WHERE id = $2))
              AND ($3::timestamptz IS NULL OR wb.created_at >= $3)
            ORDER BY wb.build_number DESC
            OFFSET $4
            LIMIT NULLIF($5::bigint, 0)"#
        ))
        .bind(workspace_id.as_uuid())
        .bind(page.after_id.map(uuid::Uuid::from))
        .bind(page.since)
        .bind(page.offset.max(0))
        .bind(page.limit)
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_build_parameters(
        conn: &mut PgConnection,
        build_id: ResourceId,
    ) -> DbResult<Vec<WorkspaceBuildParameter>> {
        let rows = sqlx::query_as::<_, BuildParameterRow>(
            "SELECT workspace_build_id, name, value FROM workspace_build_parameters WHERE workspace_build_id = $1 ORDER BY name",
        )
        .bind(build_id.as_uuid())
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_job(conn: &mut PgConnection, id: ResourceId) -> DbResult<ProvisionerJob> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM provisioner_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("provisioner job {id}")))?;
        row.try_into()
    }

    pub async fn get_job_for_update(
        conn: &mut PgConnection,
        id: ResourceId,
    ) -> DbResult<ProvisionerJob> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM provisioner_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("provisioner job {id}")))?;
        row.try_into()
    }

    pub async fn get_jobs_by_ids(
        conn: &mut PgConnection,
        ids: &[ResourceId],
    ) -> DbResult<Vec<ProvisionerJob>> {
        let rows = sqlx::query_as::<_, JobRow>("SELECT * FROM provisioner_jobs WHERE id = ANY($1)")
            .bind(uuids(ids))
            .fetch_all(conn)
            .await?;
        convert(rows)
    }

    pub async fn get_queue_ranks(
        conn: &mut PgConnection,
        job_ids: &[ResourceId],
    ) -> DbResult<Vec<QueueRank>> {
        let rows = sqlx::query_as::<_, QueueRankRow>(
            r#"SELECT job_id, queue_position, queue_size FROM (
                SELECT id AS job_id,
                       ROW_NUMBER() OVER (ORDER BY created_at, id) AS queue_position,
                       COUNT(*) OVER () AS queue_size
                FROM provisioner_jobs
                WHERE started_at IS NULL AND canceled_at IS NULL
            ) pending
            WHERE job_id = ANY($1)"#,
        )
        .bind(uuids(job_ids))
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_eligible_daemons(
        conn: &mut PgConnection,
        job_ids: &[ResourceId],
    ) -> DbResult<Vec<EligibleDaemon>> {
        let rows = sqlx::query_as::<_, EligibleDaemonRow>(
            r#"SELECT pj.id AS job_id, pd.id, pd.organization_id, pd.name, pd.tags,
                      pd.last_seen_at, pd.created_at
            FROM provisioner_jobs pj
            JOIN provisioner_daemons pd
              ON pd.organization_id = pj.organization_id AND pd.tags @> pj.tags
            WHERE pj.id = ANY($1)
            ORDER BY pj.created_at, pd.created_at"#,
        )
        .bind(uuids(job_ids))
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_resources_by_job_ids(
        conn: &mut PgConnection,
        job_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceResource>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            "SELECT * FROM workspace_resources WHERE job_id = ANY($1) ORDER BY created_at",
        )
        .bind(uuids(job_ids))
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_resource_metadata(
        conn: &mut PgConnection,
        resource_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceResourceMetadatum>> {
        let rows = sqlx::query_as::<_, MetadatumRow>(
            "SELECT * FROM workspace_resource_metadata WHERE workspace_resource_id = ANY($1) ORDER BY key",
        )
        .bind(uuids(resource_ids))
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_agents_by_resource_ids(
        conn: &mut PgConnection,
        resource_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceAgent>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT * FROM workspace_agents WHERE resource_id = ANY($1) ORDER BY created_at",
        )
        .bind(uuids(resource_ids))
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_apps_by_agent_ids(
        conn: &mut PgConnection,
        agent_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceApp>> {
        let rows = sqlx::query_as::<_, AppRow>(
            "SELECT * FROM workspace_apps WHERE agent_id = ANY($1) ORDER BY slug",
        )
        .bind(uuids(agent_ids))
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_app_statuses_by_app_ids(
        conn: &mut PgConnection,
        app_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceAppStatus>> {
        let rows = sqlx::query_as::<_, AppStatusRow>(
            "SELECT * FROM workspace_app_statuses WHERE app_id = ANY($1) ORDER BY created_at",
        )
        .bind(uuids(app_ids))
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_scripts_by_agent_ids(
        conn: &mut PgConnection,
        agent_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceAgentScript>> {
        let rows = sqlx::query_as::<_, ScriptRow>(
            "SELECT * FROM workspace_agent_scripts WHERE workspace_agent_id = ANY($1)",
        )
        .bind(uuids(agent_ids))
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_log_sources_by_agent_ids(
        conn: &mut PgConnection,
        agent_ids: &[ResourceId],
    ) -> DbResult<Vec<WorkspaceAgentLogSource>> {
        let rows = sqlx::query_as::<_, LogSourceRow>(
            "SELECT * FROM workspace_agent_log_sources WHERE workspace_agent_id = ANY($1) ORDER BY created_at",
        )
        .bind(uuids(agent_ids))
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_provisioner_timings(
        conn: &mut PgConnection,
        job_id: ResourceId,
    ) -> DbResult<Vec<ProvisionerJobTiming>> {
        let rows = sqlx::query_as::<_, ProvisionerTimingRow>(
            "SELECT * FROM provisioner_job_timings WHERE job_id = $1 ORDER BY started_at",
        )
        .bind(job_id.as_uuid())
        .fetch_all(conn)
        .await?;
        convert(rows)
    }

    pub async fn get_script_timings(
        conn: &mut PgConnection,
        build_id: ResourceId,
    ) -> DbResult<Vec<AgentScriptTimingRow>> {
        let rows = sqlx::query_as::<_, ScriptTimingRow>(
            r#"SELECT st.script_id, st.started_at, st.ended_at, st.exit_code, st.stage, st.status,
                      s.display_name, a.id AS workspace_agent_id, a.name AS workspace_agent_name
            FROM workspace_agent_script_timings st
            JOIN workspace_agent_scripts s ON s.id = st.script_id
            JOIN workspace_agents a ON a.id = s.workspace_agent_id
            JOIN workspace_resources r ON r.id = a.resource_id
            JOIN workspace_builds wb ON wb.job_id = r.job_id
            WHERE wb.id = $1
            ORDER BY st.started_at"#,
        )
        .bind(build_id.as_uuid())
        .fetch_all(conn)
        .await?;
        convert(rows)
    }
}

macro_rules! pg_queries {
    ($ty:ty) => {
        #[async_trait]
        impl Queries for $ty {
            async fn get_user(&self, id: ResourceId) -> DbResult<User> {
                let mut conn = self.conn().await?;
                sql::get_user(&mut conn, id).await
            }

            async fn get_users_with_roles(&self, roles: &[&str]) -> DbResult<Vec<User>> {
                let mut conn = self.conn().await?;
                sql::get_users_with_roles(&mut conn, roles).await
            }

            async fn get_workspace(&self, id: ResourceId) -> DbResult<Workspace> {
                let mut conn = self.conn().await?;
                sql::get_workspace(&mut conn, id).await
            }

            async fn get_workspace_by_owner_and_name(
                &self,
                owner_id: ResourceId,
                name: &str,
            ) -> DbResult<Workspace> {
                let mut conn = self.conn().await?;
                sql::get_workspace_by_owner_and_name(&mut conn, owner_id, name).await
            }

            async fn get_template(&self, id: ResourceId) -> DbResult<Template> {
                let mut conn = self.conn().await?;
                sql::get_template(&mut conn, id).await
            }

            async fn get_template_version(&self, id: ResourceId) -> DbResult<TemplateVersion> {
                let mut conn = self.conn().await?;
                sql::get_template_version(&mut conn, id).await
            }

            async fn get_template_versions_by_ids(
                &self,
                ids: &[ResourceId],
            ) -> DbResult<Vec<TemplateVersion>> {
                let mut conn = self.conn().await?;
                sql::get_template_versions_by_ids(&mut conn, ids).await
            }

            async fn get_preset(&self, id: ResourceId) -> DbResult<TemplateVersionPreset> {
                let mut conn = self.conn().await?;
                sql::get_preset(&mut conn, id).await
            }

            async fn get_build(&self, id: ResourceId) -> DbResult<WorkspaceBuild> {
                let mut conn = self.conn().await?;
                sql::get_build(&mut conn, id).await
            }

            async fn get_build_by_number(
                &self,
                workspace_id: ResourceId,
                build_number: i32,
            ) -> DbResult<WorkspaceBuild> {
                let mut conn = self.conn().await?;
                sql::get_build_by_number(&mut conn, workspace_id, build_number).await
            }

            async fn get_latest_build(
                &self,
                workspace_id: ResourceId,
            ) -> DbResult<Option<WorkspaceBuild>> {
                let mut conn = self.conn().await?;
                sql::get_latest_build(&mut conn, workspace_id).await
            }

            async fn list_builds(
                &self,
                workspace_id: ResourceId,
                page: &BuildPage,
            ) -> DbResult<Vec<WorkspaceBuild>> {
                let mut conn = self.conn().await?;
                sql::list_builds(&mut conn, workspace_id, page).await
            }

            async fn get_build_parameters(
                &self,
                build_id: ResourceId,
            ) -> DbResult<Vec<WorkspaceBuildParameter>> {
                let mut conn = self.conn().await?;
                sql::get_build_parameters(&mut conn, build_id).await
            }

            async fn get_job(&self, id: ResourceId) -> DbResult<ProvisionerJob> {
                let mut conn = self.conn().await?;
                sql::get_job(&mut conn, id).await
            }

            async fn get_jobs_by_ids(&self, ids: &[ResourceId]) -> DbResult<Vec<ProvisionerJob>> {
                let mut conn = self.conn().await?;
                sql::get_jobs_by_ids(&mut conn, ids).await
            }

            async fn get_queue_ranks(&self, job_ids: &[ResourceId]) -> DbResult<Vec<QueueRank>> {
                let mut conn = self.conn().await?;
                sql::get_queue_ranks(&mut conn, job_ids).await
            }

            async fn get_eligible_daemons(
                &self,
                job_ids: &[ResourceId],
            ) -> DbResult<Vec<EligibleDaemon>> {
                let mut conn = self.conn().await?;
                sql::get_eligible_daemons(&mut conn, job_ids).await
            }

            async fn get_resources_by_job_ids(
                &self,
                job_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceResource>> {
                let mut conn = self.conn().await?;
                sql::get_resources_by_job_ids(&mut conn, job_ids).await
            }

            async fn get_resource_metadata(
                &self,
                resource_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceResourceMetadatum>> {
                let mut conn = self.conn().await?;
                sql::get_resource_metadata(&mut conn, resource_ids).await
            }

            async fn get_agents_by_resource_ids(
                &self,
                resource_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceAgent>> {
                let mut conn = self.conn().await?;
                sql::get_agents_by_resource_ids(&mut conn, resource_ids).await
            }

            async fn get_apps_by_agent_ids(
                &self,
                agent_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceApp>> {
                let mut conn = self.conn().await?;
                sql::get_apps_by_agent_ids(&mut conn, agent_ids).await
            }

            async fn get_app_statuses_by_app_ids(
                &self,
                app_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceAppStatus>> {
                let mut conn = self.conn().await?;
                sql::get_app_statuses_by_app_ids(&mut conn, app_ids).await
            }

            async fn get_scripts_by_agent_ids(
                &self,
                agent_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceAgentScript>> {
                let mut conn = self.conn().await?;
                sql::get_scripts_by_agent_ids(&mut conn, agent_ids).await
            }

            async fn get_log_sources_by_agent_ids(
                &self,
                agent_ids: &[ResourceId],
            ) -> DbResult<Vec<WorkspaceAgentLogSource>> {
                let mut conn = self.conn().await?;
                sql::get_log_sources_by_agent_ids(&mut conn, agent_ids).await
            }

            async fn get_provisioner_timings(
                &self,
                job_id: ResourceId,
            ) -> DbResult<Vec<ProvisionerJobTiming>> {
                let mut conn = self.conn().await?;
                sql::get_provisioner_timings(&mut conn, job_id).await
            }

            async fn get_script_timings(
                &self,
                build_id: ResourceId,
            ) -> DbResult<Vec<AgentScriptTimingRow>> {
                let mut conn = self.conn().await?;
                sql::get_script_timings(&mut conn, build_id).await
            }
        }
    };
}

pg_queries!(PgStore);
pg_queries!(PgTx);

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> DbResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx: Mutex::new(tx) }))
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn get_job_for_update(&self, id: ResourceId) -> DbResult<ProvisionerJob> {
        let mut conn = self.conn().await?;
        sql::get_job_for_update(&mut conn, id).await
    }

    async fn update_job_cancel(
        &self,
        id: ResourceId,
        canceled_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> DbResult<()> {
        let mut conn = self.conn().await?;
        let result = sqlx::query(
            "UPDATE provisioner_jobs SET canceled_at = $2, completed_at = $3, updated_at = $2 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(canceled_at)
        .bind(completed_at)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("provisioner job {id}")));
        }
        Ok(())
    }

    async fn insert_job(&self, job: &ProvisionerJob) -> DbResult<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"INSERT INTO provisioner_jobs
                (id, organization_id, initiator_id, created_at, updated_at, started_at,
                 completed_at, canceled_at, error, error_code, worker_id, provisioner, tags, input)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(job.id.as_uuid())
        .bind(job.organization_id.as_uuid())
        .bind(job.initiator_id.as_uuid())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.canceled_at)
        .bind(&job.error)
        .bind(&job.error_code)
        .bind(job.worker_id.map(uuid::Uuid::from))
        .bind(&job.provisioner)
        .bind(Json(&job.tags))
        .bind(&job.input)
        .execute(&mut *conn)
        .await
        .map_err(|e| insert_error(e, format!("provisioner job {}", job.id)))?;
        Ok(())
    }

    async fn complete_job(&self, id: ResourceId, at: DateTime<Utc>) -> DbResult<()> {
        let mut conn = self.conn().await?;
        let result = sqlx::query(
            "UPDATE provisioner_jobs SET started_at = $2, completed_at = $2, updated_at = $2 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("provisioner job {id}")));
        }
        Ok(())
    }

    async fn insert_build(&self, build: &WorkspaceBuild) -> DbResult<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"INSERT INTO workspace_builds
                (id, created_at, updated_at, workspace_id, template_version_id, build_number,
                 transition, initiator_id, provisioner_state, job_id, deadline, max_deadline,
                 reason, daily_cost, template_version_preset_id, has_ai_task,
                 ai_task_sidebar_app_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"#,
        )
        .bind(build.id.as_uuid())
        .bind(build.created_at)
        .bind(build.updated_at)
        .bind(build.workspace_id.as_uuid())
        .bind(build.template_version_id.as_uuid())
        .bind(build.build_number)
        .bind(build.transition.as_str())
        .bind(build.initiator_id.as_uuid())
        .bind(&build.provisioner_state)
        .bind(build.job_id.as_uuid())
        .bind(build.deadline)
        .bind(build.max_deadline)
        .bind(&build.reason)
        .bind(build.daily_cost)
        .bind(build.template_version_preset_id.map(uuid::Uuid::from))
        .bind(build.has_ai_task)
        .bind(build.ai_task_sidebar_app_id.map(uuid::Uuid::from))
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            insert_error(
                e,
                format!("workspace build {} #{}", build.workspace_id, build.build_number),
            )
        })?;
        Ok(())
    }

    async fn insert_build_parameters(
        &self,
        parameters: &[WorkspaceBuildParameter],
    ) -> DbResult<()> {
        let mut conn = self.conn().await?;
        for parameter in parameters {
            sqlx::query(
                "INSERT INTO workspace_build_parameters (workspace_build_id, name, value) VALUES ($1, $2, $3)",
            )
            .bind(parameter.workspace_build_id.as_uuid())
            .bind(&parameter.name)
            .bind(&parameter.value)
            .execute(&mut *conn)
            .await
            .map_err(|e| insert_error(e, format!("build parameter {}", parameter.name)))?;
        }
        Ok(())
    }

    async fn mark_workspace_deleted(&self, id: ResourceId) -> DbResult<()> {
        let mut conn = self.conn().await?;
        let result = sqlx::query("UPDATE workspaces SET deleted = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("workspace {id}")));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        self.tx.into_inner().commit().await?;
        Ok(())
    }
}
