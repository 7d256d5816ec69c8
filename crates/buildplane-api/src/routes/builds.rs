//! Workspace build endpoints.

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, patch};
use axum::{Json, Router};
use buildplane_builds::{BuildTimings, CreateBuildRequest, ExpectedStatus, WorkspaceBuildView};
use buildplane_core::ResourceId;
use buildplane_core::workspace::WorkspaceBuildParameter;
use buildplane_db::BuildPage;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;
use crate::extract::Caller;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/workspacebuilds/{id}", get(get_build))
        .route("/workspacebuilds/{id}/cancel", patch(cancel_build))
        .route("/workspacebuilds/{id}/parameters", get(get_parameters))
        .route("/workspacebuilds/{id}/state", get(get_state))
        .route("/workspacebuilds/{id}/timings", get(get_timings))
        .route(
            "/workspaces/{id}/builds",
            get(list_builds).post(create_build),
        )
        .route(
            "/users/{user}/workspace/{name}/builds/{number}",
            get(get_build_by_number),
        )
}

async fn get_build(
    State(state): State<AppState>,
    Caller(subject): Caller,
    Path(id): Path<ResourceId>,
) -> Result<Json<WorkspaceBuildView>, ApiError> {
    Ok(Json(state.builds.build(&subject, id).await?))
}

#[derive(Debug, Deserialize)]
struct CancelQuery {
    expect_status: Option<String>,
}

async fn cancel_build(
    State(state): State<AppState>,
    Caller(subject): Caller,
    Path(id): Path<ResourceId>,
    Query(query): Query<CancelQuery>,
) -> Result<Json<Value>, ApiError> {
    let expect_status = query
        .expect_status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<ExpectedStatus>)
        .transpose()?;
    state.builds.cancel(&subject, id, expect_status).await?;
    Ok(Json(json!({ "message": "Job has been marked as canceled" })))
}

async fn get_parameters(
    State(state): State<AppState>,
    Caller(subject): Caller,
    Path(id): Path<ResourceId>,
) -> Result<Json<Vec<WorkspaceBuildParameter>>, ApiError> {
    Ok(Json(state.builds.parameters(&subject, id).await?))
}

async fn get_state(
    State(state): State<AppState>,
    Caller(subject): Caller,
    Path(id): Path<ResourceId>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state.builds.provisioner_state(&subject, id).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes))
}

async fn get_timings(
    State(state): State<AppState>,
    Caller(subject): Caller,
    Path(id): Path<ResourceId>,
) -> Result<Json<BuildTimings>, ApiError> {
    Ok(Json(state.builds.timings(&subject, id).await?))
}

#[derive(Debug, Deserialize)]
struct ListBuildsQuery {
    after_id: Option<ResourceId>,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    limit: i64,
    since: Option<DateTime<Utc>>,
}

async fn list_builds(
    State(state): State<AppState>,
    Caller(subject): Caller,
    Path(workspace_id): Path<ResourceId>,
    Query(query): Query<ListBuildsQuery>,
) -> Result<Json<Vec<WorkspaceBuildView>>, ApiError> {
    let page = BuildPage {
        after_id: query.after_id,
        offset: query.offset,
        limit: query.limit,
        since: query.since,
    };
    Ok(Json(
        state
            .builds
            .builds_for_workspace(&subject, workspace_id, &page)
            .await?,
    ))
}

async fn create_build(
    State(state): State<AppState>,
    Caller(subject): Caller,
    Path(workspace_id): Path<ResourceId>,
    Json(req): Json<CreateBuildRequest>,
) -> Result<(StatusCode, Json<WorkspaceBuildView>), ApiError> {
    let build = state.builds.submit(&subject, workspace_id, req).await?;
    Ok((StatusCode::CREATED, Json(build)))
}

async fn get_build_by_number(
    State(state): State<AppState>,
    Caller(subject): Caller,
    Path((user, name, number)): Path<(String, String, i32)>,
) -> Result<Json<WorkspaceBuildView>, ApiError> {
    let owner_id = match user.as_str() {
        "me" => subject.user_id,
        other => other
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid user id {other:?}")))?,
    };
    Ok(Json(
        state
            .builds
            .build_by_number(&subject, owner_id, &name, number)
            .await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::USER_HEADER;
    use crate::routes;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use buildplane_builds::BuildService;
    use buildplane_core::audit::MemoryAuditor;
    use buildplane_core::authz::RoleAuthorizer;
    use buildplane_core::events::MemoryPubsub;
    use buildplane_core::notification::MemoryNotifier;
    use buildplane_core::workspace::WorkspaceTransition;
    use buildplane_db::MemoryStore;
    use buildplane_db::fixtures::Fixture;
    use buildplane_scheduler::WorkspaceBuilder;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> (axum::Router, Fixture, MemoryStore) {
        let fixture = Fixture::new();
        let store = MemoryStore::new();
        fixture.seed(&store).await;
        let builds = BuildService::new(
            Arc::new(store.clone()),
            Arc::new(WorkspaceBuilder::default()),
            Arc::new(MemoryPubsub::new()),
            Arc::new(MemoryNotifier::new()),
            Arc::new(MemoryAuditor::new()),
            Arc::new(RoleAuthorizer),
        );
        (routes::router(AppState::new(builds)), fixture, store)
    }

    fn request(method: &str, uri: &str, user: ResourceId, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_HEADER, user.to_string());
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_build() {
        let (app, fixture, _store) = app().await;
        let uri = format!("/api/v2/workspaces/{}/builds", fixture.workspace.id);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &uri,
                fixture.owner.id,
                Some(json!({ "transition": "start" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        assert_eq!(created["build_number"], 1);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["job"]["status"], "pending");

        let id = created["id"].as_str().unwrap().to_string();
        let response = app
            .clone()
            .oneshot(request(
                "GET",
                &format!("/api/v2/workspacebuilds/{id}"),
                fixture.owner.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let build = json_body(response).await;
        assert_eq!(build["job"]["queue_position"], 1);
        assert_eq!(build["workspace_name"], "dev");

        let response = app
            .oneshot(request(
                "GET",
                "/api/v2/users/me/workspace/dev/builds/1",
                fixture.owner.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["id"], id.as_str());
    }

    #[tokio::test]
    async fn test_missing_caller_is_unauthorized() {
        let (app, fixture, _store) = app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v2/workspaces/{}/builds", fixture.workspace.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_orphan_start_is_bad_request() {
        let (app, fixture, store) = app().await;
        let uri = format!("/api/v2/workspaces/{}/builds", fixture.workspace.id);
        let response = app
            .oneshot(request(
                "POST",
                &uri,
                fixture.owner.id,
                Some(json!({ "transition": "start", "orphan": true })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.snapshot().await.builds.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_with_expect_status() {
        let (app, fixture, store) = app().await;
        let (build, job) = fixture
            .seed_build(&store, 1, WorkspaceTransition::Start)
            .await;
        let uri = format!("/api/v2/workspacebuilds/{}/cancel", build.id);

        let response = app
            .clone()
            .oneshot(request(
                "PATCH",
                &format!("{uri}?expect_status=running"),
                fixture.owner.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

        let response = app
            .clone()
            .oneshot(request(
                "PATCH",
                &format!("{uri}?expect_status=done"),
                fixture.owner.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(request(
                "PATCH",
                &format!("{uri}?expect_status=pending"),
                fixture.owner.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.snapshot().await.job(job.id).unwrap().canceled_at.is_some());

        let response = app
            .oneshot(request("PATCH", &uri, fixture.owner.id, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_other_users_get_not_found() {
        let (app, fixture, store) = app().await;
        let (build, job) = fixture
            .seed_build(&store, 1, WorkspaceTransition::Start)
            .await;

        for (method, uri) in [
            ("GET", format!("/api/v2/workspacebuilds/{}", build.id)),
            ("GET", format!("/api/v2/workspacebuilds/{}/parameters", build.id)),
            ("GET", format!("/api/v2/workspacebuilds/{}/timings", build.id)),
            ("PATCH", format!("/api/v2/workspacebuilds/{}/cancel", build.id)),
        ] {
            let response = app
                .clone()
                .oneshot(request(method, &uri, fixture.member.id, None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {uri}");
        }
        assert!(store.snapshot().await.job(job.id).unwrap().canceled_at.is_none());
    }

    #[tokio::test]
    async fn test_state_is_hidden_from_workspace_owner() {
        let (app, fixture, store) = app().await;
        let (build, _) = fixture
            .seed_build(&store, 1, WorkspaceTransition::Start)
            .await;
        let uri = format!("/api/v2/workspacebuilds/{}/state", build.id);

        let response = app
            .clone()
            .oneshot(request("GET", &uri, fixture.owner.id, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request("GET", &uri, fixture.template_admin.id, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn test_list_builds_with_unknown_after_id() {
        let (app, fixture, _store) = app().await;
        let uri = format!(
            "/api/v2/workspaces/{}/builds?after_id={}",
            fixture.workspace.id,
            ResourceId::new()
        );
        let response = app
            .oneshot(request("GET", &uri, fixture.owner.id, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["message"].is_string());
    }

    #[tokio::test]
    async fn test_timings_and_parameters_of_new_build() {
        let (app, fixture, store) = app().await;
        let (build, _) = fixture
            .seed_build(&store, 1, WorkspaceTransition::Start)
            .await;

        let response = app
            .clone()
            .oneshot(request(
                "GET",
                &format!("/api/v2/workspacebuilds/{}/timings", build.id),
                fixture.owner.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let timings = json_body(response).await;
        assert_eq!(timings["provisioner_timings"], json!([]));
        assert_eq!(timings["agent_connection_timings"], json!([]));

        let response = app
            .oneshot(request(
                "GET",
                &format!("/api/v2/workspacebuilds/{}/parameters", build.id),
                fixture.owner.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!([]));
    }
}
