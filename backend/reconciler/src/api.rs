//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::error;

use crate::db;
use crate::engine::{Engine, PledgeOrigin};
use crate::errors::{ErrorKind, FeedError, ReconcilerError, VerificationError};
use crate::tracker::ProjectSnapshot;
use crate::types::{CheckStatus, Pledge, PledgeKey, Project, ProjectId, ProjectState, ProjectStateInfo};
use crate::view::{self, ActionMode, FundingSummary};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
    pub pool: SqlitePool,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/:id", get(get_project).delete(delete_project))
        .route("/projects/:id/reset", post(reset_project))
        .route("/projects/:id/pledges", get(get_project_pledges))
        .route("/projects/:id/refresh", post(refresh_project))
        .route("/pledges", post(submit_pledge))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub tracked_projects: usize,
}

#[derive(Serialize)]
pub struct ProjectResponse {
    pub project: Project,
    pub info: ProjectStateInfo,
    /// `info.state` with a failing check folded in as `error`.
    pub display_state: ProjectState,
    pub check: Option<CheckStatus>,
    pub message: Option<String>,
    pub action: ActionMode,
    pub funding: FundingSummary,
    pub expired: bool,
    pub pending_pledges: usize,
}

#[derive(Serialize)]
pub struct ProjectsResponse {
    pub count: usize,
    pub projects: Vec<ProjectResponse>,
}

#[derive(Serialize)]
pub struct PledgesResponse {
    pub project_id: ProjectId,
    pub count: usize,
    pub pledges: Vec<PledgeEntry>,
}

#[derive(Serialize)]
pub struct PledgeEntry {
    pub key: Option<PledgeKey>,
    pub claimed: bool,
    #[serde(flatten)]
    pub pledge: Pledge,
}

#[derive(Serialize)]
pub struct PledgeAccepted {
    pub key: PledgeKey,
    pub project_id: ProjectId,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: Option<ErrorKind>,
}

fn error_response(status: StatusCode, error: String, kind: Option<ErrorKind>) -> Response {
    (status, Json(serde_json::json!(ErrorResponse { error, kind }))).into_response()
}

fn verification_error_response(e: &VerificationError) -> Response {
    let status = match e {
        VerificationError::NotFound(_) => StatusCode::NOT_FOUND,
        VerificationError::MalformedPledge(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::BAD_GATEWAY,
    };
    error_response(status, e.to_string(), Some(e.kind()))
}

fn internal_error(e: ReconcilerError) -> Response {
    error!("API storage error: {e}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), None)
}

fn unknown_project(id: &ProjectId) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        format!("Unknown project: {id}"),
        Some(ErrorKind::NotFound),
    )
}

fn project_response(engine: &Engine, snapshot: &ProjectSnapshot) -> ProjectResponse {
    let wallet = engine.wallet();
    let wallet = wallet.as_deref();
    ProjectResponse {
        project: (*snapshot.project).clone(),
        info: snapshot.info.clone(),
        display_state: view::display_state(&snapshot.info, snapshot.check.as_ref()),
        check: snapshot.check.clone(),
        message: snapshot.check.as_ref().and_then(view::describe_check_status),
        action: view::action_mode(
            &snapshot.project,
            &snapshot.info,
            snapshot.info.value_pledged,
            wallet,
        ),
        funding: FundingSummary::from_snapshot(snapshot, wallet),
        expired: snapshot.project.is_expired(Utc::now()),
        pending_pledges: snapshot.pending,
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        tracked_projects: state.engine.tracked_ids().len(),
    })
}

/// `GET /projects`
pub async fn list_projects(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let mut snapshots = state.engine.snapshots();
    snapshots.sort_by(|a, b| b.project.timestamp.cmp(&a.project.timestamp));
    let projects: Vec<ProjectResponse> = snapshots
        .iter()
        .map(|s| project_response(&state.engine, s))
        .collect();
    (
        StatusCode::OK,
        Json(serde_json::json!(ProjectsResponse {
            count: projects.len(),
            projects,
        })),
    )
        .into_response()
}

/// `POST /projects`
///
/// Starts tracking the project and persists it. Re-posting a tracked
/// project with identical details is a no-op answered with `200`; different
/// details under a tracked id are refused with `409`.
pub async fn create_project(
    State(state): State<Arc<ApiState>>,
    Json(project): Json<Project>,
) -> Response {
    if project.outputs.is_empty() {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "project has no outputs".to_string(),
            None,
        );
    }
    let id = project.id.clone();
    if !state.engine.track_project(project.clone()) {
        return match state.engine.snapshot(&id) {
            Some(snapshot) if *snapshot.project == project => (
                StatusCode::OK,
                Json(serde_json::json!(project_response(&state.engine, &snapshot))),
            )
                .into_response(),
            Some(_) => error_response(
                StatusCode::CONFLICT,
                format!("Project {id} is already tracked with different details"),
                None,
            ),
            None => unknown_project(&id),
        };
    }
    if let Err(e) = db::save_project(&state.pool, &project).await {
        state.engine.untrack_project(&id);
        return internal_error(e);
    }
    match state.engine.snapshot(&id) {
        Some(snapshot) => (
            StatusCode::CREATED,
            Json(serde_json::json!(project_response(&state.engine, &snapshot))),
        )
            .into_response(),
        None => unknown_project(&id),
    }
}

/// `GET /projects/:id`
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    let id = ProjectId::from(id);
    match state.engine.snapshot(&id) {
        Some(snapshot) => (
            StatusCode::OK,
            Json(serde_json::json!(project_response(&state.engine, &snapshot))),
        )
            .into_response(),
        None => unknown_project(&id),
    }
}

/// `DELETE /projects/:id`
pub async fn delete_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    let id = ProjectId::from(id);
    if !state.engine.untrack_project(&id) {
        return unknown_project(&id);
    }
    match db::delete_project(&state.pool, &id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error(e),
    }
}

/// `POST /projects/:id/reset`
pub async fn reset_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    let id = ProjectId::from(id);
    match state.engine.reset_project(&id) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => verification_error_response(&e),
    }
}

/// `GET /projects/:id/pledges`
///
/// Open and claimed pledges, newest first. Pending ones are not listed.
pub async fn get_project_pledges(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    let id = ProjectId::from(id);
    let Some(snapshot) = state.engine.snapshot(&id) else {
        return unknown_project(&id);
    };

    let mut pledges: Vec<PledgeEntry> = snapshot
        .open
        .iter()
        .map(|p| (p, false))
        .chain(snapshot.claimed.iter().map(|p| (p, true)))
        .map(|(p, claimed)| PledgeEntry {
            key: p.key(),
            claimed,
            pledge: (**p).clone(),
        })
        .collect();
    pledges.sort_by(|a, b| b.pledge.timestamp.cmp(&a.pledge.timestamp));

    (
        StatusCode::OK,
        Json(serde_json::json!(PledgesResponse {
            project_id: id,
            count: pledges.len(),
            pledges,
        })),
    )
        .into_response()
}

/// `POST /projects/:id/refresh`
pub async fn refresh_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    let id = ProjectId::from(id);
    match state.engine.refresh(&id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(ReconcilerError::UnknownProject(id)) => unknown_project(&id),
        Err(ReconcilerError::Feed(FeedError::NotFound(_))) => error_response(
            StatusCode::NOT_FOUND,
            "Server error: 404 Not Found: project is not known".to_string(),
            Some(ErrorKind::NotFound),
        ),
        Err(e) => internal_error(e),
    }
}

/// `POST /pledges`
///
/// Accepts a pledge as a candidate. It is stored first and counted only
/// after verification, so `202` means "queued", not "valid". Expired
/// projects take no new pledges.
pub async fn submit_pledge(
    State(state): State<Arc<ApiState>>,
    Json(pledge): Json<Pledge>,
) -> Response {
    let project_id = pledge.project_id.clone();
    let key = match state.engine.check_pledge(&pledge) {
        Ok(key) => key,
        Err(e) => return verification_error_response(&e),
    };
    if state
        .engine
        .project(&project_id)
        .is_some_and(|p| p.is_expired(Utc::now()))
    {
        return error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("Project {project_id} has expired"),
            None,
        );
    }
    // Must be stored before the first pass can revoke it.
    if let Err(e) = db::save_pledge(&state.pool, &key, &pledge).await {
        return internal_error(e);
    }
    if let Err(e) = state.engine.ingest_pledge(pledge, PledgeOrigin::Local) {
        if let Err(db_err) = db::delete_pledge(&state.pool, &key).await {
            error!(pledge = %key, "Failed to drop rejected pledge: {db_err}");
        }
        return verification_error_response(&e);
    }
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!(PledgeAccepted { key, project_id })),
    )
        .into_response()
}
