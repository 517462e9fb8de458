//! HTTP/REST facade (C8, `spec.md` §6.1, §6.5, §6.6). Thin translation from
//! wire requests to `Orchestrator` calls; no business logic lives here.

use axum::Json;
use axum::Router;
use axum::extract::Path as AxumPath;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::patch;
use axum::routing::post;
use dispatch_protocol::CreateSessionRequest;
use dispatch_protocol::LayoutAction;
use dispatch_protocol::LayoutActionKind;
use dispatch_protocol::SessionSummary;
use dispatch_protocol::WorkspacePatch;
use dispatch_protocol::DispatchError;
use serde::Deserialize;
use serde::Serialize;

use crate::state::AppState;

/// Returns an unstated `Router<AppState>` so the caller (`lib.rs::app`) can
/// merge in further routes (the WebSocket upgrade) before calling
/// `with_state` exactly once.
pub fn router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/sessions", post(create_session).get(list_sessions).delete(close_session).put(layout_action))
        .route("/sessions/{run_id}/history", get(session_history))
        .route("/workspaces", post(create_workspace).get(list_workspaces))
        .route("/workspaces/item", get(get_workspace).patch(update_workspace).delete(delete_workspace))
        .route_layer(middleware::from_fn_with_state(state, require_auth));

    Router::new().route("/healthz", get(healthz)).merge(protected)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

/// `spec.md` §6.1: "All protected endpoints require an authentication
/// token; ... Unauthenticated -> 401." A validator capability injected at
/// startup vets the token (`spec.md` §1); the daemon's own default is
/// `StaticTokenValidator` (`auth.rs`).
async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if state.auth.validate(token).await.is_some() => next.run(request).await,
        _ => error_response(DispatchError::Unauthorized),
    }
}

fn error_response(err: DispatchError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(serde_json::json!({ "error": err.code(), "message": err.to_string() }));
    (status, body).into_response()
}

fn to_summary(run: dispatch_protocol::Run) -> SessionSummary {
    SessionSummary {
        run_id: run.run_id,
        kind: run.kind,
        status: run.status,
        workspace_path: run.workspace_path,
        created_at: run.created_at,
        updated_at: run.updated_at,
    }
}

/// `POST /sessions` (`spec.md` §6.1). `resume: true` with `sessionId`
/// invokes `Orchestrator::resume` instead of `create`.
async fn create_session(State(state): State<AppState>, Json(req): Json<CreateSessionRequest>) -> Response {
    if req.resume {
        let Some(run_id) = req.session_id.clone() else {
            return error_response(DispatchError::NoSuchRun("missing sessionId for resume".to_string()));
        };
        return match state.orchestrator.resume(&run_id).await {
            Ok(()) => match state.orchestrator.find(&run_id).await {
                Ok(Some(run)) => (StatusCode::OK, Json(to_summary(run))).into_response(),
                Ok(None) => error_response(DispatchError::NoSuchRun(run_id)),
                Err(e) => error_response(e),
            },
            Err(e) => error_response(e),
        };
    }

    let metadata = req.metadata.unwrap_or_else(|| serde_json::json!({}));
    match state.orchestrator.create(req.kind, &req.workspace_path, metadata).await {
        Ok(run_id) => match state.orchestrator.find(&run_id).await {
            Ok(Some(run)) => (StatusCode::OK, Json(to_summary(run))).into_response(),
            Ok(None) => error_response(DispatchError::NoSuchRun(run_id)),
            Err(e) => error_response(e),
        },
        Err(e) => error_response(e),
    }
}

/// `GET /sessions` (`spec.md` §6.1).
async fn list_sessions(State(state): State<AppState>) -> Response {
    match state.orchestrator.list().await {
        Ok(runs) => Json(runs.into_iter().map(to_summary).collect::<Vec<_>>()).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseQuery {
    run_id: String,
}

/// `DELETE /sessions?runId=X` (`spec.md` §6.1).
async fn close_session(State(state): State<AppState>, Query(q): Query<CloseQuery>) -> Response {
    match state.orchestrator.close(&q.run_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// `PUT /sessions` (`spec.md` §6.1, §4.7.7).
async fn layout_action(State(state): State<AppState>, Json(action): Json<LayoutAction>) -> Response {
    let tile_id = match action.action {
        LayoutActionKind::SetLayout => action.tile_id,
        LayoutActionKind::RemoveLayout => None,
    };
    match state.orchestrator.set_layout(&action.run_id, &action.client_id, tile_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    #[serde(default = "default_from_seq")]
    from_seq: i64,
    #[serde(default = "default_history_limit")]
    limit: i64,
}

fn default_from_seq() -> i64 {
    1
}

fn default_history_limit() -> i64 {
    1000
}

#[derive(Serialize)]
struct HistoryResponse {
    events: Vec<dispatch_protocol::Event>,
}

/// `GET /sessions/{runId}/history?fromSeq=N&limit=K` (`spec.md` §6.1): a
/// direct read from the Event Store, no subscription involved.
async fn session_history(
    State(state): State<AppState>,
    AxumPath(run_id): AxumPath<String>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    match state.orchestrator.find(&run_id).await {
        Ok(None) => return error_response(DispatchError::NoSuchRun(run_id)),
        Err(e) => return error_response(e),
        Ok(Some(_)) => {}
    }
    match state.orchestrator.store().read(&run_id, q.from_seq.max(1), q.limit).await {
        Ok(events) => Json(HistoryResponse { events }).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkspaceRequest {
    path: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    theme_override: Option<String>,
}

/// `POST /workspaces` (`SPEC_FULL.md` §6.5).
async fn create_workspace(State(state): State<AppState>, Json(req): Json<CreateWorkspaceRequest>) -> Response {
    match state.orchestrator.workspaces().create(&req.path, req.name, req.theme_override).await {
        Ok(ws) => (StatusCode::CREATED, Json(ws)).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /workspaces` (`SPEC_FULL.md` §6.5).
async fn list_workspaces(State(state): State<AppState>) -> Response {
    match state.orchestrator.workspaces().list().await {
        Ok(list) => Json(list).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct WorkspacePathQuery {
    path: String,
}

/// `GET /workspaces/item?path=...` (`SPEC_FULL.md` §6.5). Workspace paths
/// are absolute filesystem paths containing `/`, so the single-resource
/// verbs address the workspace via a query parameter rather than a URL path
/// segment (the literal `{path}` segment from `spec.md` §6.1/`SPEC_FULL.md`
/// §6.5 would otherwise collide with axum's own path-segment routing).
async fn get_workspace(State(state): State<AppState>, Query(q): Query<WorkspacePathQuery>) -> Response {
    match state.orchestrator.workspaces().get(&q.path).await {
        Ok(Some(ws)) => Json(ws).into_response(),
        Ok(None) => error_response(DispatchError::NoSuchRun(q.path)),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateWorkspaceRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    theme_override: Option<String>,
}

async fn update_workspace(
    State(state): State<AppState>,
    Query(q): Query<WorkspacePathQuery>,
    Json(req): Json<UpdateWorkspaceRequest>,
) -> Response {
    let patch = WorkspacePatch {
        name: req.name,
        theme_override: req.theme_override,
    };
    match state.orchestrator.workspaces().update(&q.path, patch).await {
        Ok(ws) => Json(ws).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_workspace(State(state): State<AppState>, Query(q): Query<WorkspacePathQuery>) -> Response {
    match state.orchestrator.workspaces().delete(&q.path).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}
