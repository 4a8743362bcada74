use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::error::DqtError;
use crate::evaluate::Evaluation;
use crate::filter::{FilterTree, GroupOperator, NodePath, Rule};
use crate::interface::QueryInterface;
use crate::project::{DisplayMode, RowProjection};
use crate::selection::{FieldSelection, Toggle, VisitAction};
use crate::services::FieldRef;

type Shared = State<Arc<QueryInterface>>;
type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Serialize)]
pub struct ErrorBody {
    pub status: String,
    pub error: String,
}

/// Maps engine errors onto HTTP statuses.
pub struct ApiError(pub DqtError);

impl From<DqtError> for ApiError {
    fn from(e: DqtError) -> Self {
        Self(e)
    }
}

pub fn status_of(e: &DqtError) -> StatusCode {
    match e {
        DqtError::SaveConflict { .. } | DqtError::Superseded { .. } => StatusCode::CONFLICT,
        DqtError::Parse { .. } | DqtError::NotSelected { .. } | DqtError::InvalidPath(_) => StatusCode::BAD_REQUEST,
        DqtError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_of(&self.0);
        let msg = self.0.to_string();
        warn!(%msg, code = %status.as_u16(), "request failed");
        (status, Json(ErrorBody { status: "error".into(), error: msg })).into_response()
    }
}

// ------------- Request bodies -------------
#[derive(Deserialize)]
pub struct AddRuleRequest {
    #[serde(default)]
    pub parent: NodePath,
    #[serde(default)]
    pub rule: Rule,
}

#[derive(Deserialize)]
pub struct AddGroupRequest {
    #[serde(default)]
    pub parent: NodePath,
    #[serde(default)]
    pub operator: GroupOperator,
}

#[derive(Deserialize)]
pub struct ReplaceRuleRequest {
    pub path: NodePath,
    pub rule: Rule,
}

#[derive(Deserialize)]
pub struct PathRequest {
    pub path: NodePath,
}

#[derive(Deserialize)]
pub struct OperatorRequest {
    #[serde(default)]
    pub path: NodePath,
    pub operator: GroupOperator,
}

#[derive(Deserialize)]
pub struct RunRequest {
    /// Defaults to the fields currently selected.
    #[serde(default)]
    pub fields: Option<Vec<FieldRef>>,
}

#[derive(Deserialize)]
pub struct ToggleRequest {
    pub instrument: String,
    pub field: String,
    #[serde(default)]
    pub downloadable: bool,
}

#[derive(Deserialize)]
pub struct VisitRequest {
    pub action: VisitAction,
    pub visit: String,
    pub field: FieldRef,
}

#[derive(Deserialize)]
pub struct SaveBody {
    pub name: String,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Deserialize)]
pub struct LoadRequest {
    #[serde(default)]
    pub fields: Value,
    #[serde(default)]
    pub criteria: Value,
}

#[derive(Deserialize)]
pub struct DisplayRequest {
    pub mode: DisplayMode,
}

// ------------- Responses -------------
#[derive(Serialize)]
pub struct EditResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<NodePath>,
    pub evaluation: Evaluation,
}

#[derive(Serialize)]
pub struct RunResponse {
    pub status: String,
    pub elapsed_ms: f64,
    pub row_count: usize,
    pub projection: RowProjection,
}

#[derive(Serialize)]
pub struct LoadResponse {
    pub filter: FilterTree,
    pub fields: Vec<FieldRef>,
    pub downloadable: Vec<FieldRef>,
}

impl LoadResponse {
    fn new(filter: FilterTree, selection: &FieldSelection) -> Self {
        Self {
            filter,
            fields: selection.fields().to_vec(),
            downloadable: selection.downloadable().iter().cloned().collect(),
        }
    }
}

#[derive(Serialize)]
pub struct SavedResponse {
    pub id: String,
}

// ------------- Handlers -------------
async fn setup(State(query): Shared) -> Json<crate::services::StudySetup> {
    Json(query.setup().clone())
}

async fn current_filter(State(query): Shared) -> Json<FilterTree> {
    Json(query.filter().await)
}

async fn submit_filter(State(query): Shared, Json(tree): Json<FilterTree>) -> Json<Evaluation> {
    Json(query.submit_filter(tree).await)
}

async fn update_filter(State(query): Shared, Json(tree): Json<FilterTree>) -> StatusCode {
    query.update_filter(tree).await;
    StatusCode::NO_CONTENT
}

async fn add_rule(State(query): Shared, Json(req): Json<AddRuleRequest>) -> ApiResult<EditResponse> {
    let (path, evaluation) = query.add_rule(&req.parent, req.rule).await?;
    Ok(Json(EditResponse { path: Some(path), evaluation }))
}

async fn add_group(State(query): Shared, Json(req): Json<AddGroupRequest>) -> ApiResult<EditResponse> {
    let (path, evaluation) = query.add_group(&req.parent, req.operator).await?;
    Ok(Json(EditResponse { path: Some(path), evaluation }))
}

async fn replace_rule(State(query): Shared, Json(req): Json<ReplaceRuleRequest>) -> ApiResult<EditResponse> {
    let evaluation = query.replace_rule(&req.path, req.rule).await?;
    Ok(Json(EditResponse { path: Some(req.path), evaluation }))
}

async fn remove_node(State(query): Shared, Json(req): Json<PathRequest>) -> ApiResult<EditResponse> {
    let evaluation = query.remove_node(&req.path).await?;
    Ok(Json(EditResponse { path: None, evaluation }))
}

async fn set_operator(State(query): Shared, Json(req): Json<OperatorRequest>) -> ApiResult<EditResponse> {
    let evaluation = query.set_group_operator(&req.path, req.operator).await?;
    Ok(Json(EditResponse { path: Some(req.path), evaluation }))
}

async fn run_query(State(query): Shared, Json(req): Json<RunRequest>) -> ApiResult<RunResponse> {
    let started = Instant::now();
    let projection = match req.fields {
        Some(fields) => query.run_query(&fields).await?,
        None => query.run_current_query().await?,
    };
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    info!(ms = elapsed_ms, rows = projection.rows.len(), "query complete");
    Ok(Json(RunResponse { status: "ok".into(), elapsed_ms, row_count: projection.rows.len(), projection }))
}

async fn current_selection(State(query): Shared) -> Json<LoadResponse> {
    Json(LoadResponse::new(query.filter().await, &query.selection().await))
}

async fn toggle_field(State(query): Shared, Json(req): Json<ToggleRequest>) -> Json<Toggle> {
    Json(query.toggle_field(&req.instrument, &req.field, req.downloadable).await)
}

async fn field_visit(State(query): Shared, Json(req): Json<VisitRequest>) -> Result<StatusCode, ApiError> {
    query.field_visit_select(req.action, &req.visit, &req.field).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_saved(State(query): Shared) -> ApiResult<Vec<crate::saved::SavedQuerySummary>> {
    Ok(Json(query.saved_queries().await?))
}

async fn save_query(State(query): Shared, Json(req): Json<SaveBody>) -> ApiResult<SavedResponse> {
    let id = query.save_current_query(&req.name, req.shared, req.overwrite).await?;
    Ok(Json(SavedResponse { id }))
}

async fn load_payload(State(query): Shared, Json(req): Json<LoadRequest>) -> ApiResult<LoadResponse> {
    let (filter, selection) = query.load_saved_query(&req.fields, &req.criteria).await?;
    Ok(Json(LoadResponse::new(filter, &selection)))
}

async fn load_saved(State(query): Shared, Path(id): Path<String>) -> ApiResult<LoadResponse> {
    let saved = query.load_saved_query_by_id(&id).await?;
    Ok(Json(LoadResponse::new(saved.filter, &saved.selection)))
}

async fn delete_saved(State(query): Shared, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    query.delete_saved_query(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn change_display(State(query): Shared, Json(req): Json<DisplayRequest>) -> Json<Option<RowProjection>> {
    Json(query.change_display(req.mode).await)
}

async fn reset(State(query): Shared) -> StatusCode {
    query.reset_query().await;
    StatusCode::NO_CONTENT
}

pub fn router(interface: Arc<QueryInterface>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);
    Router::new()
        .route("/v1/setup", get(setup))
        .route("/v1/filter", get(current_filter).post(submit_filter).put(update_filter))
        .route("/v1/filter/rule", post(add_rule).put(replace_rule))
        .route("/v1/filter/group", post(add_group))
        .route("/v1/filter/remove", post(remove_node))
        .route("/v1/filter/operator", post(set_operator))
        .route("/v1/query", post(run_query))
        .route("/v1/fields", get(current_selection))
        .route("/v1/fields/toggle", post(toggle_field))
        .route("/v1/fields/visit", post(field_visit))
        .route("/v1/saved", get(list_saved).post(save_query))
        .route("/v1/saved/load", post(load_payload))
        .route("/v1/saved/:id", get(load_saved).delete(delete_saved))
        .route("/v1/display", post(change_display))
        .route("/v1/reset", post(reset))
        .layer(cors)
        .with_state(interface)
}
