use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandDescriptor, CommandType, NewCommand};
use crate::dispatch::Delivery;
use crate::ingest::{
    CookieSync, CookieSyncReport, FetchResult, PopupResult, Receipt, ScreenshotResult,
    SnapshotResult, TunnelFetchResult,
};
use crate::registry::AgentInfo;
use crate::store::ResultRecord;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    agents: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        agents: state.registry.len(),
    })
}

// ── Commands ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct SubmitRequest {
    command_type: Option<String>,
    #[serde(alias = "machine_id")]
    target_agent_id: Option<String>,
    target_sub_resource: Option<String>,
    incident_id: Option<String>,
    payload: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub(super) struct SubmitResponse {
    success: bool,
    status: &'static str,
    command_id: String,
}

pub(super) async fn submit_command(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(req) = body?;

    let command_type: CommandType = req
        .command_type
        .ok_or(ApiError::MissingField("command_type"))?
        .parse()
        .map_err(ApiError::InvalidRequest)?;
    let agent_id = req
        .target_agent_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(ApiError::MissingField("target_agent_id"))?;

    let mut new = NewCommand::new(command_type, agent_id)
        .with_payload(req.payload.unwrap_or_else(|| serde_json::json!({})));
    if let Some(sub) = req.target_sub_resource.filter(|s| !s.is_empty()) {
        new = new.with_sub_resource(sub);
    }
    if let Some(incident) = req.incident_id.filter(|s| !s.is_empty()) {
        new = new.with_incident(incident);
    }

    let submission = state.dispatcher.submit(new)?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            success: submission.delivery == Delivery::Sent,
            status: submission.delivery.as_str(),
            command_id: submission.command.id,
        }),
    ))
}

pub(super) async fn get_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Command>, ApiError> {
    state
        .commands
        .get_command(&id)?
        .map(Json)
        .ok_or(ApiError::CommandNotFound(id))
}

#[derive(Serialize)]
pub(super) struct ResultsResponse {
    command_id: String,
    results: Vec<ResultRecord>,
}

pub(super) async fn command_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let results = state.commands.results_for(&id)?;
    if results.is_empty() && state.commands.get_command(&id)?.is_none() {
        return Err(ApiError::CommandNotFound(id));
    }
    Ok(Json(ResultsResponse {
        command_id: id,
        results,
    }))
}

#[derive(Deserialize)]
pub(super) struct PollRequest {
    #[serde(alias = "machine_id")]
    agent_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
pub(super) struct PollResponse {
    commands: Vec<CommandDescriptor>,
}

pub(super) async fn poll_commands(
    State(state): State<AppState>,
    body: Result<Json<PollRequest>, JsonRejection>,
) -> Result<Json<PollResponse>, ApiError> {
    let Json(req) = body?;
    let agent_id = req
        .agent_id
        .filter(|id| !id.trim().is_empty())
        .ok_or(ApiError::MissingField("agent_id"))?;
    let commands = state.queue.fetch(&agent_id, req.limit)?;
    Ok(Json(PollResponse { commands }))
}

// ── Results ────────────────────────────────────────────────────────

pub(super) async fn fetch_result(
    State(state): State<AppState>,
    body: Result<Json<FetchResult>, JsonRejection>,
) -> Result<Json<Receipt>, ApiError> {
    let Json(result) = body?;
    Ok(Json(state.ingestor.ingest_fetch(result)?))
}

pub(super) async fn tunnel_fetch_result(
    State(state): State<AppState>,
    body: Result<Json<TunnelFetchResult>, JsonRejection>,
) -> Result<Json<Receipt>, ApiError> {
    let Json(result) = body?;
    Ok(Json(state.ingestor.ingest_tunnel_fetch(result)?))
}

pub(super) async fn screenshot_result(
    State(state): State<AppState>,
    body: Result<Json<ScreenshotResult>, JsonRejection>,
) -> Result<Json<Receipt>, ApiError> {
    let Json(result) = body?;
    Ok(Json(state.ingestor.ingest_screenshot(result)?))
}

pub(super) async fn snapshot_result(
    State(state): State<AppState>,
    body: Result<Json<SnapshotResult>, JsonRejection>,
) -> Result<Json<Receipt>, ApiError> {
    let Json(result) = body?;
    Ok(Json(state.ingestor.ingest_snapshot(result)?))
}

pub(super) async fn popup_result(
    State(state): State<AppState>,
    body: Result<Json<PopupResult>, JsonRejection>,
) -> Result<Json<Receipt>, ApiError> {
    let Json(result) = body?;
    Ok(Json(state.ingestor.ingest_popup(result)?))
}

// ── Incidents & agents ─────────────────────────────────────────────

pub(super) async fn sync_session(
    State(state): State<AppState>,
    Path(incident_id): Path<String>,
    body: Result<Json<CookieSync>, JsonRejection>,
) -> Result<Json<CookieSyncReport>, ApiError> {
    let Json(sync) = body?;
    Ok(Json(state.ingestor.sync_session(&incident_id, sync)?))
}

#[derive(Serialize)]
pub(super) struct AgentsResponse {
    count: usize,
    agents: Vec<AgentInfo>,
}

pub(super) async fn list_agents(State(state): State<AppState>) -> Json<AgentsResponse> {
    let agents = state.registry.snapshot();
    Json(AgentsResponse {
        count: agents.len(),
        agents,
    })
}
