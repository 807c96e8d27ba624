//! Command fan-out, host status checks and command history

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::Json;
use oms_core::models::{CommandHistory, Preload};
use oms_transport::{get_all_stats, CallContext, Stats};
use serde::Deserialize;

use super::{ApiResult, Envelope};
use crate::error::ServerError;
use crate::ssh::{fan_out, resolve, Command, HostResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub kind: String,
    pub id: i64,
    pub cmd: String,
    #[serde(default)]
    pub sudo: bool,
    /// Per-host deadline in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PlayerRunRequest {
    pub kind: String,
    pub id: i64,
    pub playbook_id: i64,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn with_timeout(command: Command, secs: Option<u64>) -> Command {
    match secs.filter(|s| *s > 0) {
        Some(secs) => command.with_timeout(Duration::from_secs(secs)),
        None => command,
    }
}

pub async fn run(State(state): State<Arc<AppState>>, Json(req): Json<RunRequest>) -> ApiResult<Vec<HostResult>> {
    if req.cmd.trim().is_empty() {
        return Err(ServerError::BadRequest("cmd is empty".into()));
    }
    let hosts = resolve(state.store.as_ref(), &req.kind, req.id)?;
    if let Err(e) = state.store.insert_or_update_command_history(&req.cmd) {
        tracing::warn!("failed to record command history: {}", e);
    }

    // abandoned requests cancel their workers
    let call = CallContext::new();
    let _guard = call.token().clone().drop_guard();
    let command = with_timeout(Command::shell(req.cmd, req.sudo), req.timeout);
    let results = fan_out(Arc::clone(&state.executor), hosts, command, &call).await;
    Ok(Envelope::ok(results))
}

pub async fn player_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlayerRunRequest>,
) -> ApiResult<Vec<HostResult>> {
    let playbook = state.store.get_playbook(req.playbook_id)?;
    let steps = state.ssh.parse_steps(&playbook.steps)?;
    let hosts = resolve(state.store.as_ref(), &req.kind, req.id)?;

    let call = CallContext::new();
    let _guard = call.token().clone().drop_guard();
    let command = with_timeout(Command::player(steps, req.sudo), req.timeout);
    let results = fan_out(Arc::clone(&state.executor), hosts, command, &call).await;
    Ok(Envelope::ok(results))
}

pub async fn host_status(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<bool> {
    let host = state.store.get_host(id, Preload::NONE)?;
    Ok(Envelope::ok(state.ssh.get_status(&host).await))
}

pub async fn host_stats(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<Stats> {
    let host = state.store.get_host(id, Preload::NONE)?;
    let client = state.ssh.new_client(&host).await?;

    let mut stats = state.stats.remove(&id).map(|(_, s)| s).unwrap_or_else(Stats::new);
    get_all_stats(&client, &mut stats).await;
    state.stats.insert(id, stats.clone());
    Ok(Envelope::ok(stats))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn search_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Vec<CommandHistory>> {
    let limit = q.limit.filter(|l| *l > 0).unwrap_or(10);
    Ok(Envelope::ok(state.store.search_command_history(&q.keyword, limit)?))
}
