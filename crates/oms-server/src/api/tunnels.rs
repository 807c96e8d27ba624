use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use oms_core::models::{NewTunnel, Tunnel};

use super::{ApiResult, Envelope};
use crate::state::AppState;

pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Tunnel>> {
    Ok(Envelope::ok(state.tunnels.list()?))
}

pub async fn create(State(state): State<Arc<AppState>>, Json(new): Json<NewTunnel>) -> ApiResult<Tunnel> {
    Ok(Envelope::ok(state.tunnels.create(&new)?))
}

pub async fn get(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<Tunnel> {
    let tunnel = match state.tunnels.get_tunnel(id) {
        Some(live) => live,
        None => state.store.get_tunnel(id)?,
    };
    Ok(Envelope::ok(tunnel))
}

pub async fn remove(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<()> {
    state.tunnels.delete(id)?;
    Ok(Envelope::ok(()))
}
