//! Playbooks, step schemas and the upload cache

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::Json;
use futures::TryStreamExt;
use oms_core::models::PlayBook;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;

use super::{ApiResult, Envelope};
use crate::error::{Result, ServerError};
use crate::playbook::{self, StepRecord, StepSchema};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PlaybookRequest {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

/// Build every step once and record its cache paths
fn prepare(state: &AppState, req: PlaybookRequest) -> Result<(String, String)> {
    if req.name.trim().is_empty() {
        return Err(ServerError::BadRequest("playbook name is empty".into()));
    }
    let mut records = req.steps;
    let raw = serde_json::to_string(&records)?;
    state.ssh.parse_steps(&raw)?;
    playbook::fill_caches(state.ssh.steps(), &mut records);
    Ok((req.name, serde_json::to_string(&records)?))
}

/// Cache paths of `raw` that live in the upload directory
fn owned_caches(state: &AppState, raw: &str) -> Vec<String> {
    let upload_dir = state.config.upload_path();
    match playbook::parse_records(raw) {
        Ok(records) => playbook::collect_caches(state.ssh.steps(), &records)
            .into_iter()
            .filter(|p| FsPath::new(p).starts_with(&upload_dir))
            .collect(),
        Err(e) => {
            tracing::warn!("unreadable playbook steps: {}", e);
            Vec::new()
        }
    }
}

pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Vec<PlayBook>> {
    Ok(Envelope::ok(state.store.list_playbooks()?))
}

pub async fn get(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<PlayBook> {
    Ok(Envelope::ok(state.store.get_playbook(id)?))
}

pub async fn create(State(state): State<Arc<AppState>>, Json(req): Json<PlaybookRequest>) -> ApiResult<PlayBook> {
    let (name, steps) = prepare(&state, req)?;
    Ok(Envelope::ok(state.store.insert_playbook(&name, &steps)?))
}

/// Replace a playbook; cache files it no longer references are removed
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<PlaybookRequest>,
) -> ApiResult<PlayBook> {
    let old = state.store.get_playbook(id)?;
    let (name, steps) = prepare(&state, req)?;
    let updated = state.store.update_playbook(id, &name, &steps)?;

    let kept = owned_caches(&state, &updated.steps);
    let dropped: Vec<String> = owned_caches(&state, &old.steps)
        .into_iter()
        .filter(|p| !kept.contains(p))
        .collect();
    playbook::remove_caches(&dropped).await;
    Ok(Envelope::ok(updated))
}

pub async fn remove(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<usize> {
    let playbook = state.store.get_playbook(id)?;
    let caches = owned_caches(&state, &playbook.steps);
    state.store.delete_playbook(id)?;
    let removed = playbook::remove_caches(&caches).await;
    tracing::info!(playbook_id = id, removed, "playbook deleted");
    Ok(Envelope::ok(removed))
}

pub async fn steps(State(state): State<Arc<AppState>>) -> ApiResult<Vec<StepSchema>> {
    Ok(Envelope::ok(state.ssh.steps().schemas()))
}

#[derive(Debug, Serialize)]
pub struct CachedFile {
    pub path: String,
    pub name: String,
}

/// Store the first file part in the upload cache
pub async fn cache_upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> ApiResult<CachedFile> {
    let bad = |e: axum::extract::multipart::MultipartError| ServerError::BadRequest(e.to_string());
    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let mut reader = StreamReader::new(Box::pin(field.map_err(std::io::Error::other)));
        let path = playbook::cache_upload(&state.config.upload_path(), &file_name, &mut reader).await?;
        let path = path.to_string_lossy().into_owned();
        tracing::info!(path = %path, "cached upload");
        return Ok(Envelope::ok(CachedFile {
            name: playbook::display_name(&path),
            path,
        }));
    }
    Err(ServerError::BadRequest("no file in request".into()))
}
