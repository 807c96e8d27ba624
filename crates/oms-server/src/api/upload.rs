//! Streaming multipart upload to many hosts
//!
//! Each file part is spooled to a temp file while one worker per target
//! host follows the spool and writes it over SFTP. Nothing waits for the
//! whole body. If the request goes away the workers are cancelled and
//! remove their partial remote files.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Multipart, Query, State};
use axum::http::HeaderMap;
use base64::Engine;
use futures::future::join_all;
use oms_core::models::Host;
use oms_transport::{parse_upload_path, CallContext, Client};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::{ApiResult, Envelope};
use crate::error::{Result, ServerError};
use crate::ssh::{resolve, TempSpool};
use crate::state::AppState;

/// Header carrying `{file name: size}` for the parts that follow
pub const X_FILES: &str = "X-Files";

/// Decode the `X-Files` header, plain or base64 JSON
pub fn parse_x_files(headers: &HeaderMap) -> Result<HashMap<String, u64>> {
    let Some(value) = headers.get(X_FILES) else {
        return Ok(HashMap::new());
    };
    let raw = value
        .to_str()
        .map_err(|e| ServerError::BadRequest(format!("{X_FILES}: {e}")))?
        .trim();
    let json = if raw.starts_with('{') {
        raw.as_bytes().to_vec()
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| ServerError::BadRequest(format!("{X_FILES}: {e}")))?
    };
    serde_json::from_slice(&json).map_err(|e| ServerError::BadRequest(format!("{X_FILES}: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub kind: String,
    pub id: i64,
    #[serde(default)]
    pub remote: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub host_id: i64,
    #[serde(rename = "hostname")]
    pub host_name: String,
    pub file: String,
    pub remote: String,
    pub status: bool,
    pub msg: String,
}

impl UploadResult {
    fn new(host: &Host, file: &str, remote: &str, outcome: Result<Option<u64>>) -> Self {
        let (status, msg) = match outcome {
            Ok(Some(bytes)) => (true, format!("{bytes} bytes written")),
            Ok(None) => (false, "already uploading".to_string()),
            Err(e) => (false, e.to_string()),
        };
        Self {
            host_id: host.id,
            host_name: host.name.clone(),
            file: file.to_string(),
            remote: remote.to_string(),
            status,
            msg,
        }
    }
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UploadQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Vec<UploadResult>> {
    let sizes = parse_x_files(&headers)?;
    let hosts = resolve(state.store.as_ref(), &q.kind, q.id)?;
    if hosts.is_empty() {
        return Err(ServerError::BadRequest("no target hosts".into()));
    }

    let call = CallContext::new();
    let _guard = call.token().clone().drop_guard();

    let mut results = Vec::new();
    let mut targets: Vec<(Host, Arc<Client>)> = Vec::new();
    let connected = join_all(hosts.iter().map(|h| state.ssh.new_client_with_sftp(h))).await;
    for (host, client) in hosts.into_iter().zip(connected) {
        match client {
            Ok(client) => targets.push((host, client)),
            Err(e) => results.push(UploadResult::new(&host, "", &q.remote, Err(e))),
        }
    }

    let tmp_dir = state.config.tmp_path();
    let mut workers: Vec<JoinHandle<UploadResult>> = Vec::new();
    let bad = |e: axum::extract::multipart::MultipartError| ServerError::Upload(e.to_string());

    while let Some(mut field) = multipart.next_field().await.map_err(bad)? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let total = sizes.get(&file_name).copied().unwrap_or(0);
        let (spool, mut writer) = TempSpool::create(TempSpool::path_for(&tmp_dir, &file_name)).await?;

        for (host, client) in &targets {
            let (remote_file, _) = parse_upload_path(&q.remote, &file_name);
            let ssh = Arc::clone(&state.ssh);
            let client = Arc::clone(client);
            let spool = Arc::clone(&spool);
            let host = host.clone();
            let file_name = file_name.clone();
            let call = call.child();
            workers.push(tokio::spawn(async move {
                let outcome = ssh
                    .upload_file_stream(&client, &spool, &file_name, total, &remote_file, &call)
                    .await;
                UploadResult::new(&host, &file_name, &remote_file, outcome)
            }));
        }
        drop(spool);

        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => writer.write(&chunk).await?,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(file = %file_name, "upload body ended early: {}", e);
                    writer.fail();
                    return Err(ServerError::Upload(e.to_string()));
                }
            }
        }
        writer.finish().await?;
    }

    for worker in join_all(workers).await {
        match worker {
            Ok(result) => results.push(result),
            Err(e) => tracing::error!("upload worker panicked: {}", e),
        }
    }
    Ok(Envelope::ok(results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_x_files_plain_and_base64() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FILES, HeaderValue::from_static(r#"{"a.txt":12,"b.bin":1048576}"#));
        let sizes = parse_x_files(&headers).unwrap();
        assert_eq!(sizes["a.txt"], 12);
        assert_eq!(sizes["b.bin"], 1048576);

        let encoded = base64::engine::general_purpose::STANDARD.encode(r#"{"c.tar.gz":7}"#);
        headers.insert(X_FILES, HeaderValue::from_str(&encoded).unwrap());
        assert_eq!(parse_x_files(&headers).unwrap()["c.tar.gz"], 7);
    }

    #[test]
    fn test_x_files_missing_or_bad() {
        assert!(parse_x_files(&HeaderMap::new()).unwrap().is_empty());
        let mut headers = HeaderMap::new();
        headers.insert(X_FILES, HeaderValue::from_static("not json"));
        assert!(matches!(parse_x_files(&headers), Err(ServerError::BadRequest(_))));
    }
}
