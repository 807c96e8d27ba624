//! Server-side cache for files that playbook steps upload
//!
//! Cached files live in the upload directory as `<uuid><original name>`.
//! Steps reference them by full path; when a playbook is deleted every
//! path its steps reference is removed.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWriteExt};

use super::registry::StepRegistry;
use super::StepRecord;
use crate::error::ServerError;

/// Length of the hyphenated UUID prefix on cached file names
pub const GUID_LENGTH: usize = 36;

/// Store `reader` in `upload_dir` under a fresh GUID prefix and return the path
pub async fn cache_upload<R>(upload_dir: &Path, filename: &str, reader: &mut R) -> std::io::Result<PathBuf>
where
    R: AsyncRead + Unpin + ?Sized,
{
    tokio::fs::create_dir_all(upload_dir).await?;

    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let path = upload_dir.join(format!("{}{}", uuid::Uuid::new_v4(), base));

    let mut file = tokio::fs::File::create(&path).await?;
    if let Err(e) = tokio::io::copy(reader, &mut file).await {
        drop(file);
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e);
    }
    file.flush().await?;
    Ok(path)
}

/// Original file name of a cached path
pub fn display_name(path: &str) -> String {
    let base = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    match base.get(GUID_LENGTH..) {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => base.to_string(),
    }
}

/// Record each step's cache paths in its `caches` field.
///
/// Steps that cannot be built keep whatever they carried.
pub fn fill_caches(registry: &StepRegistry, records: &mut [StepRecord]) {
    for record in records.iter_mut() {
        let built = record
            .params_value()
            .map_err(ServerError::from)
            .and_then(|params| registry.new_step(&record.step_type, &record.name, params));
        match built {
            Ok(step) => {
                let caches = step.parse_caches();
                record.caches = serde_json::to_string(&caches).ok();
            }
            Err(e) => {
                tracing::error!("error when parse step param: {:?}, err: {}", record.params, e);
            }
        }
    }
}

/// Every cache path referenced by `records`
pub fn collect_caches(registry: &StepRegistry, records: &[StepRecord]) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for record in records {
        if let Some(raw) = &record.caches {
            if let Ok(listed) = serde_json::from_str::<Vec<String>>(raw) {
                paths.extend(listed);
            }
        }
        if let Ok(params) = record.params_value() {
            if let Ok(step) = registry.new_step(&record.step_type, &record.name, params) {
                paths.extend(step.parse_caches());
            }
        }
    }
    paths.retain(|p| !p.is_empty());
    paths.sort();
    paths.dedup();
    paths
}

/// Delete cache files; returns how many were removed
pub async fn remove_caches(paths: &[String]) -> usize {
    let mut removed = 0;
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path, "failed to remove cache file: {}", e),
        }
    }
    removed
}
