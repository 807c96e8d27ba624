//! `file`: upload a cached file or remove a remote path

use std::path::Path;

use async_trait::async_trait;
use oms_transport::{parse_upload_path, Client};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{decode, schema_of, step_meta};
use crate::error::ServerError;
use crate::playbook::cache::display_name;
use crate::playbook::registry::StepKind;
use crate::playbook::{Step, StepContext};

pub const NAME: &str = "file";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FileOption {
    /// Copy the cached file to the remote path
    Upload,
    /// Delete the remote file or directory
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileConfig {
    /// Cached upload
    #[serde(default)]
    #[schemars(extend("format" = "data-url"))]
    pub file: String,
    pub options: FileOption,
    /// Remote file path; a trailing `/` keeps the original name
    pub remote: String,
}

pub struct FileStep {
    id: String,
    cfg: FileConfig,
}

impl FileStep {
    pub fn kind() -> StepKind {
        StepKind::new(NAME, "File operation", schema_of::<FileConfig>(), |config| {
            Ok(Box::new(FileStep {
                id: String::new(),
                cfg: decode(NAME, config)?,
            }))
        })
    }
}

#[async_trait]
impl Step for FileStep {
    step_meta!(NAME, "File operation");

    fn parse_caches(&self) -> Vec<String> {
        if self.cfg.file.is_empty() {
            Vec::new()
        } else {
            vec![self.cfg.file.clone()]
        }
    }

    async fn exec(&self, ctx: &StepContext) -> Result<Vec<u8>, ServerError> {
        ctx.client.sftp().await?;
        match self.cfg.options {
            FileOption::Upload => {
                let remote = upload_cached(&ctx.client, &self.cfg.file, &self.cfg.remote).await?;
                Ok(format!("upload success, remote path: {remote}\r\n").into_bytes())
            }
            FileOption::Remove => {
                if ctx.client.is_dir(&self.cfg.remote).await {
                    ctx.client.remove_dir(&self.cfg.remote).await?;
                } else {
                    ctx.client.remove(&self.cfg.remote).await?;
                }
                Ok(b"remove success!\r\n".to_vec())
            }
        }
    }
}

/// Upload one cache file under its display name; returns the remote path
pub(crate) async fn upload_cached(client: &Client, local: &str, remote: &str) -> Result<String, ServerError> {
    if !tokio::fs::try_exists(local).await.unwrap_or(false) {
        return Err(ServerError::Step(format!("local cache does not exist: {local}")));
    }
    let name = display_name(local);

    let (mut target, _) = parse_upload_path(remote, &name);
    if !remote.ends_with('/') && !remote.is_empty() && client.is_dir(remote).await {
        target = oms_transport::sftp::join(remote, &name);
    }

    client.upload_file(Path::new(local), &target).await?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_enum() {
        let kind = FileStep::kind();
        assert!(kind
            .create(json!({"file": "/c/x", "options": "chmod", "remote": "/tmp"}))
            .is_err());
        let step = kind
            .create(json!({"options": "remove", "remote": "/tmp/old"}))
            .unwrap();
        assert!(step.parse_caches().is_empty());
        assert_eq!(step.config()["options"], "remove");
    }

    #[test]
    fn test_schema_lists_options() {
        let schema = &FileStep::kind().schema;
        let text = schema.to_string();
        assert!(text.contains("upload"));
        assert!(text.contains("remove"));
        assert_eq!(schema["properties"]["file"]["format"], "data-url");
    }
}
