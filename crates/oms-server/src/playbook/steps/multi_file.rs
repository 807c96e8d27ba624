//! `multi_file`: upload several cached files into one directory

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::file::upload_cached;
use super::{decode, schema_of, step_meta};
use crate::error::ServerError;
use crate::playbook::registry::StepKind;
use crate::playbook::{Step, StepContext};

pub const NAME: &str = "multi_file";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MultiFileConfig {
    #[schemars(extend("format" = "data-url"))]
    pub files: Vec<String>,
    /// Remote directory
    pub remote_dir: String,
}

pub struct MultiFileStep {
    id: String,
    cfg: MultiFileConfig,
}

impl MultiFileStep {
    pub fn kind() -> StepKind {
        StepKind::new(
            NAME,
            "Upload several files",
            schema_of::<MultiFileConfig>(),
            |config| {
                Ok(Box::new(MultiFileStep {
                    id: String::new(),
                    cfg: decode(NAME, config)?,
                }))
            },
        )
    }
}

#[async_trait]
impl Step for MultiFileStep {
    step_meta!(NAME, "Upload several files");

    fn parse_caches(&self) -> Vec<String> {
        self.cfg.files.iter().filter(|f| !f.is_empty()).cloned().collect()
    }

    async fn exec(&self, ctx: &StepContext) -> Result<Vec<u8>, ServerError> {
        ctx.client.sftp().await?;

        let dir = if self.cfg.remote_dir.ends_with('/') {
            self.cfg.remote_dir.clone()
        } else {
            format!("{}/", self.cfg.remote_dir)
        };
        for file in &self.cfg.files {
            upload_cached(&ctx.client, file, &dir).await?;
        }

        Ok(format!(
            "upload success, remote path: {}, total files: {}\r\n",
            self.cfg.remote_dir,
            self.cfg.files.len()
        )
        .into_bytes())
    }
}
