//! `shell`: upload a script body and run it

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{decode, schema_of, step_meta};
use crate::error::ServerError;
use crate::playbook::registry::StepKind;
use crate::playbook::{Step, StepContext};

pub const NAME: &str = "shell";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ShellConfig {
    /// Script body, including its shebang line if any
    pub shell: String,
}

pub struct ShellStep {
    id: String,
    cfg: ShellConfig,
}

impl ShellStep {
    pub fn kind() -> StepKind {
        StepKind::new(NAME, "Run a shell script", schema_of::<ShellConfig>(), |config| {
            Ok(Box::new(ShellStep {
                id: String::new(),
                cfg: decode(NAME, config)?,
            }))
        })
    }
}

#[async_trait]
impl Step for ShellStep {
    step_meta!(NAME, "Run a shell script");

    async fn exec(&self, ctx: &StepContext) -> Result<Vec<u8>, ServerError> {
        let session = ctx.session().await?;
        Ok(session.run_script(&self.cfg.shell, ctx.sudo, &ctx.call).await?)
    }
}
