//! `cmd`: run one command

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{decode, schema_of, step_meta};
use crate::error::ServerError;
use crate::playbook::registry::StepKind;
use crate::playbook::{Step, StepContext};

pub const NAME: &str = "cmd";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CmdConfig {
    /// Command line to execute
    pub cmd: String,
}

pub struct CmdStep {
    id: String,
    cfg: CmdConfig,
}

impl CmdStep {
    pub fn new(cfg: CmdConfig) -> Self {
        Self {
            id: String::new(),
            cfg,
        }
    }

    pub fn kind() -> StepKind {
        StepKind::new(NAME, "Run a command", schema_of::<CmdConfig>(), |config| {
            Ok(Box::new(CmdStep::new(decode(NAME, config)?)))
        })
    }
}

#[async_trait]
impl Step for CmdStep {
    step_meta!(NAME, "Run a command");

    async fn exec(&self, ctx: &StepContext) -> Result<Vec<u8>, ServerError> {
        let session = ctx.session().await?;
        let output = if ctx.sudo {
            let password = ctx.client.config().password.clone();
            session.sudo_context(&self.cfg.cmd, &password, &ctx.call).await?
        } else {
            session.output_context(&self.cfg.cmd, &ctx.call).await?
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_cmd() {
        assert!(CmdStep::kind().create(serde_json::json!({})).is_err());
        let step = CmdStep::kind()
            .create(serde_json::json!({"cmd": "df -h"}))
            .unwrap();
        assert_eq!(step.desc(), "Run a command");
        assert!(step.parse_caches().is_empty());
    }
}
