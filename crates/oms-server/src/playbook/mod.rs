//! Playbook engine
//!
//! A playbook is an ordered list of typed steps. Each step type is built
//! from its JSON config by a factory in the [`StepRegistry`]; the
//! [`Player`] runs the built steps one after another against one host.
//!
//! # Step records
//!
//! Playbooks store their steps as a JSON array of
//! `{"type": ..., "name": ..., "params": ...}` records. `type` picks the
//! factory, `name` is the user's label for the step and `params` is the
//! step config, either inline or as a JSON-encoded string.

pub mod cache;
pub mod registry;
pub mod steps;

use std::sync::Arc;

use async_trait::async_trait;
use oms_transport::{CallContext, Client, PtySize, Session};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ServerError;

pub use cache::{cache_upload, collect_caches, display_name, fill_caches, remove_caches, GUID_LENGTH};
pub use registry::{StepKind, StepRegistry, StepSchema};

/// Everything a step may touch while it runs
pub struct StepContext {
    pub client: Arc<Client>,
    /// Run commands through the sudo bridge
    pub sudo: bool,
    pub pty: PtySize,
    pub call: CallContext,
}

impl StepContext {
    /// A fresh PTY session on the step's client
    pub async fn session(&self) -> Result<Session, ServerError> {
        Ok(self.client.new_session_with_pty(self.pty).await?)
    }
}

/// One unit of playbook work
#[async_trait]
pub trait Step: Send + Sync {
    /// Step type, the registry key
    fn name(&self) -> &str;

    /// User label of this step inside its playbook
    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);

    fn desc(&self) -> &str;

    /// The config this step was built from
    fn config(&self) -> Value;

    /// Server-local cache files this step reads
    fn parse_caches(&self) -> Vec<String> {
        Vec::new()
    }

    async fn exec(&self, ctx: &StepContext) -> Result<Vec<u8>, ServerError>;
}

/// Serialized step as stored in a playbook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caches: Option<String>,
    #[serde(default)]
    pub params: Value,
}

impl StepRecord {
    /// `params` as a JSON value; string params are decoded once
    pub fn params_value(&self) -> Result<Value, serde_json::Error> {
        match &self.params {
            Value::String(text) if !text.trim().is_empty() => serde_json::from_str(text),
            Value::String(_) | Value::Null => Ok(Value::Object(Default::default())),
            other => Ok(other.clone()),
        }
    }
}

/// Decode a playbook's step array without building the steps
pub fn parse_records(raw: &str) -> Result<Vec<StepRecord>, ServerError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// A failed playbook run and the output gathered before the failure
#[derive(Debug, Error)]
#[error("{source}")]
pub struct PlayError {
    pub output: Vec<u8>,
    #[source]
    pub source: ServerError,
}

/// Runs a step list against one client
pub struct Player<'a> {
    client: Arc<Client>,
    steps: &'a [Box<dyn Step>],
}

impl<'a> Player<'a> {
    pub fn new(client: Arc<Client>, steps: &'a [Box<dyn Step>]) -> Self {
        Self { client, steps }
    }

    /// Run every step in order.
    ///
    /// Each step's output is preceded by a `[Step <type>] ==> <label>`
    /// header. The first failing step stops the run; its error comes back
    /// with the output collected so far.
    pub async fn run(&self, sudo: bool, pty: PtySize, call: &CallContext) -> Result<Vec<u8>, PlayError> {
        let mut output = Vec::new();
        let ctx = StepContext {
            client: Arc::clone(&self.client),
            sudo,
            pty,
            call: call.clone(),
        };

        for step in self.steps {
            if let Some(reason) = call.err() {
                return Err(PlayError {
                    output,
                    source: oms_transport::TransportError::Cancelled(reason).into(),
                });
            }

            output.extend_from_slice(step_header(step.name(), step.id()).as_bytes());
            tracing::debug!(host = %self.client.address(), step = step.name(), id = step.id(), "running step");

            match step.exec(&ctx).await {
                Ok(out) => output.extend_from_slice(&out),
                Err(ServerError::Transport(e)) => {
                    output.extend_from_slice(e.output());
                    return Err(PlayError {
                        output,
                        source: ServerError::Transport(e),
                    });
                }
                Err(e) => return Err(PlayError { output, source: e }),
            }
        }
        Ok(output)
    }
}

fn step_header(name: &str, id: &str) -> String {
    format!("[Step {name:>8}] ==> {id}\n")
}
