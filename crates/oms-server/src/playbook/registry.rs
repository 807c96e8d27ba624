//! Step factories keyed by type name

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::steps::{self, plugin::PluginStep};
use super::{parse_records, Step};
use crate::error::{Result, ServerError};

type Factory = Arc<dyn Fn(Value) -> Result<Box<dyn Step>> + Send + Sync>;

/// Constructor and metadata for one step type
#[derive(Clone)]
pub struct StepKind {
    pub name: String,
    pub desc: String,
    pub schema: Value,
    create: Factory,
}

impl StepKind {
    pub fn new<F>(name: impl Into<String>, desc: impl Into<String>, schema: Value, create: F) -> Self
    where
        F: Fn(Value) -> Result<Box<dyn Step>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            desc: desc.into(),
            schema,
            create: Arc::new(create),
        }
    }

    /// Build a step from its config
    pub fn create(&self, config: Value) -> Result<Box<dyn Step>> {
        (self.create)(config)
    }
}

impl std::fmt::Debug for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepKind")
            .field("name", &self.name)
            .field("desc", &self.desc)
            .finish()
    }
}

/// Schema listing entry
#[derive(Debug, Clone, Serialize)]
pub struct StepSchema {
    #[serde(rename = "type")]
    pub step_type: String,
    pub desc: String,
    pub schema: Value,
}

/// Every step type this process can build
#[derive(Debug, Default)]
pub struct StepRegistry {
    kinds: BTreeMap<String, StepKind>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in step types
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in steps::builtin_kinds() {
            registry.register(kind);
        }
        registry
    }

    /// Built-ins plus every plugin found under `plugin_dir`
    pub async fn discover(plugin_dir: &Path) -> Self {
        let mut registry = Self::with_builtins();
        for plugin in steps::plugin::discover(plugin_dir).await {
            let name = plugin.name.clone();
            if registry.kinds.contains_key(&name) {
                tracing::warn!(plugin = %plugin.path.display(), "plugin name {:?} is taken, skipping", name);
                continue;
            }
            tracing::info!(plugin = %plugin.path.display(), "registered plugin step {:?}", name);
            registry.register(plugin.into_kind());
        }
        registry
    }

    /// Add or replace a step type
    pub fn register(&mut self, kind: StepKind) {
        self.kinds.insert(kind.name.clone(), kind);
    }

    pub fn get(&self, name: &str) -> Option<&StepKind> {
        self.kinds.get(name)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Build one step and label it
    pub fn new_step(&self, step_type: &str, id: &str, config: Value) -> Result<Box<dyn Step>> {
        let kind = self
            .kinds
            .get(step_type)
            .ok_or_else(|| ServerError::Step(format!("unsupported step type {step_type:?}")))?;
        let mut step = kind.create(config)?;
        step.set_id(id.to_string());
        Ok(step)
    }

    /// Decode and build a playbook's steps.
    ///
    /// Records that cannot be built are logged and skipped; a malformed
    /// array is an error.
    pub fn parse_steps(&self, raw: &str) -> Result<Vec<Box<dyn Step>>> {
        let mut built = Vec::new();
        for record in parse_records(raw)? {
            let step = record
                .params_value()
                .map_err(ServerError::from)
                .and_then(|params| self.new_step(&record.step_type, &record.name, params));
            match step {
                Ok(step) => built.push(step),
                Err(e) => tracing::error!("Error when new step with config, err: {}", e),
            }
        }
        Ok(built)
    }

    /// Schemas of every registered type, sorted by name
    pub fn schemas(&self) -> Vec<StepSchema> {
        self.kinds
            .values()
            .map(|kind| StepSchema {
                step_type: kind.name.clone(),
                desc: kind.desc.clone(),
                schema: kind.schema.clone(),
            })
            .collect()
    }

    /// Explicit-path plugin step, independent of discovery
    pub fn plugin_step(script_path: &str, data: Value) -> Box<dyn Step> {
        Box::new(PluginStep::new(
            steps::plugin::GENERIC_NAME.to_string(),
            script_path.into(),
            data,
        ))
    }
}
