//! Built-in step types

pub mod cmd;
pub mod file;
pub mod json_yaml;
pub mod multi_file;
pub mod plugin;
pub mod shell;
pub mod zip;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::registry::StepKind;
use crate::error::{Result, ServerError};

/// Type name, label, description and config accessors shared by steps
/// that keep their label in `id` and their config in `cfg`.
macro_rules! step_meta {
    ($name:expr, $desc:expr) => {
        fn name(&self) -> &str {
            $name
        }

        fn id(&self) -> &str {
            &self.id
        }

        fn set_id(&mut self, id: String) {
            self.id = id;
        }

        fn desc(&self) -> &str {
            $desc
        }

        fn config(&self) -> serde_json::Value {
            serde_json::to_value(&self.cfg).unwrap_or_default()
        }
    };
}
pub(crate) use step_meta;

/// JSON Schema of a step config
pub(crate) fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

/// Decode a step config, naming the step type on failure
pub(crate) fn decode<T: DeserializeOwned>(step: &str, config: Value) -> Result<T> {
    serde_json::from_value(config).map_err(|e| ServerError::Step(format!("{step}: {e}")))
}

/// Factories for every built-in type
pub fn builtin_kinds() -> Vec<StepKind> {
    vec![
        cmd::CmdStep::kind(),
        shell::ShellStep::kind(),
        file::FileStep::kind(),
        multi_file::MultiFileStep::kind(),
        zip::ZipStep::kind(),
        json_yaml::JsonYamlStep::kind(),
        plugin::PluginStep::generic_kind(),
    ]
}
