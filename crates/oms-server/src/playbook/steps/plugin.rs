//! External executables as step types
//!
//! A plugin answers `--name` with its step type, `--scheme` with the JSON
//! Schema of its params and, when run as a step, receives the target's
//! connection settings and its params:
//!
//! ```text
//! <plugin> --client '{"host":..,"port":..,"user":..}' --params '{..}'
//! ```
//!
//! Combined stdout and stderr become the step output.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;

use super::{decode, schema_of};
use crate::error::ServerError;
use crate::playbook::registry::StepKind;
use crate::playbook::{Step, StepContext};

/// Type name of the explicit-path plugin step
pub const GENERIC_NAME: &str = "plugin";

const ARG_NAME: &str = "--name";
const ARG_SCHEME: &str = "--scheme";
const ARG_DESC: &str = "--desc";
const ARG_CLIENT: &str = "--client";
const ARG_PARAMS: &str = "--params";

/// Discovery queries must answer quickly
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GenericPluginConfig {
    /// Params handed to the plugin
    #[serde(default)]
    pub data: Value,
    /// Executable to run
    pub script_path: String,
}

/// A plugin found on disk
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub name: String,
    pub desc: String,
    pub schema: Value,
    pub path: PathBuf,
}

impl DiscoveredPlugin {
    /// Factory whose steps run this plugin with their config as params
    pub fn into_kind(self) -> StepKind {
        let path = self.path.clone();
        let name = self.name.clone();
        StepKind::new(self.name, self.desc, self.schema, move |config| {
            Ok(Box::new(PluginStep::new(name.clone(), path.clone(), config)))
        })
    }
}

pub struct PluginStep {
    id: String,
    name: String,
    desc: String,
    script_path: PathBuf,
    data: Value,
}

impl PluginStep {
    pub fn new(name: String, script_path: PathBuf, data: Value) -> Self {
        let desc = format!("plugin {}", script_path.display());
        Self {
            id: String::new(),
            name,
            desc,
            script_path,
            data,
        }
    }

    /// `plugin` step type with an explicit `script_path`
    pub fn generic_kind() -> StepKind {
        StepKind::new(
            GENERIC_NAME,
            "Run an external plugin",
            schema_of::<GenericPluginConfig>(),
            |config| {
                let cfg: GenericPluginConfig = decode(GENERIC_NAME, config)?;
                Ok(Box::new(PluginStep::new(
                    GENERIC_NAME.to_string(),
                    PathBuf::from(cfg.script_path),
                    cfg.data,
                )))
            },
        )
    }
}

#[async_trait]
impl Step for PluginStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn desc(&self) -> &str {
        &self.desc
    }

    fn config(&self) -> Value {
        if self.name == GENERIC_NAME {
            json!({"data": self.data, "script_path": self.script_path})
        } else {
            self.data.clone()
        }
    }

    async fn exec(&self, ctx: &StepContext) -> Result<Vec<u8>, ServerError> {
        let conf = ctx.client.config();
        let client = json!({
            "host": conf.host,
            "port": conf.port,
            "user": conf.user,
            "password": conf.password,
            "key": String::from_utf8_lossy(&conf.key_bytes),
            "passphrase": conf.passphrase,
        });

        let script = resolve_script(&self.script_path)?;
        let mut cmd = Command::new(&script);
        cmd.arg(ARG_CLIENT)
            .arg(client.to_string())
            .arg(ARG_PARAMS)
            .arg(self.data.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }

        let output = tokio::select! {
            out = cmd.output() => out?,
            reason = ctx.call.done() => {
                return Err(oms_transport::TransportError::Cancelled(reason).into());
            }
        };

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        if output.status.success() {
            Ok(combined)
        } else {
            Err(ServerError::Plugin(format!(
                "{} exited with {}: {}",
                self.script_path.display(),
                output.status,
                String::from_utf8_lossy(&combined).trim()
            )))
        }
    }
}

/// Ask every executable file directly inside `dir` to describe itself
pub async fn discover(dir: &Path) -> Vec<DiscoveredPlugin> {
    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), "no plugin directory: {}", e);
            return found;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !is_executable(&path).await {
            continue;
        }
        match describe(&path).await {
            Ok(plugin) => found.push(plugin),
            Err(e) => tracing::warn!(plugin = %path.display(), "skipping plugin: {}", e),
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    found
}

/// Ask a plugin for its name, schema and description
pub async fn describe(path: &Path) -> Result<DiscoveredPlugin, ServerError> {
    let name = query(path, ARG_NAME).await?;
    let name = name.trim().to_string();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(ServerError::Plugin(format!("invalid step name {name:?}")));
    }

    let scheme = query(path, ARG_SCHEME).await?;
    let schema: Value = serde_json::from_str(scheme.trim())
        .map_err(|e| ServerError::Plugin(format!("{ARG_SCHEME} is not JSON: {e}")))?;

    let desc = match query(path, ARG_DESC).await {
        Ok(desc) if !desc.trim().is_empty() => desc.trim().to_string(),
        _ => format!("plugin {name}"),
    };

    Ok(DiscoveredPlugin {
        name,
        desc,
        schema,
        path: path.to_path_buf(),
    })
}

async fn query(path: &Path, arg: &str) -> Result<String, ServerError> {
    let mut cmd = Command::new(path);
    cmd.arg(arg).stdin(Stdio::null()).kill_on_drop(true);
    let output = tokio::time::timeout(QUERY_TIMEOUT, cmd.output())
        .await
        .map_err(|_| ServerError::Plugin(format!("{arg} timed out")))??;
    if !output.status.success() {
        return Err(ServerError::Plugin(format!("{arg} exited with {}", output.status)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(unix)]
async fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
async fn is_executable(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Relative script paths are taken from the process working directory
fn resolve_script(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const GOOD: &str = r#"#!/bin/sh
case "$1" in
  --name) echo restart_nginx ;;
  --scheme) echo '{"type":"object","properties":{"graceful":{"type":"boolean"}}}' ;;
  --desc) echo "Restart nginx" ;;
  *) exit 1 ;;
esac
"#;

    #[tokio::test]
    async fn test_discover_registers_valid_plugins() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "nginx.sh", GOOD);
        write_script(dir.path(), "broken.sh", "#!/bin/sh\nexit 3\n");
        std::fs::write(dir.path().join("README"), "not executable").unwrap();

        let found = discover(dir.path()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "restart_nginx");
        assert_eq!(found[0].desc, "Restart nginx");
        assert_eq!(found[0].schema["properties"]["graceful"]["type"], "boolean");

        let kind = found[0].clone().into_kind();
        let step = kind.create(json!({"graceful": true})).unwrap();
        assert_eq!(step.name(), "restart_nginx");
        assert_eq!(step.config(), json!({"graceful": true}));
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        assert!(discover(Path::new("/nonexistent/plugins")).await.is_empty());
    }

    #[test]
    fn test_resolve_script() {
        assert_eq!(resolve_script(Path::new("/opt/p.sh")).unwrap(), PathBuf::from("/opt/p.sh"));
        let relative = resolve_script(Path::new("plugins/p.sh")).unwrap();
        assert!(relative.is_absolute());
        assert_eq!(relative, std::env::current_dir().unwrap().join("plugins/p.sh"));
    }

    #[test]
    fn test_generic_config() {
        let step = PluginStep::generic_kind()
            .create(json!({"script_path": "/opt/p.sh", "data": {"x": 1}}))
            .unwrap();
        assert_eq!(step.name(), GENERIC_NAME);
        assert_eq!(step.config()["data"]["x"], 1);
        assert!(PluginStep::generic_kind().create(json!({"data": {}})).is_err());
    }
}
