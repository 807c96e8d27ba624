//! `json_yaml`: replace one node in a remote JSON or YAML document
//!
//! Paths use the `$.key.list[0].item` form. The document is re-rendered
//! after the edit, so YAML comments and formatting are not preserved.

use async_trait::async_trait;
use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{decode, schema_of, step_meta};
use crate::error::ServerError;
use crate::playbook::registry::StepKind;
use crate::playbook::{Step, StepContext};

pub const NAME: &str = "json_yaml";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JsonYamlConfig {
    /// Node path, for example `$.path1.path2[0].item`
    pub path: String,
    /// New node value; text is parsed as YAML, a list is written as is
    #[schemars(schema_with = "string_or_list")]
    pub value: JsonValue,
    /// Remote YAML or JSON file
    pub remote: String,
}

fn string_or_list(_: &mut SchemaGenerator) -> Schema {
    schemars::json_schema!({
        "oneOf": [
            {"type": "string", "title": "text"},
            {"type": "array", "title": "list", "items": {"type": "string"}}
        ]
    })
}

/// One hop of a node path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Parse `$.a.b[0].c` into segments
pub fn parse_path(path: &str) -> Result<Vec<Segment>, String> {
    let rest = path
        .strip_prefix('$')
        .ok_or_else(|| format!("path must start with '$': {path:?}"))?;

    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut key = String::new();
                while let Some(&next) = chars.peek() {
                    if next == '.' || next == '[' {
                        break;
                    }
                    key.push(next);
                    chars.next();
                }
                if key.is_empty() {
                    return Err(format!("empty key in path {path:?}"));
                }
                segments.push(Segment::Key(key));
            }
            '[' => {
                let mut digits = String::new();
                for next in chars.by_ref() {
                    if next == ']' {
                        break;
                    }
                    digits.push(next);
                }
                let index = digits
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad index {digits:?} in path {path:?}"))?;
                segments.push(Segment::Index(index));
            }
            other => return Err(format!("unexpected {other:?} in path {path:?}")),
        }
    }
    if segments.is_empty() {
        return Err(format!("path selects the whole document: {path:?}"));
    }
    Ok(segments)
}

/// Replace the node at `path`; the node must already exist
pub fn replace_node(doc: &mut YamlValue, path: &[Segment], value: YamlValue) -> Result<(), String> {
    let mut node = doc;
    for segment in path {
        node = match (segment, node) {
            (Segment::Key(key), YamlValue::Mapping(map)) => map
                .get_mut(key.as_str())
                .ok_or_else(|| format!("node {key:?} not found"))?,
            (Segment::Index(i), YamlValue::Sequence(seq)) => {
                let len = seq.len();
                seq.get_mut(*i)
                    .ok_or_else(|| format!("index {i} out of range ({len} items)"))?
            }
            (segment, _) => return Err(format!("cannot descend into {segment:?}")),
        };
    }
    *node = value;
    Ok(())
}

/// Output format, picked by the remote file's extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Json,
    Yaml,
}

impl DocFormat {
    pub fn from_path(path: &str) -> Self {
        if path.to_ascii_lowercase().ends_with(".json") {
            Self::Json
        } else {
            Self::Yaml
        }
    }

    fn parse(self, text: &str) -> Result<YamlValue, String> {
        match self {
            Self::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
        }
    }

    fn render(self, doc: &YamlValue) -> Result<String, String> {
        match self {
            Self::Json => serde_json::to_string_pretty(doc)
                .map(|mut s| {
                    s.push('\n');
                    s
                })
                .map_err(|e| e.to_string()),
            Self::Yaml => serde_yaml::to_string(doc).map_err(|e| e.to_string()),
        }
    }
}

/// Replacement node for a configured value
pub fn replacement(value: &JsonValue) -> Result<YamlValue, String> {
    match value {
        JsonValue::String(text) => serde_yaml::from_str(text).map_err(|e| e.to_string()),
        other => serde_yaml::to_value(other).map_err(|e| e.to_string()),
    }
}

/// Apply one edit to a document's text
pub fn edit_document(text: &str, format: DocFormat, path: &str, value: &JsonValue) -> Result<String, String> {
    let segments = parse_path(path)?;
    let mut doc = format.parse(text)?;
    replace_node(&mut doc, &segments, replacement(value)?)?;
    format.render(&doc)
}

pub struct JsonYamlStep {
    id: String,
    cfg: JsonYamlConfig,
}

impl JsonYamlStep {
    pub fn kind() -> StepKind {
        StepKind::new(
            NAME,
            "Edit a JSON or YAML file",
            schema_of::<JsonYamlConfig>(),
            |config| {
                let cfg: JsonYamlConfig = decode(NAME, config)?;
                parse_path(&cfg.path).map_err(|e| ServerError::Step(format!("{NAME}: {e}")))?;
                Ok(Box::new(JsonYamlStep {
                    id: String::new(),
                    cfg,
                }))
            },
        )
    }
}

#[async_trait]
impl Step for JsonYamlStep {
    step_meta!(NAME, "Edit a JSON or YAML file");

    async fn exec(&self, ctx: &StepContext) -> Result<Vec<u8>, ServerError> {
        ctx.client.sftp().await?;
        if !ctx.client.path_exists(&self.cfg.remote).await {
            return Err(ServerError::Step(format!(
                "remote does not exist: {}",
                self.cfg.remote
            )));
        }

        let mut text = String::new();
        ctx.client
            .open(&self.cfg.remote)
            .await?
            .read_to_string(&mut text)
            .await?;

        let format = DocFormat::from_path(&self.cfg.remote);
        let edited = edit_document(&text, format, &self.cfg.path, &self.cfg.value)
            .map_err(|e| ServerError::Step(format!("{}: {e}", self.cfg.remote)))?;

        let mut file = ctx.client.create(&self.cfg.remote).await?;
        file.write_all(edited.as_bytes()).await?;
        file.shutdown().await?;

        Ok(format!("replace success, remote path: {}\r\n", self.cfg.remote).into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("$.path1.path2[0].item").unwrap(),
            vec![
                Segment::Key("path1".into()),
                Segment::Key("path2".into()),
                Segment::Index(0),
                Segment::Key("item".into()),
            ]
        );
        assert!(parse_path("path1").is_err());
        assert!(parse_path("$").is_err());
        assert!(parse_path("$..a").is_err());
        assert!(parse_path("$.a[x]").is_err());
    }

    #[test]
    fn test_edit_yaml_scalar_from_text() {
        let text = "server:\n  port: 80\n  hosts:\n    - a\n    - b\n";
        let out = edit_document(text, DocFormat::Yaml, "$.server.port", &json!("8080")).unwrap();
        let doc: YamlValue = serde_yaml::from_str(&out).unwrap();
        assert_eq!(doc["server"]["port"], YamlValue::from(8080));
        assert_eq!(doc["server"]["hosts"][1], YamlValue::from("b"));
    }

    #[test]
    fn test_edit_json_with_list() {
        let text = r#"{"upstreams": [{"name": "api", "servers": ["10.0.0.1"]}]}"#;
        let out = edit_document(
            text,
            DocFormat::Json,
            "$.upstreams[0].servers",
            &json!(["10.0.0.2", "10.0.0.3"]),
        )
        .unwrap();
        let doc: JsonValue = serde_json::from_str(&out).unwrap();
        assert_eq!(doc["upstreams"][0]["servers"], json!(["10.0.0.2", "10.0.0.3"]));
        assert_eq!(doc["upstreams"][0]["name"], "api");
    }

    #[test]
    fn test_missing_node_is_an_error() {
        let err = edit_document("a: 1\n", DocFormat::Yaml, "$.b", &json!("2")).unwrap_err();
        assert!(err.contains("not found"));
        let err = edit_document("a: [1]\n", DocFormat::Yaml, "$.a[3]", &json!("2")).unwrap_err();
        assert!(err.contains("out of range"));
    }

    #[test]
    fn test_format_by_extension() {
        assert_eq!(DocFormat::from_path("/etc/app/config.JSON"), DocFormat::Json);
        assert_eq!(DocFormat::from_path("/etc/app/config.yml"), DocFormat::Yaml);
    }

    #[test]
    fn test_kind_rejects_bad_path() {
        let kind = JsonYamlStep::kind();
        assert!(kind
            .create(json!({"path": "a.b", "value": "1", "remote": "/x.yaml"}))
            .is_err());
        assert!(kind
            .create(json!({"path": "$.a.b", "value": "1", "remote": "/x.yaml"}))
            .is_ok());
        assert!(kind.schema.to_string().contains("oneOf"));
    }
}
