//! Configuration loading for the completion service and the MCP server set.
//!
//! Both files are JSON. The completion config (`AzureOpenAI.json`) carries
//! endpoint credentials and sampling parameters; the MCP config (`mcp.json`)
//! maps server names to transport descriptors. File locations default to the
//! platform config directory and can be overridden per file on the command
//! line.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const COMPLETION_CONFIG_FILE: &str = "AzureOpenAI.json";
pub const MCP_CONFIG_FILE: &str = "mcp.json";

pub const DEFAULT_SYSTEM_PROMPT: &str = "Based on the user's instructions, analyze the user's \
intent, define goals to achieve that intent, invoke and execute necessary tools until the goals \
are accomplished, and finally return the response to the user.";

const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot determine a configuration directory for this platform")]
    NoConfigDir,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} is missing required field `{field}`")]
    MissingField { path: PathBuf, field: &'static str },
    #[error(
        "no completion config at {path}; run with --reset to write a template, then fill it in"
    )]
    MissingCompletionConfig { path: PathBuf },
}

/// Resolved sampling parameters forwarded to the completion service.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    pub deployment: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    // The original config format tolerated numbers written as strings; these
    // stay as raw values and are narrowed in `sampling()`.
    #[serde(default)]
    pub max_tokens: Option<Value>,
    #[serde(default)]
    pub temperature: Option<Value>,
    #[serde(default)]
    pub top_p: Option<Value>,
    #[serde(default)]
    pub max_tool_iterations: Option<usize>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub tool_timeout_secs: Option<u64>,
}

impl CompletionConfig {
    pub fn system_prompt(&self) -> &str {
        self.system_prompt
            .as_deref()
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            max_tokens: self.max_tokens.as_ref().and_then(value_as_u32),
            temperature: self.temperature.as_ref().and_then(value_as_f32),
            top_p: self.top_p.as_ref().and_then(value_as_f32),
        }
    }

    pub fn max_tool_iterations(&self) -> usize {
        self.max_tool_iterations
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_MAX_TOOL_ITERATIONS)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(
            self.tool_timeout_secs
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS),
        )
    }
}

/// One configured tool server. `name` is the key in the config map and the
/// unique handle used everywhere else in the crate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpServerConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type", alias = "transport", default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(rename = "envFile", alias = "env_file", default)]
    pub env_file: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    ProjectDirs::from("org", "permacommons", "estafette")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or(ConfigError::NoConfigDir)
}

pub fn completion_config_path(override_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    match override_path {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(default_config_dir()?.join(COMPLETION_CONFIG_FILE)),
    }
}

pub fn mcp_config_path(override_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    match override_path {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(default_config_dir()?.join(MCP_CONFIG_FILE)),
    }
}

pub fn load_completion_config(path: &Path) -> Result<CompletionConfig, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::MissingCompletionConfig {
            path: path.to_path_buf(),
        });
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: CompletionConfig =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    for (value, field) in [
        (&config.endpoint, "endpoint"),
        (&config.api_key, "api_key"),
        (&config.api_version, "api_version"),
        (&config.deployment, "deployment"),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField {
                path: path.to_path_buf(),
                field,
            });
        }
    }
    Ok(config)
}

/// Deletes any existing completion config and writes a fresh template for
/// the user to fill in. This is the recovery path for a broken config; there
/// is deliberately no interactive credential entry.
pub fn reset_completion_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let template = serde_json::json!({
        "endpoint": "",
        "api_key": "",
        "api_version": "2024-06-01",
        "deployment": "",
        "system_prompt": DEFAULT_SYSTEM_PROMPT,
    });
    let rendered = serde_json::to_string_pretty(&template).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, rendered + "\n").map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the MCP server set. A missing file is an empty server set, not an
/// error. Accepts both historical layouts: `{"servers": {name: entry}}` and
/// a top-level `{name: entry}` map. Server order follows the (sorted) map
/// order, which fixes tool registration order downstream.
pub fn load_mcp_servers(path: &Path) -> Result<Vec<McpServerConfig>, ConfigError> {
    if !path.is_file() {
        debug!(path = %path.display(), "No MCP config file; starting without tool servers");
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let entries = match &value {
        Value::Object(map) => match map.get("servers") {
            Some(Value::Object(servers)) => servers.clone(),
            Some(other) => {
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: serde::de::Error::custom(format!(
                        "`servers` must be an object, found {}",
                        json_type_name(other)
                    )),
                })
            }
            None => map.clone(),
        },
        other => {
            return Err(ConfigError::Parse {
                path: path.to_path_buf(),
                source: serde::de::Error::custom(format!(
                    "top level must be an object, found {}",
                    json_type_name(other)
                )),
            })
        }
    };

    let mut servers = Vec::with_capacity(entries.len());
    for (name, entry) in entries {
        let mut server: McpServerConfig =
            serde_json::from_value(entry).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        server.name = name;
        server.env = Some(resolve_env(&server, path)?);
        servers.push(server);
    }
    Ok(servers)
}

/// Merges the env-file (if any) beneath explicit `env` entries: a key set in
/// both places takes the `env` value.
fn resolve_env(
    server: &McpServerConfig,
    config_path: &Path,
) -> Result<HashMap<String, String>, ConfigError> {
    let mut merged = HashMap::new();
    if let Some(env_file) = &server.env_file {
        let env_path = if env_file.is_relative() {
            config_path
                .parent()
                .map(|dir| dir.join(env_file))
                .unwrap_or_else(|| env_file.clone())
        } else {
            env_file.clone()
        };
        let raw = fs::read_to_string(&env_path).map_err(|source| ConfigError::Io {
            path: env_path.clone(),
            source,
        })?;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                merged.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    if let Some(env) = &server.env {
        for (key, value) in env {
            merged.insert(key.clone(), value.clone());
        }
    }
    Ok(merged)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn value_as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_f32(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|n| n as f32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).expect("create file");
        file.write_all(contents.as_bytes()).expect("write file");
        path
    }

    #[test]
    fn completion_config_rejects_blank_required_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(
            &dir,
            COMPLETION_CONFIG_FILE,
            r#"{"endpoint": "https://x", "api_key": " ", "api_version": "v", "deployment": "d"}"#,
        );
        let err = load_completion_config(&path).expect_err("expected missing field");
        assert!(matches!(
            err,
            ConfigError::MissingField {
                field: "api_key",
                ..
            }
        ));
    }

    #[test]
    fn missing_completion_config_points_at_reset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_completion_config(&dir.path().join("absent.json"))
            .expect_err("expected missing config");
        assert!(matches!(err, ConfigError::MissingCompletionConfig { .. }));
    }

    #[test]
    fn reset_writes_a_loadable_template_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(COMPLETION_CONFIG_FILE);
        reset_completion_config(&path).expect("reset should write template");
        // The template has blank credentials, so a load reports them missing
        // rather than failing to parse.
        let err = load_completion_config(&path).expect_err("blank template");
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn sampling_accepts_numeric_strings() {
        let config: CompletionConfig = serde_json::from_str(
            r#"{
                "endpoint": "https://x", "api_key": "k", "api_version": "v",
                "deployment": "d", "max_tokens": "800", "temperature": 0.2, "top_p": "0.9"
            }"#,
        )
        .expect("config should parse");
        let sampling = config.sampling();
        assert_eq!(sampling.max_tokens, Some(800));
        assert_eq!(sampling.temperature, Some(0.2));
        assert_eq!(sampling.top_p, Some(0.9));
    }

    #[test]
    fn unparsable_sampling_values_are_dropped() {
        let config: CompletionConfig = serde_json::from_str(
            r#"{
                "endpoint": "https://x", "api_key": "k", "api_version": "v",
                "deployment": "d", "max_tokens": "lots"
            }"#,
        )
        .expect("config should parse");
        assert_eq!(config.sampling().max_tokens, None);
    }

    #[test]
    fn mcp_config_accepts_wrapped_and_flat_layouts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let wrapped = write_file(
            &dir,
            "wrapped.json",
            r#"{"servers": {"alpha": {"type": "stdio", "command": "srv"}}}"#,
        );
        let flat = write_file(
            &dir,
            "flat.json",
            r#"{"alpha": {"type": "http", "url": "https://mcp.example.com"}}"#,
        );

        let wrapped = load_mcp_servers(&wrapped).expect("wrapped layout");
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped[0].name, "alpha");
        assert_eq!(wrapped[0].command.as_deref(), Some("srv"));

        let flat = load_mcp_servers(&flat).expect("flat layout");
        assert_eq!(flat[0].url.as_deref(), Some("https://mcp.example.com"));
    }

    #[test]
    fn missing_mcp_config_is_an_empty_server_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let servers = load_mcp_servers(&dir.path().join("absent.json")).expect("empty set");
        assert!(servers.is_empty());
    }

    #[test]
    fn env_file_entries_lose_to_explicit_env() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(&dir, "srv.env", "TOKEN=from-file\n# comment\nEXTRA=kept\n");
        let path = write_file(
            &dir,
            MCP_CONFIG_FILE,
            r#"{"servers": {"alpha": {
                "type": "stdio", "command": "srv",
                "env": {"TOKEN": "explicit"}, "envFile": "srv.env"
            }}}"#,
        );
        let servers = load_mcp_servers(&path).expect("config should load");
        let env = servers[0].env.as_ref().expect("merged env");
        assert_eq!(env.get("TOKEN").map(String::as_str), Some("explicit"));
        assert_eq!(env.get("EXTRA").map(String::as_str), Some("kept"));
    }

    #[test]
    fn server_order_is_deterministic_by_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(
            &dir,
            MCP_CONFIG_FILE,
            r#"{"zeta": {"type": "stdio", "command": "z"}, "alpha": {"type": "stdio", "command": "a"}}"#,
        );
        let servers = load_mcp_servers(&path).expect("config should load");
        let names: Vec<&str> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
