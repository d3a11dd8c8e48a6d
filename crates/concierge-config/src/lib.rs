use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub slack: Slack,
    pub generation: Generation,
    #[serde(default)]
    pub directory: Option<Directory>,
    pub store: Store,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slack {
    #[serde(default = "default_slack_api_base")]
    pub api_base: String,
    pub bot_token: String,
    /// Resolved via auth.test at startup when absent.
    #[serde(default)]
    pub bot_user_id: Option<String>,
    #[serde(default = "default_slack_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    #[serde(default = "default_generation_api_base")]
    pub api_base: String,
    pub api_key: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_generation_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
    #[serde(default = "default_directory_api_base")]
    pub api_base: String,
    pub sheet_id: String,
    pub api_key: String,
    #[serde(default = "default_directory_range")]
    pub range: String,
    #[serde(default = "default_slack_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_gate_capacity")]
    pub gate_capacity: usize,
    #[serde(default = "default_name_cache_capacity")]
    pub name_cache_capacity: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            dedup_capacity: default_dedup_capacity(),
            gate_capacity: default_gate_capacity(),
            name_cache_capacity: default_name_cache_capacity(),
        }
    }
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".to_string()
}

fn default_generation_api_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_generation_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_directory_api_base() -> String {
    "https://sheets.googleapis.com".to_string()
}

fn default_directory_range() -> String {
    "Sheet1".to_string()
}

fn default_slack_timeout_ms() -> u64 {
    10_000
}

fn default_generation_timeout_ms() -> u64 {
    30_000
}

fn default_dedup_capacity() -> usize {
    4096
}

fn default_gate_capacity() -> usize {
    1024
}

fn default_name_cache_capacity() -> usize {
    512
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.slack.bot_token.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "slack.bot_token must be non-empty".to_string(),
        ));
    }
    if cfg.generation.api_key.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "generation.api_key must be non-empty".to_string(),
        ));
    }
    if let Some(directory) = &cfg.directory {
        if directory.sheet_id.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(
                "directory.sheet_id must be non-empty when directory is configured".to_string(),
            ));
        }
    }
    if cfg.limits.dedup_capacity == 0
        || cfg.limits.gate_capacity == 0
        || cfg.limits.name_cache_capacity == 0
    {
        return Err(ConfigError::UnsupportedConfig(
            "limits capacities must be >= 1".to_string(),
        ));
    }
    Ok(())
}
