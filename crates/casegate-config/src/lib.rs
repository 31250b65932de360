use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("failed to load config schema: {0}")]
    SchemaLoad(String),
    #[error("config failed schema validation: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub form: Form,
    pub rules: Rules,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Form {
    pub customer_field: String,
    pub contact_field: String,
    pub email_field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rules {
    pub contact_consistency: ContactConsistency,
    pub single_active_case: SingleActiveCase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactConsistency {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SingleActiveCase {
    pub enabled: bool,
    #[serde(default)]
    pub enforce_on_update: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Audit {
    pub sink: String,
    pub jsonl_path: String,
    pub include_stage_trace: bool,
    #[serde(default)]
    pub immutable_mirror_path: Option<String>,
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|err| ConfigError::Read(format!("{path}: {err}")))?;
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(&raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
    let json = serde_json::to_value(&yaml).map_err(|err| ConfigError::Parse(err.to_string()))?;
    validate_against_schema(&json)?;
    let cfg: Config =
        serde_json::from_value(json).map_err(|err| ConfigError::Parse(err.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn schema_path() -> Result<PathBuf, ConfigError> {
    let candidates = [
        PathBuf::from("config/config.schema.json"),
        PathBuf::from(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../config/config.schema.json"
        )),
    ];
    candidates
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| ConfigError::SchemaLoad("config/config.schema.json not found".to_string()))
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let path = schema_path()?;
    let raw = fs::read_to_string(&path)
        .map_err(|err| ConfigError::SchemaLoad(format!("{}: {err}", path.display())))?;
    let schema: serde_json::Value =
        serde_json::from_str(&raw).map_err(|err| ConfigError::SchemaLoad(err.to_string()))?;
    let validator = jsonschema::validator_for(&schema)
        .map_err(|err| ConfigError::SchemaLoad(err.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.audit.sink != "jsonl" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "audit.sink {} is not supported; only jsonl is",
            cfg.audit.sink
        )));
    }
    if cfg.audit.jsonl_path.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "audit.jsonl_path must not be empty".to_string(),
        ));
    }
    if let Some(mirror) = &cfg.audit.immutable_mirror_path {
        if mirror.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(
                "audit.immutable_mirror_path must not be empty when set".to_string(),
            ));
        }
        if mirror == &cfg.audit.jsonl_path {
            return Err(ConfigError::UnsupportedConfig(
                "audit.immutable_mirror_path must differ from audit.jsonl_path".to_string(),
            ));
        }
    }
    let bindings = [
        &cfg.form.customer_field,
        &cfg.form.contact_field,
        &cfg.form.email_field,
    ];
    for (i, field) in bindings.iter().enumerate() {
        if field.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(
                "form field bindings must not be empty".to_string(),
            ));
        }
        if bindings[..i].contains(field) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "form field bindings must be distinct; {field} appears twice"
            )));
        }
    }
    Ok(())
}
