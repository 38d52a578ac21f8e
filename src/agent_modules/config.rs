use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fs, path::Path, path::PathBuf};
use thiserror::Error;
use tracing::{error, info};

/// Heartbeat offsets are drawn from `[0, MAX_HEARTBEAT_OFFSET_SECS)`.
pub const MAX_HEARTBEAT_OFFSET_SECS: u64 = 40;
pub const MIN_CHECK_INTERVAL_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to write config file '{path}': {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("Agent credentials are missing or still set to placeholder values")]
    MissingCredentials,
    #[error("Agent is disabled in its configuration")]
    Disabled,
}

fn default_enabled() -> bool {
    true
}

fn default_api_url() -> String {
    "https://api.probe-agent.invalid/".to_string()
}

fn default_heartbeat_path() -> String {
    "agent/heartbeat".to_string()
}

fn default_results_path() -> String {
    "agent/results".to_string()
}

fn default_check_interval() -> u64 {
    60
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub check_id: String,
    pub check_token: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_heartbeat_path")]
    pub heartbeat_path: String,
    #[serde(default = "default_results_path")]
    pub results_path: String,
    /// Second of the minute at which the heartbeat fires. Assigned randomly on
    /// first load so a fleet of agents does not hit the control plane at once.
    #[serde(default)]
    pub heartbeat_offset_secs: Option<u64>,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Opaque settings pushed by the control plane.
    #[serde(default)]
    pub settings: toml::Table,
    #[serde(skip)]
    pub config_path: String,
}

impl AgentConfig {
    pub fn heartbeat_offset_secs(&self) -> u64 {
        self.heartbeat_offset_secs
            .unwrap_or(0)
            .min(MAX_HEARTBEAT_OFFSET_SECS - 1)
    }

    pub fn check_interval_secs(&self) -> u64 {
        self.check_interval.max(MIN_CHECK_INTERVAL_SECS)
    }

    pub fn heartbeat_url(&self) -> String {
        join_url(&self.api_url, &self.heartbeat_path)
    }

    pub fn results_url(&self) -> String {
        join_url(&self.api_url, &self.results_path)
    }

    pub fn checklist_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("checklist.json")
    }

    /// Rejects configurations the engine must never start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if is_placeholder(&self.check_id) || is_placeholder(&self.check_token) {
            return Err(ConfigError::MissingCredentials);
        }
        if !self.enabled {
            return Err(ConfigError::Disabled);
        }
        Ok(())
    }

    /// Applies a control-plane config delta. `check_interval`,
    /// `heartbeat_offset_secs` and `enabled` are agent-local; every other key
    /// is kept verbatim in `settings`. Returns whether anything changed.
    pub fn apply_delta(&mut self, delta: &Map<String, Value>) -> bool {
        let before = self.clone();
        for (key, value) in delta {
            match key.as_str() {
                "check_interval" => {
                    if let Some(secs) = value_as_u64(value) {
                        self.check_interval = secs.max(MIN_CHECK_INTERVAL_SECS);
                    }
                }
                "heartbeat_offset_secs" => {
                    if let Some(secs) = value_as_u64(value) {
                        self.heartbeat_offset_secs = Some(secs % MAX_HEARTBEAT_OFFSET_SECS);
                    }
                }
                "enabled" => {
                    if let Some(enabled) = value.as_bool() {
                        self.enabled = enabled;
                    }
                }
                _ => match json_to_toml(value) {
                    Some(converted) => {
                        self.settings.insert(key.clone(), converted);
                    }
                    None => {
                        self.settings.remove(key);
                    }
                },
            }
        }
        *self != before
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    let upper = trimmed.to_ascii_uppercase();
    trimmed.is_empty() || upper.starts_with("REPLACE") || upper.starts_with("YOUR_")
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// TOML has no null; a null in the delta removes the setting.
fn json_to_toml(value: &Value) -> Option<toml::Value> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(toml::Value::Boolean(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(toml::Value::Integer)
            .or_else(|| n.as_f64().map(toml::Value::Float)),
        Value::String(s) => Some(toml::Value::String(s.clone())),
        Value::Array(items) => Some(toml::Value::Array(
            items.iter().filter_map(json_to_toml).collect(),
        )),
        Value::Object(map) => Some(toml::Value::Table(
            map.iter()
                .filter_map(|(k, v)| json_to_toml(v).map(|v| (k.clone(), v)))
                .collect(),
        )),
    }
}

/// Loads and validates the agent configuration. A missing heartbeat offset is
/// assigned here and written back so it stays stable across restarts.
pub fn load_agent_config(config_path_str: &str) -> Result<AgentConfig, ConfigError> {
    let config_path = Path::new(config_path_str);
    // Attempt to get absolute path for logging, but don't fail if it can't be canonicalized
    let absolute_path_display = config_path
        .canonicalize()
        .unwrap_or_else(|_| config_path.to_path_buf());
    info!(path = ?absolute_path_display, "Attempting to load config.");

    let config_str = fs::read_to_string(config_path).map_err(|e| {
        error!(path = %config_path_str, error = %e, "Failed to read agent config file.");
        ConfigError::Read {
            path: config_path_str.to_string(),
            source: e,
        }
    })?;

    let mut config: AgentConfig = toml::from_str(&config_str).map_err(|e| {
        error!(path = %config_path_str, error = %e, "Failed to parse agent config file.");
        ConfigError::Parse {
            path: config_path_str.to_string(),
            source: e,
        }
    })?;
    config.config_path = config_path_str.to_string();
    config.validate()?;

    if config.heartbeat_offset_secs.is_none() {
        let offset = rand::rng().random_range(0..MAX_HEARTBEAT_OFFSET_SECS);
        config.heartbeat_offset_secs = Some(offset);
        info!(offset_secs = offset, "Assigned heartbeat offset.");
        save_agent_config(&config, config_path_str)?;
    }

    info!(
        check_id = %config.check_id,
        api_url = %config.api_url,
        check_interval = config.check_interval_secs(),
        "Loaded config successfully."
    );
    Ok(config)
}

/// Merges the config into the existing file, preserving keys the agent does
/// not know about.
pub fn save_agent_config(config: &AgentConfig, config_path_str: &str) -> Result<(), ConfigError> {
    let config_path = Path::new(config_path_str);

    let existing_content = fs::read_to_string(config_path).unwrap_or_default();
    let mut existing_toml: toml::Table = toml::from_str(&existing_content).unwrap_or_default();

    if let toml::Value::Table(new_table) = toml::Value::try_from(config)? {
        for (key, value) in new_table {
            existing_toml.insert(key, value);
        }
    }

    let updated_content = toml::to_string_pretty(&existing_toml)?;
    fs::write(config_path, updated_content).map_err(|e| ConfigError::Write {
        path: config_path_str.to_string(),
        source: e,
    })?;

    info!(path = ?config_path, "Successfully merged and saved configuration.");
    Ok(())
}
