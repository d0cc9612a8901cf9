use crate::error::{Result, ReviewError};
use crate::review::consensus::{DEFAULT_DEBOUNCE, DEFAULT_DEDUP_LINE_DISTANCE, EngineSettings};
use crate::types::{ProviderId, ReviewConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;
use tracing::{debug, trace};

/// Written by `concord init`
pub const DEFAULT_CONFIG: &str = r#"# concord configuration

[review]
# quick | balanced | thorough
strictness = "balanced"
# "all", or any of "security", "performance", "style"
focus_areas = ["all"]
# Providers taking part in a review; each must also have its API key set
enabled_providers = ["openai"]

[engine]
# Quiet period before pending suggestions are clustered
debounce_ms = 500
# Max line distance for a suggestion to duplicate an existing comment
dedup_line_distance = 5

[summary]
# Provider asked for the shared change summary (falls back to the first active one)
preferred_provider = "openai"

[[providers]]
id = "openai"
base_url = "https://api.openai.com/v1"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
# Extra HTTP headers
headers = {}
# Extra JSON merged into the request body
body = {}
"#;

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_dedup_line_distance")]
    pub dedup_line_distance: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            dedup_line_distance: default_dedup_line_distance(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE.as_millis() as u64
}

fn default_dedup_line_distance() -> u32 {
    DEFAULT_DEDUP_LINE_DISTANCE
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            debounce: Duration::from_millis(self.debounce_ms),
            dedup_line_distance: self.dedup_line_distance,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct SummaryConfig {
    #[serde(default)]
    pub preferred_provider: Option<ProviderId>,
}

/// One OpenAI-compatible backend
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl Config {
    /// Load `path` and apply dot-notation overrides (`engine.debounce_ms=250`)
    pub fn load(path: &str, overrides: &[String]) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        debug!("Loaded config from {}", path);
        Self::parse(&content, overrides)
    }

    pub fn parse(content: &str, overrides: &[String]) -> Result<Self> {
        let mut value = toml::Value::Table(toml::from_str::<toml::Table>(content)?);
        for entry in overrides {
            apply_override(&mut value, entry)?;
        }
        let config: Config = value.try_into()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(ReviewError::Config("provider id must not be empty".into()));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ReviewError::Config(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
        }
        Ok(())
    }
}

/// Set `key.path=value` in a TOML tree, creating intermediate tables
///
/// The value is parsed as a TOML value (`250`, `true`, `["a", "b"]`) and falls
/// back to a plain string.
fn apply_override(root: &mut toml::Value, entry: &str) -> Result<()> {
    let (path, raw) = entry
        .split_once('=')
        .ok_or_else(|| ReviewError::Config(format!("override '{}' is not key=value", entry)))?;
    let keys: Vec<&str> = path.trim().split('.').collect();
    if keys.iter().any(|k| k.is_empty()) {
        return Err(ReviewError::Config(format!("invalid override key '{}'", path)));
    }

    let raw = raw.trim();
    let parsed = toml::from_str::<toml::Table>(&format!("v = {}", raw))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()));
    trace!("Override {} = {:?}", path, parsed);

    let mut current = root;
    for key in &keys[..keys.len() - 1] {
        let table = current
            .as_table_mut()
            .ok_or_else(|| ReviewError::Config(format!("'{}' is not a table", path)))?;
        current = table
            .entry(key.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    }
    let table = current
        .as_table_mut()
        .ok_or_else(|| ReviewError::Config(format!("'{}' is not a table", path)))?;
    table.insert(keys[keys.len() - 1].to_string(), parsed);
    Ok(())
}
