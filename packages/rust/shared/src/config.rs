//! Application configuration for knowcrawl.
//!
//! User config lives at `~/.knowcrawl/knowcrawl.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KnowCrawlError, Result};
use crate::presets;
use crate::types::PromptStep;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "knowcrawl.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".knowcrawl";

// ---------------------------------------------------------------------------
// Config structs (matching knowcrawl.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// LLM endpoint settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Content retrieval settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Schema validation settings.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Record assembly settings.
    #[serde(default)]
    pub record: RecordConfig,

    /// Optional final review pass.
    #[serde(default)]
    pub review: ReviewConfig,

    /// Ordered prompt steps.
    #[serde(default = "presets::water_conservancy_steps")]
    pub steps: Vec<PromptStep>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            validation: ValidationConfig::default(),
            record: RecordConfig::default(),
            review: ReviewConfig::default(),
            steps: presets::water_conservancy_steps(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory receiving one JSON file per persisted entity.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Process at most this many entities per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Source file name recorded in each record's `source_file` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            limit: None,
            source_file: None,
        }
    }
}

fn default_output_dir() -> String {
    "output".into()
}

/// `[llm]` section (OpenAI-compatible chat completions endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier sent with every request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL; `/chat/completions` is appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Sampling temperature; provider default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_base_url(),
            timeout_secs: default_llm_timeout(),
            temperature: None,
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_llm_timeout() -> u64 {
    120
}

/// `[retrieval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Search endpoint with a `{query}` placeholder (URL-encoded on use).
    #[serde(default = "default_search_url")]
    pub search_url: String,

    /// CSS selector picking result snippets out of the search page; empty
    /// converts the whole page.
    #[serde(default = "default_result_selector")]
    pub result_selector: String,

    /// Fixed query templates rendered per entity (`{entity_name}`, `{entity_id}`).
    #[serde(default = "presets::default_queries")]
    pub queries: Vec<String>,

    /// Ask the LLM for additional queries before retrieval.
    #[serde(default = "default_true")]
    pub augment: bool,

    /// Prompt used when `augment` is set; must yield a JSON array of strings.
    #[serde(default = "default_augment_prompt")]
    pub augment_prompt: String,

    /// Character budget for the aggregated retrieval text.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Per-request timeout in seconds.
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_url: default_search_url(),
            result_selector: default_result_selector(),
            queries: presets::default_queries(),
            augment: true,
            augment_prompt: default_augment_prompt(),
            max_chars: default_max_chars(),
            timeout_secs: default_retrieval_timeout(),
        }
    }
}

fn default_search_url() -> String {
    "https://html.duckduckgo.com/html/?q={query}".into()
}
fn default_result_selector() -> String {
    ".result__snippet".into()
}
fn default_true() -> bool {
    true
}
fn default_augment_prompt() -> String {
    presets::QUERY_AUGMENTATION_PROMPT.into()
}
fn default_max_chars() -> usize {
    24_000
}
fn default_retrieval_timeout() -> u64 {
    30
}

/// What the validator does with record fields the schema does not declare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraFieldPolicy {
    /// Accept silently.
    #[default]
    Ignore,
    /// Emit an `unexpected field` violation.
    Report,
}

/// `[validation]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub extra_fields: ExtraFieldPolicy,

    /// JSON schema document replacing the built-in master schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_path: Option<String>,
}

/// `[record]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Seed `entity_id`, `label`, `aliases` and `source_file` before step output.
    #[serde(default = "default_true")]
    pub identity_fields: bool,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            identity_fields: true,
        }
    }
}

/// `[review]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Review template; `{record_json}` receives the assembled record.
    #[serde(default = "default_review_template")]
    pub template: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            template: default_review_template(),
        }
    }
}

fn default_review_template() -> String {
    presets::FINAL_REVIEW_PROMPT.into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.knowcrawl/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| KnowCrawlError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.knowcrawl/knowcrawl.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| KnowCrawlError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        KnowCrawlError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| KnowCrawlError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| KnowCrawlError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| KnowCrawlError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the LLM API key from the env var named in config.
pub fn resolve_api_key(config: &LlmConfig) -> Result<String> {
    let var_name = &config.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(KnowCrawlError::config(format!(
            "LLM API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResponseFormat;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("output_dir"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("[[steps]]"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.llm.api_key_env, "OPENROUTER_API_KEY");
        assert_eq!(parsed.steps.len(), 3);
        assert_eq!(parsed.steps[0].template, config.steps[0].template);
        assert_eq!(parsed.validation.extra_fields, ExtraFieldPolicy::Ignore);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: AppConfig = toml::from_str("").expect("parse empty");
        assert_eq!(config.defaults.output_dir, "output");
        assert!(config.defaults.limit.is_none());
        assert!(config.retrieval.augment);
        assert!(config.record.identity_fields);
        assert!(!config.review.enabled);
        assert_eq!(config.steps.len(), 3);
    }

    #[test]
    fn config_with_custom_steps() {
        let toml_str = r#"
[defaults]
output_dir = "/tmp/records"
limit = 2

[validation]
extra_fields = "report"

[[steps]]
name = "describe"
template = "Describe {entity_name}"
target = "description"

[[steps]]
name = "relate"
template = "Relate {entity_name} given {describe}"
format = "json"
target = "relationships"
append = true
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.limit, Some(2));
        assert_eq!(config.validation.extra_fields, ExtraFieldPolicy::Report);
        assert_eq!(config.steps.len(), 2);
        assert_eq!(config.steps[1].format, ResponseFormat::Json);
        assert!(config.steps[1].append);
    }

    #[test]
    fn api_key_resolution() {
        let config = LlmConfig {
            // Unique name so other tests' environment cannot interfere.
            api_key_env: "KC_TEST_NONEXISTENT_KEY_12345".into(),
            ..LlmConfig::default()
        };
        let result = resolve_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
