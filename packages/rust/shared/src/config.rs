//! Application configuration for the helpdesk pipeline.
//!
//! User config lives at `~/.helpdesk/helpdesk.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{HelpdeskError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "helpdesk.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".helpdesk";

// ---------------------------------------------------------------------------
// Config structs (matching helpdesk.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Pipeline behaviour.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Retrieval result cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Checkpoint and cache persistence.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Ollama collaborator settings.
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// Local document corpus.
    #[serde(default)]
    pub retriever: RetrieverConfig,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Checkpoint namespace used when the caller does not supply one.
    #[serde(default = "default_checkpoint_ns")]
    pub checkpoint_ns: String,

    /// Confidence below which the reflection retry fires.
    #[serde(default = "default_reflection_threshold")]
    pub reflection_threshold: f64,

    /// Retrieval breadth on the primary pass.
    #[serde(default = "default_k")]
    pub default_k: usize,

    /// Retrieval breadth on the reflection pass.
    #[serde(default = "default_reflection_k")]
    pub reflection_k: usize,

    /// Maximum documents handed to the generator.
    #[serde(default = "default_max_context_docs")]
    pub max_context_docs: usize,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            checkpoint_ns: default_checkpoint_ns(),
            reflection_threshold: default_reflection_threshold(),
            default_k: default_k(),
            reflection_k: default_reflection_k(),
            max_context_docs: default_max_context_docs(),
        }
    }
}

fn default_checkpoint_ns() -> String {
    "helpdesk_ns".into()
}
fn default_reflection_threshold() -> f64 {
    0.8
}
fn default_k() -> usize {
    10
}
fn default_reflection_k() -> usize {
    20
}
fn default_max_context_docs() -> usize {
    3
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether the primary retrieval pass consults the cache.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entry lifetime in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Prefix prepended to every query fingerprint.
    #[serde(default = "default_cache_prefix")]
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl_secs(),
            key_prefix: default_cache_prefix(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_cache_prefix() -> String {
    "helpdesk:cache:".into()
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// libSQL database file (`~` is expanded).
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Key prefix for the in-memory ordered store.
    #[serde(default = "default_checkpoint_prefix")]
    pub checkpoint_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            checkpoint_prefix: default_checkpoint_prefix(),
        }
    }
}

fn default_db_path() -> String {
    "~/.helpdesk/helpdesk.db".into()
}
fn default_checkpoint_prefix() -> String {
    "helpdesk:checkpoint:".into()
}

/// `[ollama]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL of the Ollama server.
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    /// Model used for classification, generation and evaluation.
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature.
    #[serde(default)]
    pub temperature: f64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            model: default_model(),
            temperature: 0.0,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".into()
}
fn default_model() -> String {
    "qwen2.5:latest".into()
}
fn default_timeout_secs() -> u64 {
    120
}

/// `[retriever]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieverConfig {
    /// JSON file holding the document corpus (`~` is expanded).
    #[serde(default = "default_corpus_path")]
    pub corpus_path: String,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            corpus_path: default_corpus_path(),
        }
    }
}

fn default_corpus_path() -> String {
    "~/.helpdesk/corpus.json".into()
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Namespace used when the caller does not supply one.
    pub checkpoint_ns: String,
    /// Reflection fires when confidence is strictly below this value.
    pub reflection_threshold: f64,
    /// Primary retrieval breadth.
    pub default_k: usize,
    /// Reflection retrieval breadth.
    pub reflection_k: usize,
    /// Generator context cap.
    pub max_context_docs: usize,
    /// Whether the primary retrieval pass uses the result cache.
    pub cache_enabled: bool,
    /// Cache entry lifetime.
    pub cache_ttl: std::time::Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            checkpoint_ns: config.pipeline.checkpoint_ns.clone(),
            reflection_threshold: config.pipeline.reflection_threshold,
            default_k: config.pipeline.default_k,
            reflection_k: config.pipeline.reflection_k,
            max_context_docs: config.pipeline.max_context_docs,
            cache_enabled: config.cache.enabled,
            cache_ttl: std::time::Duration::from_secs(config.cache.ttl_secs),
        }
    }
}

impl PipelineConfig {
    /// Reject settings that would break the retry or context invariants.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.reflection_threshold) {
            return Err(HelpdeskError::config(format!(
                "reflection_threshold must be within [0, 1], got {}",
                self.reflection_threshold
            )));
        }
        if self.default_k == 0 {
            return Err(HelpdeskError::config("default_k must be at least 1"));
        }
        if self.reflection_k <= self.default_k {
            return Err(HelpdeskError::config(format!(
                "reflection_k ({}) must be wider than default_k ({})",
                self.reflection_k, self.default_k
            )));
        }
        if self.max_context_docs == 0 {
            return Err(HelpdeskError::config("max_context_docs must be at least 1"));
        }
        Ok(())
    }
}

impl OllamaConfig {
    /// Parse and validate the configured base URL.
    pub fn base_url(&self) -> Result<Url> {
        Url::parse(&self.base_url).map_err(|e| {
            HelpdeskError::config(format!("invalid ollama base_url '{}': {e}", self.base_url))
        })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.helpdesk/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| HelpdeskError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.helpdesk/helpdesk.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| HelpdeskError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| HelpdeskError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| HelpdeskError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| HelpdeskError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HelpdeskError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| HelpdeskError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("reflection_threshold"));
        assert!(toml_str.contains("helpdesk_ns"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.pipeline.default_k, 10);
        assert_eq!(parsed.pipeline.reflection_k, 20);
        assert_eq!(parsed.cache.ttl_secs, 3600);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[pipeline]
reflection_threshold = 0.7

[ollama]
model = "llama3.1:8b"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.reflection_threshold, 0.7);
        assert_eq!(config.pipeline.max_context_docs, 3);
        assert_eq!(config.ollama.model, "llama3.1:8b");
        assert_eq!(config.ollama.base_url, "http://localhost:11434");
        assert!(config.cache.enabled);
    }

    #[test]
    fn pipeline_config_from_app_config() {
        let app = AppConfig::default();
        let pipeline = PipelineConfig::from(&app);
        assert_eq!(pipeline.reflection_threshold, 0.8);
        assert_eq!(pipeline.default_k, 10);
        assert_eq!(pipeline.reflection_k, 20);
        assert_eq!(pipeline.max_context_docs, 3);
        assert_eq!(pipeline.cache_ttl, std::time::Duration::from_secs(3600));
        pipeline.validate().expect("defaults are valid");
    }

    #[test]
    fn validation_rejects_narrow_reflection() {
        let pipeline = PipelineConfig {
            reflection_k: 10,
            ..PipelineConfig::default()
        };
        let err = pipeline.validate().unwrap_err();
        assert!(err.to_string().contains("reflection_k"));

        let pipeline = PipelineConfig {
            reflection_threshold: 1.5,
            ..PipelineConfig::default()
        };
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn ollama_url_validation() {
        let mut config = OllamaConfig::default();
        assert!(config.base_url().is_ok());
        config.base_url = "not a url".into();
        assert!(config.base_url().unwrap_err().to_string().contains("invalid ollama"));
    }

    #[test]
    fn expand_home_leaves_absolute_paths() {
        let path = expand_home("/var/lib/helpdesk.db").unwrap();
        assert_eq!(path, PathBuf::from("/var/lib/helpdesk.db"));
    }
}
