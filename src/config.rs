/// Configuration for chapterrag.
///
/// A JSON file whose every field has a default, so a partial file (or no
/// file at all) is a valid configuration.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

// ── Default value functions ──────────────────────────────────────────

fn default_chapters_dir() -> PathBuf {
    PathBuf::from("data/chapters")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/vectors.db")
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_top_k() -> usize {
    3
}

fn default_max_tool_iterations() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_embed_batch_size() -> usize {
    10
}

fn default_backend() -> EmbedderBackend {
    EmbedderBackend::Onnx
}

fn default_model_name() -> String {
    "all-MiniLM-L6-v2".to_string()
}

fn default_model_dir() -> PathBuf {
    crate::embedder::download::default_model_dir()
}

fn default_dimensions() -> usize {
    384
}

fn default_api_url() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

fn default_chat_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_chapters_dir")]
    pub chapters_dir: PathBuf,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Listen address; `HOST`/`PORT` override it at startup.
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,

    /// Let the model call tools instead of answering from fixed retrieval.
    #[serde(default = "default_true")]
    pub use_tools: bool,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderBackend {
    Onnx,
    /// Hash vectors; no model files needed.
    Mock,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_backend")]
    pub backend: EmbedderBackend,

    #[serde(default = "default_model_name")]
    pub name: String,

    #[serde(default = "default_model_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChatConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_chat_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            chapters_dir: default_chapters_dir(),
            db_path: default_db_path(),
            bind: default_bind(),
            default_top_k: default_top_k(),
            max_tool_iterations: default_max_tool_iterations(),
            use_tools: default_true(),
            request_timeout_secs: default_request_timeout_secs(),
            embed_batch_size: default_embed_batch_size(),
            model: ModelConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            name: default_model_name(),
            dir: default_model_dir(),
            dimensions: default_dimensions(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            model: default_chat_model(),
            max_tokens: default_max_tokens(),
            api_key_env: default_api_key_env(),
            anthropic_version: default_anthropic_version(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// An empty `config_path` means [`DEFAULT_CONFIG_PATH`]. A missing file
    /// yields defaults (and, for the default path only, writes them out as a
    /// template); invalid JSON is logged and also yields defaults.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            DEFAULT_CONFIG_PATH
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            if path == DEFAULT_CONFIG_PATH {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        match serde_json::from_str(&data) {
            Ok(cfg) => {
                info!("Loaded configuration from {path}");
                Ok(cfg)
            }
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.max_tool_iterations >= 1,
            "max_tool_iterations must be at least 1"
        );
        anyhow::ensure!(
            (1..=5).contains(&self.default_top_k),
            "default_top_k must be between 1 and 5"
        );
        anyhow::ensure!(
            self.request_timeout_secs >= 1,
            "request_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.model.dimensions > 0,
            "model.dimensions must be positive"
        );
        anyhow::ensure!(self.chat.max_tokens > 0, "chat.max_tokens must be positive");
        anyhow::ensure!(
            !self.chapters_dir.as_os_str().is_empty(),
            "chapters_dir must be set"
        );
        Ok(())
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Listen address after applying the `HOST` and `PORT` environment
    /// variables.
    #[must_use]
    pub fn bind_address(&self) -> String {
        self.bind_with(std::env::var("HOST").ok(), std::env::var("PORT").ok())
    }

    fn bind_with(&self, host: Option<String>, port: Option<String>) -> String {
        let (cfg_host, cfg_port) = self
            .bind
            .rsplit_once(':')
            .unwrap_or((self.bind.as_str(), "8000"));

        let host = host
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| cfg_host.to_string());
        let port = port
            .filter(|p| p.trim().parse::<u16>().is_ok())
            .unwrap_or_else(|| cfg_port.to_string());

        format!("{host}:{}", port.trim())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.chapters_dir, PathBuf::from("data/chapters"));
        assert_eq!(config.default_top_k, 3);
        assert_eq!(config.max_tool_iterations, 5);
        assert!(config.use_tools);
        assert_eq!(config.model.backend, EmbedderBackend::Onnx);
        assert_eq!(config.model.dimensions, 384);
        assert_eq!(config.chat.max_tokens, 1024);
        assert_eq!(config.chat.api_key_env, "ANTHROPIC_API_KEY");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_json() {
        let json = r#"{"chapters_dir": "docs", "model": {"backend": "mock"}, "chat": {"model": "m"}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.chapters_dir, PathBuf::from("docs"));
        assert_eq!(config.model.backend, EmbedderBackend::Mock);
        assert_eq!(config.model.dimensions, 384);
        assert_eq!(config.chat.model, "m");
        assert_eq!(config.chat.max_tokens, 1024);
        assert_eq!(config.max_tool_iterations, 5);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config, Config::default());
        // Templates are only written for the default path.
        assert!(!path.exists());
    }

    #[test]
    fn test_load_invalid_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.use_tools = false;
        config.default_top_k = 5;
        config.save(path.to_str().unwrap()).unwrap();

        let loaded = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: [fn(&mut Config); 6] = [
            |c| c.max_tool_iterations = 0,
            |c| c.default_top_k = 0,
            |c| c.default_top_k = 6,
            |c| c.request_timeout_secs = 0,
            |c| c.model.dimensions = 0,
            |c| c.chapters_dir = PathBuf::new(),
        ];
        for mutate in cases {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn test_bind_overrides() {
        let config = Config::default();
        assert_eq!(config.bind_with(None, None), "127.0.0.1:8000");
        assert_eq!(
            config.bind_with(Some("0.0.0.0".into()), None),
            "0.0.0.0:8000"
        );
        assert_eq!(config.bind_with(None, Some("9000".into())), "127.0.0.1:9000");
        assert_eq!(
            config.bind_with(None, Some("not-a-port".into())),
            "127.0.0.1:8000"
        );
    }
}
