//! Configuration management for the QA verifier.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then environment variables:
//! - `QA_CONFIG` - Optional. Path of the YAML file. Defaults to `config.yaml`.
//! - `ANYTHINGLLM_URL` - Optional. Base URL of the chat service. Defaults to `http://localhost:3001`.
//! - `API_KEY` - Optional. Bearer credential for the chat service.
//! - `DEFAULT_MODEL` - Optional. Chat model used when creating workspaces.
//! - `SIMILARITY_THRESHOLD` - Optional. Workspace retrieval threshold and report "good" line.
//! - `EMBED_URL` / `EMBED_API_KEY` / `EMBED_MODEL` - Optional. OpenAI-compatible embeddings endpoint for cosine scoring.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `5001`.
//! - `UPLOAD_DIR` / `OUTPUT_DIR` - Optional. Working directories. Default `uploads` / `output`.
//! - `TASK_TTL_SECS` - Optional. Registry entry lifetime. Defaults to `3600`.
//! - `TASK_SWEEP_INTERVAL_SECS` - Optional. Eviction sweep period. Defaults to `300`.
//! - `STREAM_HEARTBEAT_SECS` - Optional. Idle time before a heartbeat record. Defaults to `10`.
//! - `STREAM_MAX_SECS` - Optional. Wall-clock ceiling of one stream session. Defaults to `3600`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, String),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Connection settings for the external chat service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL, e.g. `http://localhost:3001`
    pub base_url: String,

    /// Bearer credential
    pub api_key: Option<String>,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            api_key: None,
            request_timeout_secs: 120,
        }
    }
}

/// Generation parameters used when a workspace has to be created.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceDefaults {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub history_length: u32,
    pub system_prompt: String,
    pub query_refusal_response: String,
    pub chat_mode: String,
    pub top_n: u32,
}

impl Default for WorkspaceDefaults {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "llama3.1:8b-instruct-fp16".to_string(),
            temperature: 0.7,
            history_length: 20,
            system_prompt: "You are a helpful assistant.".to_string(),
            query_refusal_response: "Sorry, I cannot answer that.".to_string(),
            chat_mode: "query".to_string(),
            top_n: 4,
        }
    }
}

/// Similarity scoring settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// OpenAI-compatible embeddings endpoint; cosine scoring is disabled when unset
    pub embed_url: Option<String>,
    pub embed_api_key: Option<String>,
    pub embed_model: String,
    /// Per-request timeout for the embeddings endpoint, in seconds
    pub embed_timeout_secs: u64,
    pub similarity_threshold: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            embed_url: None,
            embed_api_key: None,
            embed_model: "paraphrase-multilingual-MiniLM-L12-v2".to_string(),
            embed_timeout_secs: 60,
            similarity_threshold: 0.7,
        }
    }
}

impl AnalyzerConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs.max(1))
    }
}

/// Working directories.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Source used by the command-line runner when none is given
    pub default_source: PathBuf,
    /// Reference-document directory used by the command-line runner
    pub default_upload_dir: Option<PathBuf>,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            default_source: PathBuf::from("qa_data.csv"),
            default_upload_dir: None,
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("output"),
        }
    }
}

/// Task lifecycle and streaming timings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub stream_heartbeat_secs: u64,
    pub stream_max_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60 * 60,
            sweep_interval_secs: 5 * 60,
            stream_heartbeat_secs: 10,
            stream_max_secs: 60 * 60,
        }
    }
}

impl TaskConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.stream_heartbeat_secs.max(1))
    }

    pub fn stream_ceiling(&self) -> Duration {
        Duration::from_secs(self.stream_max_secs)
    }
}

/// Full service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    pub api: ApiConfig,
    pub workspace: WorkspaceDefaults,
    pub analyzer: AnalyzerConfig,
    pub file: FileConfig,
    pub tasks: TaskConfig,

    /// Reference-document glob pattern (e.g. `*.pdf`) -> content type
    pub supported_documents: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            api: ApiConfig::default(),
            workspace: WorkspaceDefaults::default(),
            analyzer: AnalyzerConfig::default(),
            file: FileConfig::default(),
            tasks: TaskConfig::default(),
            supported_documents: default_supported_documents(),
        }
    }
}

fn default_supported_documents() -> BTreeMap<String, String> {
    [
        ("*.pdf", "application/pdf"),
        ("*.txt", "text/plain"),
        ("*.md", "text/markdown"),
        (
            "*.docx",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ),
        ("*.csv", "text/csv"),
        ("*.json", "application/json"),
    ]
    .into_iter()
    .map(|(pattern, mime)| (pattern.to_string(), mime.to_string()))
    .collect()
}

impl Config {
    /// Load configuration from the environment, reading the YAML file named by
    /// `QA_CONFIG` (or `config.yaml`) when it exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("QA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.yaml"));
        Self::load(&path)
    }

    /// Load `path` (if present) and apply environment overrides.
    ///
    /// # Errors
    ///
    /// A missing file falls back to defaults; an unreadable or malformed file
    /// and invalid environment values are errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_yaml_str(&raw)
                .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Config file {} not found, using defaults",
                    path.display()
                );
                Self::default()
            }
            Err(e) => return Err(ConfigError::Read(path.to_path_buf(), e.to_string())),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document. Missing sections keep their defaults.
    pub fn from_yaml_str(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut config: Config = serde_yaml::from_str(raw).map_err(|e| e.to_string())?;
        if config.supported_documents.is_empty() {
            config.supported_documents = default_supported_documents();
        }
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ANYTHINGLLM_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = lookup("API_KEY") {
            self.api.api_key = Some(v);
        }
        if let Some(v) = lookup("DEFAULT_MODEL") {
            self.workspace.model = v;
        }
        if let Some(v) = lookup("SIMILARITY_THRESHOLD") {
            self.analyzer.similarity_threshold = parse_value("SIMILARITY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("EMBED_URL") {
            self.analyzer.embed_url = Some(v);
        }
        if let Some(v) = lookup("EMBED_API_KEY") {
            self.analyzer.embed_api_key = Some(v);
        }
        if let Some(v) = lookup("EMBED_MODEL") {
            self.analyzer.embed_model = v;
        }
        if let Some(v) = lookup("EMBED_TIMEOUT_SECS") {
            self.analyzer.embed_timeout_secs = parse_value("EMBED_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.port = parse_value("PORT", &v)?;
        }
        if let Some(v) = lookup("UPLOAD_DIR") {
            self.file.upload_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("OUTPUT_DIR") {
            self.file.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TASK_TTL_SECS") {
            self.tasks.ttl_secs = parse_value("TASK_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("TASK_SWEEP_INTERVAL_SECS") {
            self.tasks.sweep_interval_secs = parse_value("TASK_SWEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("STREAM_HEARTBEAT_SECS") {
            self.tasks.stream_heartbeat_secs = parse_value("STREAM_HEARTBEAT_SECS", &v)?;
        }
        if let Some(v) = lookup("STREAM_MAX_SECS") {
            self.tasks.stream_max_secs = parse_value("STREAM_MAX_SECS", &v)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.api.base_url).map_err(|e| {
            ConfigError::InvalidValue("api.base_url".to_string(), e.to_string())
        })?;
        if !(0.0..=1.0).contains(&self.analyzer.similarity_threshold) {
            return Err(ConfigError::InvalidValue(
                "analyzer.similarity_threshold".to_string(),
                format!("{} is outside [0, 1]", self.analyzer.similarity_threshold),
            ));
        }
        Ok(())
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}
