//! TOML configuration parsing and validation.
//!
//! Every section except `[storage]` is optional; missing keys fall back to
//! the defaults the study pipeline was tuned with (500/100 character chunks,
//! two retrieved snippets per question, 3000-character context windows).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_projects_file")]
    pub projects_file: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_projects_file() -> PathBuf {
    PathBuf::from("./projects.json")
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    100
}

/// Context window sizes for the different generation tasks.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Nearest chunks fetched for a non-empty query.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Chunks taken in storage order when there is no query.
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_answer_max_chars")]
    pub answer_max_chars: usize,
    #[serde(default = "default_summary_limit")]
    pub summary_limit: usize,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            limit: default_limit(),
            max_chars: default_max_chars(),
            answer_max_chars: default_answer_max_chars(),
            summary_limit: default_summary_limit(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

fn default_k() -> usize {
    2
}
fn default_limit() -> usize {
    10
}
fn default_max_chars() -> usize {
    3000
}
fn default_answer_max_chars() -> usize {
    1500
}
fn default_summary_limit() -> usize {
    20
}
fn default_summary_max_chars() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "local".to_string()
}
fn default_embedding_model() -> String {
    "bge-small-en-v1.5".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_url")]
    pub url: String,
    /// Model name, required by the Ollama backend.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            url: default_generation_url(),
            model: None,
            temperature: default_temperature(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "llama-server".to_string()
}
fn default_generation_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_generation_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.size == 0 {
        bail!("chunking.size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.size {
        bail!(
            "chunking.overlap ({}) must be smaller than chunking.size ({})",
            config.chunking.overlap,
            config.chunking.size
        );
    }

    let r = &config.retrieval;
    for (name, value) in [
        ("k", r.k),
        ("limit", r.limit),
        ("max_chars", r.max_chars),
        ("answer_max_chars", r.answer_max_chars),
        ("summary_limit", r.summary_limit),
        ("summary_max_chars", r.summary_max_chars),
    ] {
        if value == 0 {
            bail!("retrieval.{} must be > 0", name);
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, local, or ollama.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "disabled" | "llama-server" => {}
        "ollama" => {
            if config.generation.model.is_none() {
                bail!("generation.model must be specified when provider is 'ollama'");
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, llama-server, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config("[storage]\n").unwrap();
        assert_eq!(config.storage.projects_file, PathBuf::from("./projects.json"));
        assert_eq!(config.chunking.size, 500);
        assert_eq!(config.chunking.overlap, 100);
        assert_eq!(config.retrieval.k, 2);
        assert_eq!(config.retrieval.answer_max_chars, 1500);
        assert_eq!(config.embedding.model, "bge-small-en-v1.5");
        assert_eq!(config.generation.provider, "llama-server");
        assert_eq!(config.server.bind, "127.0.0.1:8000");
    }

    #[test]
    fn shipped_config_parses() {
        let config = parse_config(include_str!("../config/letslearn.toml")).unwrap();
        assert_eq!(config.retrieval.summary_max_chars, 4000);
        assert_eq!(config.generation.url, "http://127.0.0.1:8080");
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let err = parse_config("[storage]\n[chunking]\nsize = 100\noverlap = 100\n").unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn unknown_generation_provider_rejected() {
        let err = parse_config("[storage]\n[generation]\nprovider = \"gpt\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown generation provider"));
    }

    #[test]
    fn ollama_generation_requires_model() {
        let err = parse_config("[storage]\n[generation]\nprovider = \"ollama\"\n").unwrap_err();
        assert!(err.to_string().contains("generation.model"));
    }

    #[test]
    fn zero_retrieval_window_rejected() {
        let err = parse_config("[storage]\n[retrieval]\nmax_chars = 0\n").unwrap_err();
        assert!(err.to_string().contains("retrieval.max_chars"));
    }
}
