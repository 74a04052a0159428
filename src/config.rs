use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::pipeline::cache::{SignatureMode, DEFAULT_CACHE_CAPACITY, DEFAULT_HYBRID_BYTES};

/// Application-level constants
pub const APP_NAME: &str = "Docsift";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_LLM_MODEL: &str = "llama3.1:8b";
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// `DOCSIFT_INDEX_DIR` value selecting a non-persistent index.
const MEMORY_INDEX: &str = "memory";

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "docsift_lib=info,docsift=info"
}

/// Get the application data directory (~/.docsift).
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docsift")
}

/// Default location of the persistent similarity index.
pub fn default_index_dir() -> PathBuf {
    app_data_dir().join("index")
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Which embedding backend to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedderKind {
    #[default]
    Ollama,
    Hashing,
}

impl EmbedderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Hashing => "hashing",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Some(Self::Ollama),
            "hashing" => Some(Self::Hashing),
            _ => None,
        }
    }
}

/// Where the similarity index lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexLocation {
    Memory,
    Dir(PathBuf),
}

impl IndexLocation {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case(MEMORY_INDEX) {
            Self::Memory
        } else {
            Self::Dir(PathBuf::from(value.trim()))
        }
    }
}

impl std::fmt::Display for IndexLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str(MEMORY_INDEX),
            Self::Dir(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Runtime settings, read from `DOCSIFT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub cache_capacity: usize,
    pub signature_mode: SignatureMode,
    pub hybrid_bytes: u64,
    pub index_location: IndexLocation,
    pub ollama_url: String,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
    pub embedder: EmbedderKind,
    pub embedding_model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            signature_mode: SignatureMode::default(),
            hybrid_bytes: DEFAULT_HYBRID_BYTES,
            index_location: IndexLocation::Dir(default_index_dir()),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            llm_model: DEFAULT_LLM_MODEL.to_string(),
            llm_timeout_secs: DEFAULT_LLM_TIMEOUT_SECS,
            embedder: EmbedderKind::default(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key → value source. Unset or blank keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut settings = Self::default();

        if let Some(v) = get("DOCSIFT_CACHE_CAPACITY") {
            settings.cache_capacity = parse_number("DOCSIFT_CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = get("DOCSIFT_SIGNATURE_MODE") {
            settings.signature_mode =
                SignatureMode::from_str(&v).ok_or_else(|| ConfigError::InvalidValue {
                    var: "DOCSIFT_SIGNATURE_MODE",
                    value: v.clone(),
                    reason: "expected fast, strict or hybrid",
                })?;
        }
        if let Some(v) = get("DOCSIFT_HYBRID_BYTES") {
            settings.hybrid_bytes = parse_number("DOCSIFT_HYBRID_BYTES", &v)?;
        }
        if let Some(v) = get("DOCSIFT_INDEX_DIR") {
            settings.index_location = IndexLocation::parse(&v);
        }
        if let Some(v) = get("DOCSIFT_OLLAMA_URL") {
            settings.ollama_url = v.trim().to_string();
        }
        if let Some(v) = get("DOCSIFT_LLM_MODEL") {
            settings.llm_model = v.trim().to_string();
        }
        if let Some(v) = get("DOCSIFT_LLM_TIMEOUT_SECS") {
            settings.llm_timeout_secs = parse_number("DOCSIFT_LLM_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("DOCSIFT_EMBEDDER") {
            settings.embedder =
                EmbedderKind::from_str(&v).ok_or_else(|| ConfigError::InvalidValue {
                    var: "DOCSIFT_EMBEDDER",
                    value: v.clone(),
                    reason: "expected ollama or hashing",
                })?;
        }
        if let Some(v) = get("DOCSIFT_EMBEDDING_MODEL") {
            settings.embedding_model = v.trim().to_string();
        }

        Ok(settings)
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: "expected a non-negative integer",
    })
}
