//! Application configuration, persisted as JSON.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use llama_runtime::ModelParams;
use serde::{Deserialize, Serialize};

use crate::services::model_manager::ModelManagerConfig;
use crate::services::reaper::ReaperConfig;
use crate::services::registry::{ModelOverrides, RegistryConfig};

/// Global configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins; `"*"` allows any.
    pub cors_origins: Vec<String>,
    pub models_dir: PathBuf,
    /// Model used when a request names none. Falls back to the first discovered model.
    pub default_model: Option<String>,
    pub ctx_size: u32,
    /// GPU layers (-1 = all).
    pub n_gpu_layers: i32,
    pub n_threads: u32,
    /// Seconds without references before a model is evicted (0 = never).
    pub idle_timeout_secs: u64,
    pub check_interval_secs: u64,
    /// Maximum resident models (`None` = unlimited).
    pub max_resident: Option<usize>,
    pub load_timeout_secs: u64,
    /// Per-model parameter overrides, keyed by model name.
    pub model_settings: HashMap<String, ModelOverrides>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let params = ModelParams::default();
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            cors_origins: vec!["*".into()],
            models_dir: PathBuf::from("./models"),
            default_model: None,
            ctx_size: params.ctx_size,
            n_gpu_layers: params.n_gpu_layers,
            n_threads: params.n_threads,
            idle_timeout_secs: 300,
            check_interval_secs: 60,
            max_resident: None,
            load_timeout_secs: 120,
            model_settings: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Platform config directory: `~/.config/llama-gateway/`
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llama-gateway")
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Load from `path` (or the default location), or return defaults if
    /// the file doesn't exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map_or_else(Self::default_path, Path::to_path_buf);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
    }

    /// Persist to `path` (or the default location).
    pub fn save(&self, path: Option<&Path>) -> anyhow::Result<()> {
        let path = path.map_or_else(Self::default_path, Path::to_path_buf);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Update one top-level field from its string form (`config set`).
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "host" => self.host = value.to_string(),
            "port" => self.port = value.parse()?,
            "cors_origins" => {
                self.cors_origins = value.split(',').map(|s| s.trim().to_string()).collect();
            }
            "models_dir" => self.models_dir = PathBuf::from(value),
            "default_model" => self.default_model = none_if_empty(value),
            "ctx_size" => self.ctx_size = value.parse()?,
            "n_gpu_layers" => self.n_gpu_layers = value.parse()?,
            "n_threads" => self.n_threads = value.parse()?,
            "idle_timeout_secs" => self.idle_timeout_secs = value.parse()?,
            "check_interval_secs" => self.check_interval_secs = value.parse()?,
            "max_resident" => {
                self.max_resident = none_if_empty(value).map(|v| v.parse()).transpose()?;
            }
            "load_timeout_secs" => self.load_timeout_secs = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {key}"),
        }
        Ok(())
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            ctx_size: self.ctx_size,
            n_gpu_layers: self.n_gpu_layers,
            n_threads: self.n_threads,
            ..ModelParams::default()
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            models_dir: self.models_dir.clone(),
            defaults: self.model_params(),
            overrides: self.model_settings.clone(),
            default_model: self.default_model.clone(),
        }
    }

    pub fn manager_config(&self) -> ModelManagerConfig {
        ModelManagerConfig {
            max_resident: self.max_resident.filter(|&n| n > 0),
            load_timeout: Duration::from_secs(self.load_timeout_secs),
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            check_interval: Duration::from_secs(self.check_interval_secs),
        }
    }
}

fn none_if_empty(value: &str) -> Option<String> {
    let v = value.trim();
    (!v.is_empty() && !v.eq_ignore_ascii_case("none")).then(|| v.to_string())
}
