pub mod config_cmd;
pub mod models;
pub mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(
    name = "llama-gateway",
    version,
    about = "OpenAI-compatible gateway that loads local GGUF models on demand"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, clap::Args, Clone, Default)]
pub struct GlobalArgs {
    /// Config file (default: <config dir>/llama-gateway/config.json).
    #[arg(long, env = "LLAMA_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Listen address.
    #[arg(long, env = "LLAMA_GATEWAY_HOST", global = true)]
    pub host: Option<String>,

    /// Listen port.
    #[arg(short, long, env = "LLAMA_GATEWAY_PORT", global = true)]
    pub port: Option<u16>,

    /// Directory scanned for .gguf models.
    #[arg(long = "models-dir", env = "LLAMA_GATEWAY_MODELS_DIR", global = true)]
    pub models_dir: Option<PathBuf>,
}

impl GlobalArgs {
    /// Overlay command-line values on the loaded config.
    pub fn apply(&self, cfg: &mut AppConfig) {
        if let Some(host) = &self.host {
            cfg.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(dir) = &self.models_dir {
            cfg.models_dir = dir.clone();
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API server (default).
    Serve(ServeArgs),

    /// Inspect discovered models.
    Models(ModelsArgs),

    /// View / edit configuration.
    Config(ConfigArgs),
}

//  Subcommand argument structs

#[derive(Debug, clap::Args, Clone, Default)]
pub struct ServeArgs {
    /// Load this model before accepting requests.
    #[arg(long)]
    pub preload: Option<String>,

    /// Model used when a request names none.
    #[arg(long, env = "LLAMA_GATEWAY_DEFAULT_MODEL")]
    pub default_model: Option<String>,

    /// Context size.
    #[arg(long)]
    pub ctx_size: Option<u32>,

    /// GPU layers (-1 = all, 0 = CPU only).
    #[arg(long, allow_hyphen_values = true)]
    pub n_gpu_layers: Option<i32>,

    /// Threads per model.
    #[arg(long)]
    pub n_threads: Option<u32>,

    /// Maximum number of resident models (0 = unlimited).
    #[arg(long, env = "LLAMA_GATEWAY_MAX_RESIDENT")]
    pub max_resident: Option<usize>,

    /// Unload models idle for this many seconds (0 = never).
    #[arg(long = "idle-timeout", env = "LLAMA_GATEWAY_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Seconds between idle sweeps.
    #[arg(long = "check-interval", env = "LLAMA_GATEWAY_CHECK_INTERVAL")]
    pub check_interval: Option<u64>,

    /// Give up on a model load after this many seconds.
    #[arg(long = "load-timeout", env = "LLAMA_GATEWAY_LOAD_TIMEOUT")]
    pub load_timeout: Option<u64>,

    /// Delay between generated tokens of the echo engine, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub token_delay_ms: u64,
}

impl ServeArgs {
    pub fn apply(&self, cfg: &mut AppConfig) {
        if let Some(v) = &self.default_model {
            cfg.default_model = Some(v.clone());
        }
        if let Some(v) = self.ctx_size {
            cfg.ctx_size = v;
        }
        if let Some(v) = self.n_gpu_layers {
            cfg.n_gpu_layers = v;
        }
        if let Some(v) = self.n_threads {
            cfg.n_threads = v;
        }
        if let Some(v) = self.max_resident {
            cfg.max_resident = (v > 0).then_some(v);
        }
        if let Some(v) = self.idle_timeout {
            cfg.idle_timeout_secs = v;
        }
        if let Some(v) = self.check_interval {
            cfg.check_interval_secs = v;
        }
        if let Some(v) = self.load_timeout {
            cfg.load_timeout_secs = v;
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct ModelsArgs {
    #[command(subcommand)]
    pub action: ModelsAction,
}

#[derive(Debug, Subcommand)]
pub enum ModelsAction {
    /// List discoverable models.
    List {
        /// Directory to scan (overrides config).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Debug, clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Display the current configuration.
    Show,
    /// Set a configuration value.
    Set { key: String, value: String },
}
