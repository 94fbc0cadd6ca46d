//! Load-time parameters handed to [`crate::Engine::load`].

use serde::{Deserialize, Serialize};

/// Parameters for loading one model instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Context window in tokens (0 = model default).
    pub ctx_size: u32,
    /// Layers to offload to GPU. -1 = all.
    pub n_gpu_layers: i32,
    /// CPU threads used for generation.
    pub n_threads: u32,
    /// Use memory-mapped I/O.
    pub use_mmap: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            ctx_size: 4096,
            n_gpu_layers: -1,
            n_threads: 8,
            use_mmap: true,
        }
    }
}
