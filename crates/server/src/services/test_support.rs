//! Counting mock engine shared by the service tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use llama_runtime::{
    Engine, EngineError, FinishReason, GenerateEvent, GenerateRequest, ModelParams, Runtime,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::model_manager::{ModelManager, ModelManagerConfig};
use super::registry::{ModelRegistry, RegistryConfig};

#[derive(Default)]
pub struct MockEngine {
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub fail_loads: AtomicBool,
    pub fail_unloads: AtomicBool,
    pub load_delay: Duration,
    pub unload_delay: Duration,
    pub token_delay: Duration,
}

impl MockEngine {
    pub fn with_load_delay(delay: Duration) -> Self {
        Self {
            load_delay: delay,
            ..Self::default()
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    fn load(&self, path: &Path, _params: &ModelParams) -> llama_runtime::Result<Arc<dyn Runtime>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.load_delay);
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(EngineError::ModelLoadFailed {
                path: path.display().to_string(),
                reason: "out of memory".into(),
            });
        }
        Ok(Arc::new(MockRuntime {
            path: path.to_path_buf(),
            token_delay: self.token_delay,
        }))
    }

    fn unload(&self, _runtime: Arc<dyn Runtime>) -> llama_runtime::Result<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.unload_delay);
        if self.fail_unloads.load(Ordering::SeqCst) {
            return Err(EngineError::UnloadFailed("device lost".into()));
        }
        Ok(())
    }
}

/// Emits `tok0 tok1 ...` up to `max_tokens`, then `Done`.
pub struct MockRuntime {
    #[allow(dead_code)]
    path: PathBuf,
    token_delay: Duration,
}

impl Runtime for MockRuntime {
    fn generate_blocking(&self, request: &GenerateRequest, tx: mpsc::Sender<GenerateEvent>) {
        for i in 0..request.max_tokens {
            std::thread::sleep(self.token_delay);
            if tx.blocking_send(GenerateEvent::Token(format!("tok{i} "))).is_err() {
                return;
            }
        }
        let _ = tx.blocking_send(GenerateEvent::Done {
            finish_reason: FinishReason::Length,
            prompt_tokens: 1,
            completion_tokens: request.max_tokens,
        });
    }
}

pub fn touch_model(dir: &Path, name: &str) {
    std::fs::write(dir.join(name), b"GGUF\x03\x00\x00\x00").unwrap();
}

/// A models directory holding `files`, a registry over it, and a manager.
pub struct Fixture {
    pub dir: TempDir,
    pub engine: Arc<MockEngine>,
    pub registry: Arc<ModelRegistry>,
    pub manager: ModelManager,
}

pub fn fixture(files: &[&str], engine: MockEngine, config: ModelManagerConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    for f in files {
        touch_model(dir.path(), f);
    }
    let registry = Arc::new(ModelRegistry::open(RegistryConfig::new(dir.path())).unwrap());
    let engine = Arc::new(engine);
    let manager = ModelManager::new(engine.clone(), registry.clone(), config);
    Fixture {
        dir,
        engine,
        registry,
        manager,
    }
}
