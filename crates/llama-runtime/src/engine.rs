//! The two traits the gateway consumes.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::generate::{GenerateEvent, GenerateRequest};
use crate::model::ModelParams;

/// One loaded model instance.
pub trait Runtime: Send + Sync {
    /// Run a synchronous (blocking) generation loop.
    ///
    /// Intended to be called inside `tokio::task::spawn_blocking`. Emits
    /// zero or more `Token` events followed by exactly one `Done` or
    /// `Error`, and returns early once the receiver is dropped.
    fn generate_blocking(&self, request: &GenerateRequest, tx: mpsc::Sender<GenerateEvent>);
}

/// Factory and reclaimer for [`Runtime`]s.
///
/// Both `load` and `unload` may block for seconds (weights are read into
/// RAM/VRAM), so callers run them off the async executor.
pub trait Engine: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn load(&self, path: &Path, params: &ModelParams) -> Result<Arc<dyn Runtime>>;

    fn unload(&self, runtime: Arc<dyn Runtime>) -> Result<()>;
}
