//! Boundary between the gateway and whatever actually runs the model.
//!
//! An [`Engine`] turns a model file into a resident [`Runtime`]; a runtime
//! streams [`GenerateEvent`]s for a [`GenerateRequest`]. The gateway never
//! looks inside either, it only owns their lifecycle.

pub mod chat;
pub mod echo;
pub mod engine;
pub mod error;
pub mod generate;
pub mod model;
pub mod sampler;

pub use chat::{ChatMessage, ChatTemplate, apply_template};
pub use echo::EchoEngine;
pub use engine::{Engine, Runtime};
pub use error::{EngineError, Result};
pub use generate::{FinishReason, GenerateEvent, GenerateRequest};
pub use model::ModelParams;
pub use sampler::SamplingParams;
