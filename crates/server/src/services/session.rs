//! One generation on a leased model.
//!
//! The lease travels into the blocking generation task and is dropped when
//! that task ends. Normal completion, an engine error, a panic, and the
//! consumer dropping the stream all release the model exactly once.

use std::pin::Pin;
use std::task::{Context, Poll};

use llama_runtime::{FinishReason, GenerateEvent, GenerateRequest};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use super::model_manager::ModelLease;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation ended without a final result")]
    Incomplete,
}

/// Buffered result of a non-streaming generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: FinishReason,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

pub struct GenerationSession;

impl GenerationSession {
    pub fn start(lease: ModelLease, request: GenerateRequest) -> TokenStream {
        let (tx, rx) = mpsc::channel(64);
        let model = lease.name().to_string();
        let runtime = lease.runtime();

        tokio::task::spawn_blocking(move || {
            let lease = lease;
            debug!(model = %lease.name(), max_tokens = request.max_tokens, "Generation started");
            runtime.generate_blocking(&request, tx);
            debug!(model = %lease.name(), "Generation finished; releasing model");
        });

        TokenStream {
            model,
            inner: ReceiverStream::new(rx),
        }
    }
}

/// Events from a running generation. Dropping it stops the generation.
pub struct TokenStream {
    model: String,
    inner: ReceiverStream<GenerateEvent>,
}

impl TokenStream {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn recv(&mut self) -> Option<GenerateEvent> {
        self.inner.next().await
    }

    /// Drain the stream into a single [`Completion`].
    pub async fn into_completion(mut self) -> Result<Completion, SessionError> {
        let mut text = String::new();
        while let Some(event) = self.recv().await {
            match event {
                GenerateEvent::Token(piece) => text.push_str(&piece),
                GenerateEvent::Done {
                    finish_reason,
                    prompt_tokens,
                    completion_tokens,
                } => {
                    return Ok(Completion {
                        text,
                        finish_reason,
                        prompt_tokens,
                        completion_tokens,
                    });
                }
                GenerateEvent::Error(e) => {
                    error!(model = %self.model, error = %e, "Generation error");
                    return Err(SessionError::Generation(e));
                }
            }
        }
        Err(SessionError::Incomplete)
    }
}

impl Stream for TokenStream {
    type Item = GenerateEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
