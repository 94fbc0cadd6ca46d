//! Streaming generation request/response types.

use crate::sampler::SamplingParams;

/// Parameters for a generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Fully formatted prompt text.
    pub prompt: String,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Stop-word strings.
    pub stop_words: Vec<String>,
    /// Sampling configuration.
    pub sampling: SamplingParams,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 2048,
            stop_words: Vec::new(),
            sampling: SamplingParams::default(),
        }
    }
}

/// Events emitted during streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerateEvent {
    /// A new text piece was decoded.
    Token(String),
    /// Generation finished.
    Done {
        finish_reason: FinishReason,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// An error occurred mid-generation.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural stop (end of generation).
    Stop,
    /// Reached `max_tokens`.
    Length,
    /// Matched a stop word.
    StopWord(String),
}

impl FinishReason {
    /// The value OpenAI clients expect in `finish_reason`.
    pub fn as_openai(&self) -> &'static str {
        match self {
            Self::Stop | Self::StopWord(_) => "stop",
            Self::Length => "length",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::StopWord(w) => write!(f, "stop_word:{w}"),
        }
    }
}
