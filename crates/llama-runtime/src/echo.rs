//! Development backend that needs no GPU and no inference library.
//!
//! `EchoEngine` behaves like a real engine at the lifecycle level: `load`
//! opens and validates the GGUF header, `unload` drops the instance, and
//! generation streams tokens through the same channel protocol. The
//! "model" simply echoes the last user line of the prompt word by word.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::{Engine, Runtime};
use crate::error::{EngineError, Result};
use crate::generate::{FinishReason, GenerateEvent, GenerateRequest};
use crate::model::ModelParams;

/// Magic bytes `GGUF` (little-endian).
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Maximum GGUF version we accept.
pub const GGUF_VERSION_MAX: u32 = 3;

const ROLE_LINES: &[&str] = &["system", "user", "assistant", "tool"];

#[derive(Debug, Clone, Default)]
pub struct EchoEngine {
    token_delay: Duration,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long between tokens, to make streaming observable.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }
}

impl Engine for EchoEngine {
    fn name(&self) -> &str {
        "echo"
    }

    fn load(&self, path: &Path, params: &ModelParams) -> Result<Arc<dyn Runtime>> {
        info!(path = %path.display(), ctx_size = params.ctx_size, "Loading model…");
        check_gguf_header(path)?;
        info!(path = %path.display(), "Model loaded");
        Ok(Arc::new(EchoRuntime {
            path: path.to_path_buf(),
            token_delay: self.token_delay,
        }))
    }

    fn unload(&self, runtime: Arc<dyn Runtime>) -> Result<()> {
        debug!(strong = Arc::strong_count(&runtime), "Freeing echo runtime");
        drop(runtime);
        Ok(())
    }
}

/// Read the first 8 bytes of `path` and verify magic + version.
pub fn check_gguf_header(path: &Path) -> Result<()> {
    let fail = |reason: String| EngineError::ModelLoadFailed {
        path: path.display().to_string(),
        reason,
    };

    let mut file = File::open(path).map_err(|e| fail(e.to_string()))?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)
        .map_err(|_| fail("truncated header (file too small)".into()))?;

    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != GGUF_MAGIC {
        return Err(fail(format!("invalid GGUF magic: 0x{magic:08X}")));
    }
    let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version == 0 || version > GGUF_VERSION_MAX {
        return Err(fail(format!("unsupported GGUF version: {version}")));
    }
    Ok(())
}

struct EchoRuntime {
    path: PathBuf,
    token_delay: Duration,
}

impl Runtime for EchoRuntime {
    fn generate_blocking(&self, request: &GenerateRequest, tx: mpsc::Sender<GenerateEvent>) {
        let stripped = strip_special_tokens(&request.prompt);
        let prompt_tokens = stripped.split_whitespace().count() as u32;
        let reply = last_content_line(&stripped);

        let mut completion_tokens = 0u32;
        let mut generated_text = String::new();

        for word in reply.split_whitespace() {
            if completion_tokens >= request.max_tokens {
                let _ = tx.blocking_send(GenerateEvent::Done {
                    finish_reason: FinishReason::Length,
                    prompt_tokens,
                    completion_tokens,
                });
                return;
            }

            let piece = if generated_text.is_empty() {
                word.to_string()
            } else {
                format!(" {word}")
            };
            completion_tokens += 1;
            generated_text.push_str(&piece);

            if let Some(sw) = request
                .stop_words
                .iter()
                .find(|sw| !sw.is_empty() && generated_text.ends_with(sw.as_str()))
            {
                let _ = tx.blocking_send(GenerateEvent::Done {
                    finish_reason: FinishReason::StopWord(sw.clone()),
                    prompt_tokens,
                    completion_tokens,
                });
                return;
            }

            if tx.blocking_send(GenerateEvent::Token(piece)).is_err() {
                debug!(path = %self.path.display(), "Generation cancelled (receiver dropped)");
                return;
            }

            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
        }

        let _ = tx.blocking_send(GenerateEvent::Done {
            finish_reason: FinishReason::Stop,
            prompt_tokens,
            completion_tokens,
        });
    }
}

/// Replace every `<|…|>` marker with a newline.
fn strip_special_tokens(prompt: &str) -> String {
    let mut out = String::with_capacity(prompt.len());
    let mut rest = prompt;
    while let Some(start) = rest.find("<|") {
        out.push_str(&rest[..start]);
        match rest[start..].find("|>") {
            Some(end) => {
                out.push('\n');
                rest = &rest[start + end + 2..];
            }
            None => {
                rest = &rest[start..];
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn last_content_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !ROLE_LINES.contains(l))
        .last()
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatMessage, ChatTemplate, apply_template};
    use std::io::Write;

    fn gguf_file(version: u32) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        f.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        f.write_all(&version.to_le_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    fn run(runtime: Arc<dyn Runtime>, request: GenerateRequest) -> Vec<GenerateEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        std::thread::spawn(move || runtime.generate_blocking(&request, tx))
            .join()
            .unwrap();
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn rejects_non_gguf_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"not a model at all").unwrap();
        let err = EchoEngine::new()
            .load(f.path(), &ModelParams::default())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::ModelLoadFailed { .. }));
    }

    #[test]
    fn rejects_future_version() {
        let f = gguf_file(9);
        assert!(EchoEngine::new().load(f.path(), &ModelParams::default()).is_err());
    }

    #[test]
    fn echoes_last_user_turn() {
        let f = gguf_file(3);
        let rt = EchoEngine::new().load(f.path(), &ModelParams::default()).unwrap();
        let prompt = apply_template(
            ChatTemplate::Llama3,
            &[
                ChatMessage::new("system", "ignored"),
                ChatMessage::new("user", "hello there world"),
            ],
            true,
        );
        let events = run(rt, GenerateRequest::new(prompt));
        assert_eq!(
            events[..3],
            [
                GenerateEvent::Token("hello".into()),
                GenerateEvent::Token(" there".into()),
                GenerateEvent::Token(" world".into()),
            ]
        );
        assert!(matches!(
            events[3],
            GenerateEvent::Done {
                finish_reason: FinishReason::Stop,
                completion_tokens: 3,
                ..
            }
        ));
    }

    #[test]
    fn honours_max_tokens_and_stop_words() {
        let f = gguf_file(3);
        let engine = EchoEngine::new();
        let rt = engine.load(f.path(), &ModelParams::default()).unwrap();

        let mut req = GenerateRequest::new("one two three four");
        req.max_tokens = 2;
        let events = run(rt.clone(), req);
        assert!(matches!(
            events.last(),
            Some(GenerateEvent::Done {
                finish_reason: FinishReason::Length,
                completion_tokens: 2,
                ..
            })
        ));

        let mut req = GenerateRequest::new("one two three four");
        req.stop_words = vec!["three".into()];
        let events = run(rt.clone(), req);
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            GenerateEvent::Done {
                finish_reason: FinishReason::StopWord("three".into()),
                prompt_tokens: 4,
                completion_tokens: 3,
            }
        );

        engine.unload(rt).unwrap();
    }
}
