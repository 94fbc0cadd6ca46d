//! Chat-template formatting.

use serde::{Deserialize, Serialize};

/// A single chat message (role + content).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Prompt layouts understood by the built-in formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatTemplate {
    /// `<|im_start|>role\n…<|im_end|>` (Qwen, many fine-tunes). Default.
    #[default]
    ChatMl,
    /// `<|start_header_id|>role<|end_header_id|>` (Llama 3 family).
    Llama3,
}

impl ChatTemplate {
    /// Pick a template from the model name; unknown families fall back to ChatML.
    pub fn detect(model_name: &str) -> Self {
        let lower = model_name.to_ascii_lowercase();
        if lower.contains("llama-3") || lower.contains("llama3") {
            Self::Llama3
        } else {
            Self::ChatMl
        }
    }
}

/// Render `messages` with `template`.
///
/// `add_assistant` appends an open assistant turn (for generation).
///
/// Roles other than system/user/assistant are rendered verbatim as their
/// own turn so tool output is not silently dropped.
pub fn apply_template(
    template: ChatTemplate,
    messages: &[ChatMessage],
    add_assistant: bool,
) -> String {
    let mut out = String::new();
    match template {
        ChatTemplate::ChatMl => {
            for m in messages {
                out.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", m.role, m.content));
            }
            if add_assistant {
                out.push_str("<|im_start|>assistant\n");
            }
        }
        ChatTemplate::Llama3 => {
            out.push_str("<|begin_of_text|>");
            for m in messages {
                out.push_str(&format!(
                    "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                    m.role, m.content
                ));
            }
            if add_assistant {
                out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chatml_appends_open_assistant_turn() {
        let msgs = vec![
            ChatMessage::new("system", "be brief"),
            ChatMessage::new("user", "hi"),
        ];
        let prompt = apply_template(ChatTemplate::ChatMl, &msgs, true);
        assert_eq!(
            prompt,
            "<|im_start|>system\nbe brief<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn detect_llama3_by_name() {
        assert_eq!(ChatTemplate::detect("Meta-Llama-3-8B-Instruct"), ChatTemplate::Llama3);
        assert_eq!(ChatTemplate::detect("qwen3-14b-q6_K"), ChatTemplate::ChatMl);
    }

    #[test]
    fn llama3_without_assistant_turn() {
        let msgs = vec![ChatMessage::new("user", "hi")];
        let prompt = apply_template(ChatTemplate::Llama3, &msgs, false);
        assert!(prompt.starts_with("<|begin_of_text|>"));
        assert!(prompt.ends_with("hi<|eot_id|>"));
    }
}
