//! Wire-agnostic message and completion types shared by every LLM task
//! (planner, reranker judge, non-retrieval responder, answer generator,
//! summarizer).

use serde::{Deserialize, Serialize};

/// Role in a conversation turn sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Sampling knobs for a single task (planner, reranker, responder, ...).
/// Loaded from configuration and passed through unmodified to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.9,
            max_output_tokens: 1024,
            stop_sequences: Vec::new(),
        }
    }
}

/// A request to complete a prompt, unary or streamed.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub sampling: SamplingParams,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, sampling: SamplingParams) -> Self {
        Self {
            messages: vec![Message::user(prompt)],
            sampling,
        }
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// Token usage reported by the provider for a single call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self { input_tokens, output_tokens }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Unary completion result.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
    }

    #[test]
    fn message_constructors_set_role() {
        assert_eq!(Message::user("hi").role, Role::User);
        assert_eq!(Message::assistant("hi").role, Role::Assistant);
        assert_eq!(Message::system("hi").role, Role::System);
    }

    #[test]
    fn usage_add_accumulates() {
        let mut a = Usage::new(10, 5);
        a.add(&Usage::new(1, 2));
        assert_eq!(a.total(), 18);
    }

    #[test]
    fn sampling_params_default_is_conservative() {
        let params = SamplingParams::default();
        assert!(params.temperature < 1.0);
        assert!(params.stop_sequences.is_empty());
    }
}
