//! The LLM capability trait (C2): unary, streamed, and structured-JSON
//! completion against a configured model endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::types::CompletionRequest;
use super::types::CompletionResponse;
use super::types::SamplingParams;

/// Errors surfaced by any LLM operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    /// Network/timeout failure reaching the provider.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Provider responded with a non-2xx status.
    #[error("upstream error ({status}): {message}")]
    UpstreamError { status: u16, message: String },

    /// Provider returned a 2xx response with no usable content.
    #[error("empty response from provider")]
    EmptyResponse,

    /// `invoke_structured` received content that doesn't validate against the
    /// declared schema.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// The prompt (or the model's accounting of it) exceeds the endpoint's
    /// declared context window. Distinguished from `UpstreamError` so C4 can
    /// downgrade a passage instead of dropping it.
    #[error("context overflow: prompt too large for this endpoint")]
    ContextOverflow,
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::TransportError(_) | LlmError::UpstreamError { status: 500..=599, .. }
        )
    }
}

/// A single chunk of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// Incremental text content, in upstream emission order.
    Text(String),
    /// The stream ended successfully.
    Done,
}

/// A named LLM endpoint: model id and the context ceiling the token
/// accountant must respect when assembling prompts for it.
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub model_id: String,
    pub max_context_tokens: usize,
}

/// The three operations the orchestration core needs from an LLM provider.
/// The wire protocol itself is out of scope for this crate; implementors
/// adapt whatever transport (HTTP/SSE, gRPC, in-process) to this shape.
///
/// `invoke_structured` returns a raw JSON `Value` rather than a generic type
/// so the trait stays object-safe (the orchestrator holds `Arc<dyn
/// LlmCapability>` per task); callers deserialize into their own plan/score
/// types and map deserialization failure to `LlmError::SchemaViolation`.
#[async_trait]
pub trait LlmCapability: Send + Sync {
    /// Endpoint metadata, used by the token accountant to size prompts.
    fn endpoint_info(&self) -> &EndpointInfo;

    /// Unary completion; blocks until the full response arrives.
    async fn invoke(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Streamed completion. Chunks are sent on `chunk_tx` as they arrive;
    /// the final `CompletionResponse` (for usage accounting) is returned
    /// once the stream ends. Dropping the receiver must not leak the
    /// underlying connection.
    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError>;

    /// Structured-JSON completion. `schema` is a JSON Schema description
    /// appended to the prompt as an instruction; the response is parsed as a
    /// JSON object and returned unvalidated against `schema` (validation is
    /// the caller's concern via `serde::Deserialize`).
    async fn invoke_structured(
        &self,
        prompt: &str,
        schema: &Value,
        sampling: &SamplingParams,
    ) -> Result<Value, LlmError>;
}

/// Per-call timeout applied to every LLM invocation. Timeout manifests as a
/// `LlmError::TransportError`.
#[derive(Debug, Clone, Copy)]
pub struct CallTimeout(pub Duration);

impl Default for CallTimeout {
    fn default() -> Self {
        Self(Duration::from_secs(60))
    }
}
