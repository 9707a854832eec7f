//! LLM capability layer (C2): message types, the `LlmCapability` trait, an
//! HTTP implementation against an OpenAI-compatible endpoint, SSE parsing,
//! and coordinated rate-limit backoff.

pub mod client;
pub mod http;
pub mod rate_limit;
pub mod streaming;
pub mod types;

pub use client::{CallTimeout, EndpointInfo, LlmCapability, LlmError, StreamChunk};
pub use http::HttpLlmClient;
pub use rate_limit::{RateLimitConfig, RateLimitState};
pub use streaming::parse_sse_data;
pub use types::{
    CompletionRequest, CompletionResponse, Message, Role, SamplingParams, StopReason, Usage,
};
