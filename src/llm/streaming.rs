//! Server-Sent Events parsing for streamed chat-completions responses.
//!
//! The provider is treated as an OpenAI-compatible chat-completions
//! endpoint: each SSE `data:` line carries a JSON chunk with a
//! `choices[0].delta.content` field, terminated by a literal `[DONE]` line.

use serde::Deserialize;

use super::client::StreamChunk;

#[derive(Debug, Deserialize)]
struct RawChunk {
    choices: Vec<RawChoice>,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    delta: RawDelta,
}

#[derive(Debug, Deserialize, Default)]
struct RawDelta {
    content: Option<String>,
}

/// Parse one SSE `data:` payload (without the `data:` prefix) into a
/// `StreamChunk`. Returns `None` for the terminal `[DONE]` marker or
/// payloads carrying no text delta.
pub fn parse_sse_data(data: &str) -> Option<StreamChunk> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    let chunk: RawChunk = serde_json::from_str(data).ok()?;
    let content = chunk.choices.into_iter().next()?.delta.content?;
    if content.is_empty() {
        return None;
    }
    Some(StreamChunk::Text(content))
}
