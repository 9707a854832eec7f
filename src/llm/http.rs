//! HTTP implementation of [`LlmCapability`] against an OpenAI-compatible
//! chat-completions endpoint — the shape every named endpoint in
//! configuration (planner, reranker, responder, answer generator,
//! summarizer) speaks over the wire.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Semaphore};

use super::client::{CallTimeout, EndpointInfo, LlmCapability, LlmError, StreamChunk};
use super::rate_limit::{RateLimitConfig, RateLimitState};
use super::streaming::parse_sse_data;
use super::types::{CompletionRequest, CompletionResponse, Message, Role, SamplingParams, StopReason, Usage};

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn messages_json(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({ "role": role_str(m.role), "content": m.content }))
        .collect()
}

/// Heuristic for providers that report context overflow as a 400 with a
/// descriptive body rather than a dedicated status code.
fn looks_like_context_overflow(status: u16, body: &str) -> bool {
    status == 400
        && (body.contains("context_length") || body.contains("maximum context length") || body.contains("too many tokens"))
}

/// Concrete [`LlmCapability`] backed by `reqwest`, talking to any
/// OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpLlmClient {
    client: Client,
    api_key: String,
    base_url: String,
    endpoint: EndpointInfo,
    timeout: Duration,
    rate_limit: Arc<Mutex<RateLimitState>>,
    call_semaphore: Arc<Semaphore>,
}

impl HttpLlmClient {
    /// Build a client with default rate-limit bounds (see
    /// [`RateLimitConfig::default`]). Use [`HttpLlmClient::with_rate_limit_config`]
    /// to override backoff bounds and the concurrent-call ceiling.
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        endpoint: EndpointInfo,
        timeout: CallTimeout,
    ) -> Result<Self, LlmError> {
        Self::with_rate_limit_config(api_key, base_url, endpoint, timeout, RateLimitConfig::default())
    }

    /// Build a client with an explicit [`RateLimitConfig`]: its
    /// `max_concurrent_api_calls` bounds in-flight requests via a semaphore,
    /// and `initial_backoff_secs`/`max_backoff_secs` drive the 429 backoff
    /// curve in [`RateLimitState::record_rate_limit`].
    pub fn with_rate_limit_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        endpoint: EndpointInfo,
        timeout: CallTimeout,
        rate_limit_config: RateLimitConfig,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout.0)
            .build()
            .map_err(|e| LlmError::TransportError(e.to_string()))?;

        let call_semaphore = Arc::new(Semaphore::new(rate_limit_config.max_concurrent_api_calls));

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
            endpoint,
            timeout: timeout.0,
            rate_limit: Arc::new(Mutex::new(RateLimitState::with_config(rate_limit_config))),
            call_semaphore,
        })
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.endpoint.model_id,
            "messages": messages_json(&request.messages),
            "temperature": request.sampling.temperature,
            "top_p": request.sampling.top_p,
            "max_tokens": request.sampling.max_output_tokens,
            "stream": stream,
        });
        if !request.sampling.stop_sequences.is_empty() {
            body["stop"] = json!(request.sampling.stop_sequences);
        }
        body
    }

    async fn post(&self, body: Value) -> Result<reqwest::Response, LlmError> {
        let _permit = self.call_semaphore.acquire().await.expect("semaphore never closed");

        let backoff = self.rate_limit.lock().await.remaining_backoff();
        if let Some(remaining) = backoff {
            tracing::warn!(wait_secs = remaining.as_secs(), "waiting out active rate limit backoff before sending");
            tokio::time::sleep(remaining).await;
        }

        let response = self
            .client
            .post(self.chat_completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::TransportError(format!("timed out after {:?}", self.timeout))
                } else {
                    LlmError::TransportError(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(30);
            self.rate_limit.lock().await.record_rate_limit(Duration::from_secs(retry_after));
        }

        if !status.is_success() {
            let status_code = status.as_u16();
            let body_text = response.text().await.unwrap_or_default();
            if looks_like_context_overflow(status_code, &body_text) {
                return Err(LlmError::ContextOverflow);
            }
            return Err(LlmError::UpstreamError { status: status_code, message: body_text });
        }

        self.rate_limit.lock().await.record_success();
        Ok(response)
    }

    fn parse_completion(&self, body: Value) -> Result<CompletionResponse, LlmError> {
        let content = body["choices"][0]["message"]["content"].as_str().map(str::to_string);
        let content = content.ok_or(LlmError::EmptyResponse)?;
        if content.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        let finish_reason = body["choices"][0]["finish_reason"].as_str().unwrap_or("stop");
        let stop_reason = match finish_reason {
            "length" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            _ => StopReason::EndTurn,
        };

        let usage = Usage::new(
            body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        );

        Ok(CompletionResponse { content, stop_reason, usage })
    }
}

#[async_trait]
impl LlmCapability for HttpLlmClient {
    fn endpoint_info(&self) -> &EndpointInfo {
        &self.endpoint
    }

    async fn invoke(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.build_body(&request, false);
        let response = self.post(body).await?;
        let parsed: Value = response.json().await.map_err(|e| LlmError::TransportError(e.to_string()))?;
        self.parse_completion(parsed)
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError> {
        let body = self.build_body(&request, true);
        let request_builder = self.client.post(self.chat_completions_url()).bearer_auth(&self.api_key).json(&body);

        let mut source = EventSource::new(request_builder).map_err(|e| LlmError::TransportError(e.to_string()))?;
        let mut full_text = String::new();

        loop {
            match source.next().await {
                None => break,
                Some(Ok(SseEvent::Open)) => continue,
                Some(Ok(SseEvent::Message(message))) => {
                    if let Some(StreamChunk::Text(text)) = parse_sse_data(&message.data) {
                        full_text.push_str(&text);
                        if chunk_tx.send(StreamChunk::Text(text)).await.is_err() {
                            // Consumer dropped the receiver: stop pulling from upstream.
                            source.close();
                            return Err(LlmError::TransportError("stream consumer disconnected".to_string()));
                        }
                    }
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) => break,
                Some(Err(e)) => {
                    source.close();
                    return Err(LlmError::TransportError(e.to_string()));
                }
            }
        }

        if full_text.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        let _ = chunk_tx.send(StreamChunk::Done).await;
        Ok(CompletionResponse {
            content: full_text,
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
        })
    }

    async fn invoke_structured(&self, prompt: &str, schema: &Value, sampling: &SamplingParams) -> Result<Value, LlmError> {
        let structured_prompt = format!(
            "{prompt}\n\n---\nRespond with a single valid JSON object that strictly matches this JSON Schema. \
             Do not include any text or markdown outside the JSON object.\n\nJSON Schema:\n{}",
            serde_json::to_string_pretty(schema).unwrap_or_default()
        );

        let request = CompletionRequest::new(structured_prompt, sampling.clone());
        let mut body = self.build_body(&request, false);
        body["response_format"] = json!({ "type": "json_object" });

        let response = self.post(body).await?;
        let parsed: Value = response.json().await.map_err(|e| LlmError::TransportError(e.to_string()))?;
        let content = parsed["choices"][0]["message"]["content"].as_str().ok_or(LlmError::EmptyResponse)?;
        if content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        serde_json::from_str(content).map_err(|e| LlmError::SchemaViolation(e.to_string()))
    }
}
