//! Parallel reranking (C4): scores candidate passages against the user's
//! intent with a judge LLM, bounded by a concurrency semaphore, tolerant of
//! per-passage failures and context overflow.

use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::llm::{LlmCapability, LlmError, SamplingParams};
use crate::retriever::CandidatePassage;
use crate::token::{PromptSlots, TokenAccountant};

const RERANK_PROMPT_TEMPLATE: &str = "\
You are an expert relevance evaluation assistant. Determine whether PASSAGE is relevant for \
answering the user's intent, given the conversation history and the search query used for retrieval.

Score 1 if the passage directly and completely answers the query, 2 if it is on-topic but partial, \
3 if it is unrelated.

CONVERSATION HISTORY:
{history_str}

USER QUERY:
{user_query}

SEARCH QUERY:
{search_query}

PASSAGE TO EVALUATE:
{passage_text}
---
Respond with JSON: {{\"score\": 1|2|3, \"reasoning\": \"...\"}}";

const JUDGE_SCHEMA_DESCRIPTION: &str = r#"{"type":"object","properties":{"score":{"type":"integer","enum":[1,2,3]},"reasoning":{"type":"string"}},"required":["score","reasoning"]}"#;

/// A candidate passage after judging, extending [`CandidatePassage`] with a
/// relevance score and the judge's justification.
#[derive(Debug, Clone)]
pub struct RankedPassage {
    pub passage_id: i64,
    pub document: String,
    pub metadata: std::collections::HashMap<String, String>,
    pub score: u8,
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct JudgeScore {
    score: u8,
    reasoning: String,
}

pub struct RerankerConfig {
    pub concurrency_limit: usize,
    pub sampling: SamplingParams,
    /// Metadata key carrying the stable passage id, falling back to the
    /// shard-returned id when absent from a passage's metadata.
    pub passage_id_meta_key: String,
}

pub struct ParallelReranker {
    judge: Arc<dyn LlmCapability>,
    semaphore: Arc<Semaphore>,
    token_accountant: Arc<TokenAccountant>,
    sampling: SamplingParams,
    passage_id_meta_key: String,
}

impl ParallelReranker {
    pub fn new(judge: Arc<dyn LlmCapability>, token_accountant: Arc<TokenAccountant>, config: RerankerConfig) -> Self {
        Self {
            judge,
            semaphore: Arc::new(Semaphore::new(config.concurrency_limit)),
            token_accountant,
            sampling: config.sampling,
            passage_id_meta_key: config.passage_id_meta_key,
        }
    }

    async fn score_one(
        &self,
        passage: &CandidatePassage,
        history: &[(String, String)],
        user_query: &str,
        search_query: &str,
    ) -> Option<RankedPassage> {
        let prompt = self.token_accountant.build_prompt(
            RERANK_PROMPT_TEMPLATE,
            self.judge.endpoint_info().max_context_tokens,
            PromptSlots::default()
                .with_fixed("user_query", user_query)
                .with_fixed("search_query", search_query)
                .with_fixed("passage_text", &passage.document)
                .with_history(history.to_vec()),
        );

        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");

        let schema = json!(serde_json::from_str::<serde_json::Value>(JUDGE_SCHEMA_DESCRIPTION).unwrap());
        let passage_id = self.stable_passage_id(passage);

        match self.judge.invoke_structured(&prompt, &schema, &self.sampling).await {
            Ok(value) => match serde_json::from_value::<JudgeScore>(value) {
                Ok(scored) => Some(RankedPassage {
                    passage_id,
                    document: passage.document.clone(),
                    metadata: passage.metadata.clone(),
                    score: scored.score,
                    reasoning: scored.reasoning,
                }),
                Err(err) => {
                    error!(passage_id, error = %err, "judge response did not match expected schema");
                    None
                }
            },
            Err(LlmError::ContextOverflow) => {
                warn!(passage_id, "passage too long to score, degrading to score=3");
                Some(RankedPassage {
                    passage_id,
                    document: passage.document.clone(),
                    metadata: passage.metadata.clone(),
                    score: 3,
                    reasoning: "passage too long to evaluate".to_string(),
                })
            }
            Err(err) => {
                error!(passage_id, error = %err, "could not score passage");
                None
            }
        }
    }

    /// Score every candidate in parallel, bounded by the configured
    /// semaphore. Output is unordered; the caller is responsible for
    /// sorting by score. Races the fan-out against `cancellation`, returning
    /// whatever has been dropped so far (nothing, since scoring only
    /// completes atomically per passage) if cancelled mid-flight.
    pub async fn rerank(
        &self,
        history: &[(String, String)],
        user_query: &str,
        search_query: &str,
        candidates: &[CandidatePassage],
        cancellation: &CancellationToken,
    ) -> Vec<RankedPassage> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let futures = candidates.iter().map(|p| self.score_one(p, history, user_query, search_query));
        tokio::select! {
            _ = cancellation.cancelled() => Vec::new(),
            results = join_all(futures) => results.into_iter().flatten().collect(),
        }
    }

    /// Prefer the stable id carried in metadata (under the configured key);
    /// fall back to the shard-returned `passage_id` when absent.
    fn stable_passage_id(&self, passage: &CandidatePassage) -> i64 {
        passage
            .metadata
            .get(&self.passage_id_meta_key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(passage.passage_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    use crate::llm::{CallTimeout, CompletionRequest, CompletionResponse, EndpointInfo, StreamChunk};
    use crate::token::WhitespaceTokenCounter;

    struct MockJudge {
        endpoint: EndpointInfo,
        behavior: MockBehavior,
    }

    #[derive(Clone)]
    enum MockBehavior {
        Score(u8),
        ContextOverflow,
        Transport,
    }

    #[async_trait]
    impl LlmCapability for MockJudge {
        fn endpoint_info(&self) -> &EndpointInfo {
            &self.endpoint
        }

        async fn invoke(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            unimplemented!("reranker only uses invoke_structured")
        }

        async fn stream(&self, _request: CompletionRequest, _chunk_tx: mpsc::Sender<StreamChunk>) -> Result<CompletionResponse, LlmError> {
            unimplemented!("reranker only uses invoke_structured")
        }

        async fn invoke_structured(
            &self,
            _prompt: &str,
            _schema: &serde_json::Value,
            _sampling: &SamplingParams,
        ) -> Result<serde_json::Value, LlmError> {
            match self.behavior {
                MockBehavior::Score(score) => Ok(json!({ "score": score, "reasoning": "test" })),
                MockBehavior::ContextOverflow => Err(LlmError::ContextOverflow),
                MockBehavior::Transport => Err(LlmError::TransportError("boom".to_string())),
            }
        }
    }

    fn accountant() -> Arc<TokenAccountant> {
        Arc::new(TokenAccountant::new(Box::new(WhitespaceTokenCounter::default()), 50, 0.5))
    }

    fn passage(id: i64) -> CandidatePassage {
        CandidatePassage { shard_id: "s".to_string(), passage_id: id, document: "doc".to_string(), metadata: HashMap::new() }
    }

    fn endpoint() -> EndpointInfo {
        EndpointInfo { model_id: "judge".to_string(), max_context_tokens: 4000 }
    }

    #[tokio::test]
    async fn context_overflow_degrades_to_score_three() {
        let judge: Arc<dyn LlmCapability> = Arc::new(MockJudge { endpoint: endpoint(), behavior: MockBehavior::ContextOverflow });
        let reranker = ParallelReranker::new(
            judge,
            accountant(),
            RerankerConfig { concurrency_limit: 2, sampling: SamplingParams::default(), passage_id_meta_key: "passage_id".to_string() },
        );

        let results = reranker.rerank(&[], "q", "sq", &[passage(1)], &CancellationToken::new()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 3);
        assert_eq!(results[0].reasoning, "passage too long to evaluate");
    }

    #[tokio::test]
    async fn transport_failure_drops_passage_without_aborting_siblings() {
        let judge: Arc<dyn LlmCapability> = Arc::new(MockJudge { endpoint: endpoint(), behavior: MockBehavior::Transport });
        let reranker = ParallelReranker::new(
            judge,
            accountant(),
            RerankerConfig { concurrency_limit: 2, sampling: SamplingParams::default(), passage_id_meta_key: "passage_id".to_string() },
        );

        let results = reranker.rerank(&[], "q", "sq", &[passage(1), passage(2)], &CancellationToken::new()).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn successful_score_is_carried_through() {
        let judge: Arc<dyn LlmCapability> = Arc::new(MockJudge { endpoint: endpoint(), behavior: MockBehavior::Score(1) });
        let reranker = ParallelReranker::new(
            judge,
            accountant(),
            RerankerConfig { concurrency_limit: 4, sampling: SamplingParams::default(), passage_id_meta_key: "passage_id".to_string() },
        );

        let results = reranker.rerank(&[], "q", "sq", &[passage(1), passage(2), passage(3)], &CancellationToken::new()).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|p| p.score == 1));
    }

    fn reranker_with_meta_key(meta_key: &str) -> ParallelReranker {
        let judge: Arc<dyn LlmCapability> = Arc::new(MockJudge { endpoint: endpoint(), behavior: MockBehavior::Score(1) });
        ParallelReranker::new(
            judge,
            accountant(),
            RerankerConfig { concurrency_limit: 1, sampling: SamplingParams::default(), passage_id_meta_key: meta_key.to_string() },
        )
    }

    #[test]
    fn stable_id_prefers_metadata_over_shard_id() {
        let mut metadata = HashMap::new();
        metadata.insert("passage_id".to_string(), "42".to_string());
        let p = CandidatePassage { shard_id: "s".to_string(), passage_id: 1, document: "d".to_string(), metadata };
        assert_eq!(reranker_with_meta_key("passage_id").stable_passage_id(&p), 42);
    }

    #[test]
    fn stable_id_falls_back_to_shard_id_when_metadata_absent() {
        let p = passage(7);
        assert_eq!(reranker_with_meta_key("passage_id").stable_passage_id(&p), 7);
    }

    #[test]
    fn stable_id_reads_the_configured_meta_key() {
        let mut metadata = HashMap::new();
        metadata.insert("source_doc_id".to_string(), "99".to_string());
        let p = CandidatePassage { shard_id: "s".to_string(), passage_id: 1, document: "d".to_string(), metadata };
        assert_eq!(reranker_with_meta_key("source_doc_id").stable_passage_id(&p), 99);
    }
}
