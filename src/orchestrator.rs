//! Conversation orchestration (C7): drives one turn end-to-end, emitting a
//! typed event stream and mutating the dual history buffers.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use strsim::jaro_winkler;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{AgentIdentity, ResponseTemplates};
use crate::error::OrchestratorError;
use crate::llm::{CompletionRequest, LlmCapability, SamplingParams, StreamChunk};
use crate::planner::{IntentKind, QueryPlan, QueryPlanner};
use crate::reranker::{ParallelReranker, RankedPassage};
use crate::retriever::VectorRetriever;
use crate::router::{self, Branch};
use crate::token::{PromptSlots, TokenAccountant};

/// A tagged value streamed from the orchestrator to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    AnswerChunk(String),
    FinalData { sources: Vec<String> },
    Error(String),
}

/// Two parallel ordered sequences of `(user_utterance, assistant_reply)`:
/// the verbatim log (exact assistant output) and the summarized log (a
/// short summary). Always mutated together so they stay the same length.
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    verbatim: VecDeque<(String, String)>,
    summarized: VecDeque<(String, String)>,
    window: usize,
}

impl ConversationMemory {
    pub fn new(window: usize) -> Self {
        Self { verbatim: VecDeque::new(), summarized: VecDeque::new(), window }
    }

    /// Append one turn to both logs and trim from the front if either
    /// exceeds the configured window. Never called on an errored turn.
    pub fn append(&mut self, user_query: &str, verbatim_reply: &str, summarized_reply: &str) {
        self.verbatim.push_back((user_query.to_string(), verbatim_reply.to_string()));
        self.summarized.push_back((user_query.to_string(), summarized_reply.to_string()));
        while self.verbatim.len() > self.window {
            self.verbatim.pop_front();
        }
        while self.summarized.len() > self.window {
            self.summarized.pop_front();
        }
    }

    pub fn verbatim_pairs(&self) -> Vec<(String, String)> {
        self.verbatim.iter().cloned().collect()
    }

    pub fn summarized_pairs(&self) -> Vec<(String, String)> {
        self.summarized.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.verbatim.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verbatim.is_empty()
    }

    fn format_verbatim(&self) -> String {
        if self.verbatim.is_empty() {
            return "No conversation history yet.".to_string();
        }
        self.verbatim.iter().map(|(u, a)| format!("User: {u}\nAI: {a}")).collect::<Vec<_>>().join("\n---\n")
    }
}

const SYNTHESIS_PROMPT_TEMPLATE: &str = "\
You are a helpful assistant for Bangladesh government services. Using only the passages below, \
answer the user's query in Bengali. If the passages don't fully answer it, say what you do know.

CONVERSATION HISTORY:
{history_str}

USER QUERY:
{user_query}

RELEVANT PASSAGES:
{passages_context}

ANSWER (in Bengali):";

const NON_RETRIEVAL_PROMPT_TEMPLATE: &str = "\
You are {agent_name}, {agent_story}

{instruction}

CONVERSATION HISTORY:
{history_str}

USER QUERY:
{user_query}

RESPONSE:";

const PIVOT_PROMPT_TEMPLATE: &str = "\
You are a polite assistant for Bangladesh government services. You could not find a precise answer \
to the user's query. Acknowledge that, then suggest 2-3 related topics from the identified category \
that you can help with, and invite a follow-up question. Respond in Bengali, starting with \
\"দুঃখিত, আমি এই বিষয়ে সাহায্য করতে পারছি না।\"

CONVERSATION HISTORY:
{history_str}

USER QUERY:
{user_query}

IDENTIFIED CATEGORY:
{category}

AVAILABLE SERVICES:
{service_data}

RESPONSE (in Bengali):";

const SUMMARY_PROMPT_TEMPLATE: &str = "\
Summarize the following exchange in 1-2 sentences, in the same language as the answer.

USER QUERY:
{user_query}

ASSISTANT ANSWER:
{final_answer}

SUMMARY:";

/// Everything the orchestrator needs to drive a turn. Owns the LLM
/// capability instances, the retriever, the reranker, and the history
/// logs; the reranker only holds a non-owning reference to its judge LLM.
pub struct ConversationOrchestrator {
    planner: QueryPlanner,
    retriever: VectorRetriever,
    reranker: ParallelReranker,
    non_retrieval_llm: Arc<dyn LlmCapability>,
    answer_llm: Arc<dyn LlmCapability>,
    summarizer_llm: Arc<dyn LlmCapability>,
    token_accountant: Arc<TokenAccountant>,
    category_vocabulary: Vec<String>,
    category_cutoff: f64,
    relevance_threshold: u8,
    response_templates: ResponseTemplates,
    agent: AgentIdentity,
    service_data: String,
    non_retrieval_sampling: SamplingParams,
    answer_sampling: SamplingParams,
    summarizer_sampling: SamplingParams,
    memory: Mutex<ConversationMemory>,
}

#[allow(clippy::too_many_arguments)]
impl ConversationOrchestrator {
    pub fn new(
        planner: QueryPlanner,
        retriever: VectorRetriever,
        reranker: ParallelReranker,
        non_retrieval_llm: Arc<dyn LlmCapability>,
        answer_llm: Arc<dyn LlmCapability>,
        summarizer_llm: Arc<dyn LlmCapability>,
        token_accountant: Arc<TokenAccountant>,
        category_vocabulary: Vec<String>,
        category_cutoff: f64,
        relevance_threshold: u8,
        response_templates: ResponseTemplates,
        agent: AgentIdentity,
        service_data: String,
        non_retrieval_sampling: SamplingParams,
        answer_sampling: SamplingParams,
        summarizer_sampling: SamplingParams,
        history_window: usize,
    ) -> Self {
        Self {
            planner,
            retriever,
            reranker,
            non_retrieval_llm,
            answer_llm,
            summarizer_llm,
            token_accountant,
            category_vocabulary,
            category_cutoff,
            relevance_threshold,
            response_templates,
            agent,
            service_data,
            non_retrieval_sampling,
            answer_sampling,
            summarizer_sampling,
            memory: Mutex::new(ConversationMemory::new(history_window)),
        }
    }

    /// Snapshot of the verbatim log, for tests and external inspection.
    pub async fn history_len(&self) -> usize {
        self.memory.lock().await.len()
    }

    pub async fn verbatim_pairs(&self) -> Vec<(String, String)> {
        self.memory.lock().await.verbatim_pairs()
    }

    pub async fn summarized_pairs(&self) -> Vec<(String, String)> {
        self.memory.lock().await.summarized_pairs()
    }

    /// Fuzzy-match `raw_category` against the closed category vocabulary;
    /// return the best match if its similarity clears the configured
    /// cutoff, otherwise `None` (no metadata filter applied).
    fn refine_category(&self, raw_category: &str) -> Option<String> {
        self.category_vocabulary
            .iter()
            .map(|candidate| (candidate, jaro_winkler(raw_category, candidate)))
            .filter(|(_, score)| *score >= self.category_cutoff)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(candidate, _)| candidate.clone())
    }

    async fn stream_text(
        &self,
        llm: &Arc<dyn LlmCapability>,
        prompt: String,
        sampling: SamplingParams,
        cancellation: &CancellationToken,
        events_tx: &mpsc::Sender<Event>,
    ) -> Result<String, OrchestratorError> {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(32);
        let request = CompletionRequest { messages: vec![crate::llm::Message::user(prompt)], sampling };

        let llm = llm.clone();
        let stream_task = tokio::spawn(async move { llm.stream(request, chunk_tx).await });

        let mut full_text = String::new();
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    stream_task.abort();
                    return Err(OrchestratorError::Cancelled);
                }
                chunk = chunk_rx.recv() => {
                    match chunk {
                        Some(StreamChunk::Text(text)) => {
                            full_text.push_str(&text);
                            if events_tx.send(Event::AnswerChunk(text)).await.is_err() {
                                stream_task.abort();
                                return Ok(full_text);
                            }
                        }
                        Some(StreamChunk::Done) | None => break,
                    }
                }
            }
        }

        match stream_task.await {
            Ok(Ok(response)) => {
                info!(input_tokens = response.usage.input_tokens, output_tokens = response.usage.output_tokens, "stream completed");
                Ok(full_text)
            }
            Ok(Err(err)) if !full_text.is_empty() => {
                warn!(error = %err, "stream ended with error after partial output");
                Ok(full_text)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(OrchestratorError::TransportError("stream task cancelled".to_string())),
        }
    }

    async fn stream_clarification(&self, clarification: &str, cancellation: &CancellationToken, events_tx: &mpsc::Sender<Event>) -> bool {
        for ch in clarification.chars() {
            if cancellation.is_cancelled() {
                return false;
            }
            if events_tx.send(Event::AnswerChunk(ch.to_string())).await.is_err() {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    fn sources_for(&self, passages: &[RankedPassage]) -> Vec<String> {
        let mut urls: HashSet<String> = HashSet::new();
        let mut ids: HashSet<String> = HashSet::new();
        for passage in passages {
            if let Some(url) = passage.metadata.get("url") {
                urls.insert(url.clone());
            }
            ids.insert(passage.passage_id.to_string());
        }
        let mut sorted_urls: Vec<String> = urls.into_iter().collect();
        sorted_urls.sort();
        let mut sorted_ids: Vec<String> = ids.into_iter().collect();
        sorted_ids.sort();
        sorted_urls.into_iter().chain(sorted_ids).collect()
    }

    async fn summarize(&self, user_query: &str, final_answer: &str) -> String {
        let prompt = SUMMARY_PROMPT_TEMPLATE.replace("{user_query}", user_query).replace("{final_answer}", final_answer);
        let request = CompletionRequest::new(prompt, self.summarizer_sampling.clone());
        match self.summarizer_llm.invoke(request).await {
            Ok(response) => {
                info!(input_tokens = response.usage.input_tokens, output_tokens = response.usage.output_tokens, "summarizer call completed");
                response.content
            }
            Err(err) => {
                warn!(error = %err, "summarizer call failed, falling back to the full answer as the summary");
                final_answer.to_string()
            }
        }
    }

    #[instrument(skip(self, cancellation, events_tx), fields(query_len = user_query.len()))]
    async fn run_turn(&self, user_query: String, cancellation: CancellationToken, events_tx: mpsc::Sender<Event>) {
        if cancellation.is_cancelled() {
            return;
        }

        let history_text = self.memory.lock().await.format_verbatim();

        let plan: QueryPlan = match self.planner.plan(&history_text, &user_query).await {
            Ok(plan) => plan,
            Err(err) => {
                let err: OrchestratorError = err.into();
                warn!(error = %err, "plan generation failed");
                let _ = events_tx.send(Event::Error(self.response_templates.plan_generation_failed.clone())).await;
                return;
            }
        };

        info!(kind = ?plan.kind, "plan generated");

        match router::route(&plan) {
            Branch::Clarifying(clarification) => {
                if !self.stream_clarification(&clarification, &cancellation, &events_tx).await || cancellation.is_cancelled() {
                    return;
                }
                let mut memory = self.memory.lock().await;
                memory.append(&user_query, &clarification, &clarification);
            }
            Branch::NonRetrieval(kind) => {
                self.run_non_retrieval(user_query, kind, &history_text, cancellation, events_tx).await;
            }
            Branch::Retrieval => {
                self.run_retrieval(user_query, plan, &history_text, cancellation, events_tx).await;
            }
        }
    }

    async fn run_non_retrieval(
        &self,
        user_query: String,
        kind: IntentKind,
        history_text: &str,
        cancellation: CancellationToken,
        events_tx: mpsc::Sender<Event>,
    ) {
        let prompt = NON_RETRIEVAL_PROMPT_TEMPLATE
            .replace("{agent_name}", &self.agent.name)
            .replace("{agent_story}", &self.agent.story)
            .replace("{instruction}", router::non_retrieval_instruction(kind))
            .replace("{history_str}", history_text)
            .replace("{user_query}", &user_query);

        match self
            .stream_text(&self.non_retrieval_llm, prompt, self.non_retrieval_sampling.clone(), &cancellation, &events_tx)
            .await
        {
            Ok(answer) if !cancellation.is_cancelled() => {
                let mut memory = self.memory.lock().await;
                memory.append(&user_query, &answer, &answer);
            }
            Ok(_) => {}
            Err(OrchestratorError::Cancelled) => {}
            Err(err) => {
                let _ = events_tx.send(Event::Error(self.response_templates.services_unavailable.clone())).await;
                warn!(error = %err, "non-retrieval responder failed");
            }
        }
    }

    async fn run_retrieval(
        &self,
        user_query: String,
        plan: QueryPlan,
        history_text: &str,
        cancellation: CancellationToken,
        events_tx: mpsc::Sender<Event>,
    ) {
        let search_query = plan.search_query.clone().unwrap_or_default();
        let refined_category = plan.category.as_ref().and_then(|c| self.refine_category(&c.0));
        let filter = refined_category.as_ref().map(|c| {
            let mut m = std::collections::HashMap::new();
            m.insert("category".to_string(), c.clone());
            m
        });

        if cancellation.is_cancelled() {
            return;
        }

        let candidates = match self.retriever.retrieve(&search_query, filter, &cancellation).await {
            Ok(candidates) => candidates,
            Err(crate::retriever::RetrieverError::Cancelled) => return,
            Err(err) => {
                let err: OrchestratorError = err.into();
                warn!(error = %err, "retrieval failed");
                let _ = events_tx.send(Event::Error(self.response_templates.services_unavailable.clone())).await;
                return;
            }
        };

        if candidates.is_empty() {
            let text = self.response_templates.no_passages_found.clone();
            let _ = events_tx.send(Event::AnswerChunk(text)).await;
            return;
        }

        if cancellation.is_cancelled() {
            return;
        }

        let verbatim_history = self.memory.lock().await.verbatim_pairs();
        let ranked = self.reranker.rerank(&verbatim_history, &user_query, &search_query, &candidates, &cancellation).await;

        if cancellation.is_cancelled() {
            return;
        }

        let mut relevant: Vec<RankedPassage> = ranked.into_iter().filter(|p| p.score <= self.relevance_threshold).collect();
        relevant.sort_by(|a, b| a.score.cmp(&b.score).then_with(|| a.passage_id.cmp(&b.passage_id)));

        if relevant.is_empty() {
            self.run_pivot(user_query, history_text, refined_category, cancellation, events_tx).await;
            return;
        }

        self.run_synthesis(user_query, relevant, cancellation, events_tx).await;
    }

    async fn run_pivot(
        &self,
        user_query: String,
        history_text: &str,
        category: Option<String>,
        cancellation: CancellationToken,
        events_tx: mpsc::Sender<Event>,
    ) {
        let prompt = PIVOT_PROMPT_TEMPLATE
            .replace("{history_str}", history_text)
            .replace("{user_query}", &user_query)
            .replace("{category}", category.as_deref().unwrap_or(""))
            .replace("{service_data}", &self.service_data);

        match self
            .stream_text(&self.non_retrieval_llm, prompt, self.non_retrieval_sampling.clone(), &cancellation, &events_tx)
            .await
        {
            Ok(answer) if !cancellation.is_cancelled() => {
                let mut memory = self.memory.lock().await;
                memory.append(&user_query, &answer, &answer);
            }
            Ok(_) => {}
            Err(OrchestratorError::Cancelled) => {}
            Err(err) => {
                let _ = events_tx.send(Event::Error(self.response_templates.services_unavailable.clone())).await;
                warn!(error = %err, "pivot response failed");
            }
        }
    }

    async fn run_synthesis(
        &self,
        user_query: String,
        relevant: Vec<RankedPassage>,
        cancellation: CancellationToken,
        events_tx: mpsc::Sender<Event>,
    ) {
        let summarized_history = self.memory.lock().await.summarized_pairs();
        let passages = relevant
            .iter()
            .map(|p| crate::token::PassageForPrompt { id: p.passage_id.to_string(), document: p.document.clone() })
            .collect();

        let prompt = self.token_accountant.build_prompt(
            SYNTHESIS_PROMPT_TEMPLATE,
            self.answer_llm.endpoint_info().max_context_tokens,
            PromptSlots::default().with_fixed("user_query", &user_query).with_history(summarized_history).with_passages(passages),
        );

        let answer = match self.stream_text(&self.answer_llm, prompt, self.answer_sampling.clone(), &cancellation, &events_tx).await {
            Ok(answer) => answer,
            Err(OrchestratorError::Cancelled) => return,
            Err(err) => {
                let _ = events_tx.send(Event::Error(self.response_templates.services_unavailable.clone())).await;
                warn!(error = %err, "answer synthesis failed");
                return;
            }
        };

        if cancellation.is_cancelled() {
            return;
        }

        let sources = self.sources_for(&relevant);
        if events_tx.send(Event::FinalData { sources }).await.is_err() {
            return;
        }

        let summary = self.summarize(&user_query, &answer).await;

        let mut memory = self.memory.lock().await;
        memory.append(&user_query, &answer, &summary);
    }

    /// Drive one turn end-to-end, returning a stream of events. Internally
    /// spawns the turn as a background task so the first `answer_chunk`
    /// can be emitted as soon as it arrives, without buffering the full
    /// answer.
    pub fn process_query(self: &Arc<Self>, user_query: String, cancellation: CancellationToken) -> ReceiverStream<Event> {
        let (events_tx, events_rx) = mpsc::channel(64);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_turn(user_query, cancellation, events_tx).await;
        });
        ReceiverStream::new(events_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_append_keeps_logs_in_sync() {
        let mut memory = ConversationMemory::new(3);
        memory.append("q1", "a1", "s1");
        memory.append("q2", "a2", "s2");
        assert_eq!(memory.verbatim_pairs().len(), memory.summarized_pairs().len());
    }

    #[test]
    fn memory_trims_from_the_front_when_over_window() {
        let mut memory = ConversationMemory::new(2);
        memory.append("q1", "a1", "s1");
        memory.append("q2", "a2", "s2");
        memory.append("q3", "a3", "s3");
        let pairs = memory.verbatim_pairs();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "q2");
        assert_eq!(pairs[1].0, "q3");
    }

    #[test]
    fn empty_memory_formats_as_placeholder() {
        let memory = ConversationMemory::new(5);
        assert_eq!(memory.format_verbatim(), "No conversation history yet.");
    }

    #[test]
    fn format_verbatim_renders_turns() {
        let mut memory = ConversationMemory::new(5);
        memory.append("hello", "hi there", "greeting");
        assert!(memory.format_verbatim().contains("User: hello"));
        assert!(memory.format_verbatim().contains("AI: hi there"));
    }
}
