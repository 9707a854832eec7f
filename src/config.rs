//! Layered configuration (A3): defaults, an optional YAML file, then
//! environment variable overrides for credentials and endpoint URLs.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::llm::SamplingParams;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: serde_yaml::Error },
    #[error("missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("endpoint '{0}' referenced by task mapping is not defined")]
    UnknownEndpoint(String),
}

/// One named LLM endpoint's connection details. `api_key_env`/`base_url_env`
/// name the environment variables credentials and the base URL are sourced
/// from at load time, keeping secrets out of the config file itself.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub model_id: String,
    pub api_key_env: String,
    pub base_url_env: String,
    pub max_context_tokens: usize,
}

/// Resolved endpoint with credentials pulled from the environment.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub model_id: String,
    pub api_key: String,
    pub base_url: String,
    pub max_context_tokens: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskToEndpointMapping {
    pub planner: String,
    pub non_retrieval_responder: String,
    pub reranker: String,
    pub answer_generator: String,
    pub summarizer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenManagementConfig {
    #[serde(default = "default_reservation_tokens")]
    pub reservation_tokens: usize,
    #[serde(default = "default_history_fraction")]
    pub history_fraction: f64,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,
}

fn default_reservation_tokens() -> usize {
    512
}
fn default_history_fraction() -> f64 {
    0.5
}
fn default_chars_per_token() -> f64 {
    4.0
}

impl Default for TokenManagementConfig {
    fn default() -> Self {
        Self {
            reservation_tokens: default_reservation_tokens(),
            history_fraction: default_history_fraction(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrieverSettings {
    pub shard_collections: Vec<String>,
    pub passage_collection: String,
    #[serde(default = "default_top_k")]
    pub top_k_per_shard: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_k_rrf")]
    pub k_rrf: f64,
    #[serde(default = "default_passage_id_key")]
    pub passage_id_meta_key: String,
}

fn default_top_k() -> usize {
    10
}
fn default_max_results() -> usize {
    20
}
fn default_k_rrf() -> f64 {
    60.0
}
fn default_passage_id_key() -> String {
    "passage_id".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RerankerSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency_limit: usize,
    #[serde(default = "default_relevance_threshold")]
    pub relevance_score_threshold: u8,
}

fn default_concurrency() -> usize {
    5
}
fn default_relevance_threshold() -> u8 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRefinementSettings {
    #[serde(default = "default_similarity_cutoff")]
    pub score_cutoff: f64,
}

fn default_similarity_cutoff() -> f64 {
    0.8
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSettings {
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

fn default_history_window() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResponseTemplates {
    #[serde(default = "default_plan_generation_failed")]
    pub plan_generation_failed: String,
    #[serde(default = "default_no_passages_found")]
    pub no_passages_found: String,
    #[serde(default = "default_error_fallback")]
    pub error_fallback: String,
    #[serde(default = "default_services_unavailable")]
    pub services_unavailable: String,
}

fn default_plan_generation_failed() -> String {
    "দুঃখিত, আপনার প্রশ্নটি বুঝতে সমস্যা হয়েছে। আবার চেষ্টা করুন।".to_string()
}
fn default_no_passages_found() -> String {
    "দুঃখিত, এই বিষয়ে আমার কাছে কোনো তথ্য নেই।".to_string()
}
fn default_error_fallback() -> String {
    "দুঃখিত, একটি অপ্রত্যাশিত সমস্যা হয়েছে।".to_string()
}
fn default_services_unavailable() -> String {
    "দুঃখিত, সার্ভিসটি এই মুহূর্তে উপলব্ধ নয়।".to_string()
}

impl ResponseTemplates {
    fn with_defaults_applied(mut self) -> Self {
        if self.plan_generation_failed.is_empty() {
            self.plan_generation_failed = default_plan_generation_failed();
        }
        if self.no_passages_found.is_empty() {
            self.no_passages_found = default_no_passages_found();
        }
        if self.error_fallback.is_empty() {
            self.error_fallback = default_error_fallback();
        }
        if self.services_unavailable.is_empty() {
            self.services_unavailable = default_services_unavailable();
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentIdentity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub story: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SamplingConfig {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

impl SamplingConfig {
    pub fn into_params(self) -> SamplingParams {
        let defaults = SamplingParams::default();
        SamplingParams {
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            max_output_tokens: self.max_output_tokens.unwrap_or(defaults.max_output_tokens),
            stop_sequences: self.stop_sequences,
        }
    }
}

/// Raw, deserialized configuration shape: defaults merged with whatever an
/// optional YAML file supplies. Credentials are resolved from the
/// environment in a second pass via [`OrchestratorConfig::resolve`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfig {
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
    pub task_to_endpoint: Option<TaskToEndpointMapping>,
    #[serde(default)]
    pub token_management: TokenManagementConfig,
    pub retriever: Option<RetrieverSettings>,
    #[serde(default)]
    pub reranker: RerankerSettings,
    #[serde(default)]
    pub category_refinement: CategoryRefinementSettings,
    #[serde(default)]
    pub conversation: ConversationSettings,
    #[serde(default)]
    pub sampling: HashMap<String, SamplingConfig>,
    #[serde(default)]
    pub response_templates: ResponseTemplates,
    #[serde(default)]
    pub agent: AgentIdentity,
    #[serde(default)]
    pub category_vocabulary: Vec<String>,
}

impl Default for RerankerSettings {
    fn default() -> Self {
        Self { concurrency_limit: default_concurrency(), relevance_score_threshold: default_relevance_threshold() }
    }
}

impl Default for CategoryRefinementSettings {
    fn default() -> Self {
        Self { score_cutoff: default_similarity_cutoff() }
    }
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self { history_window: default_history_window() }
    }
}

/// Fully resolved configuration: environment-sourced credentials applied,
/// defaults filled in, ready to build the orchestrator's components.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub endpoints: HashMap<String, ResolvedEndpoint>,
    pub task_to_endpoint: TaskToEndpointMapping,
    pub token_management: TokenManagementConfig,
    pub retriever: RetrieverSettings,
    pub reranker: RerankerSettings,
    pub category_refinement: CategoryRefinementSettings,
    pub conversation: ConversationSettings,
    pub sampling: HashMap<String, SamplingConfig>,
    pub response_templates: ResponseTemplates,
    pub agent: AgentIdentity,
    pub category_vocabulary: Vec<String>,
}

impl OrchestratorConfig {
    /// Load defaults, overlay an optional YAML file at `path` if present,
    /// then resolve credentials from the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let raw = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
                serde_yaml::from_str(&contents)
                    .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?
            }
            None => RawConfig::default(),
        };
        Self::resolve(raw)
    }

    fn resolve(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut endpoints = HashMap::new();
        for (name, cfg) in raw.endpoints {
            let api_key = std::env::var(&cfg.api_key_env).map_err(|_| ConfigError::MissingEnv(cfg.api_key_env.clone()))?;
            let base_url = std::env::var(&cfg.base_url_env).map_err(|_| ConfigError::MissingEnv(cfg.base_url_env.clone()))?;
            endpoints.insert(
                name,
                ResolvedEndpoint { model_id: cfg.model_id, api_key, base_url, max_context_tokens: cfg.max_context_tokens },
            );
        }

        let task_to_endpoint = raw.task_to_endpoint.ok_or_else(|| ConfigError::UnknownEndpoint("task_to_endpoint".to_string()))?;
        for name in [
            &task_to_endpoint.planner,
            &task_to_endpoint.non_retrieval_responder,
            &task_to_endpoint.reranker,
            &task_to_endpoint.answer_generator,
            &task_to_endpoint.summarizer,
        ] {
            if !endpoints.contains_key(name) {
                return Err(ConfigError::UnknownEndpoint(name.clone()));
            }
        }

        let retriever = raw.retriever.unwrap_or_else(|| RetrieverSettings {
            shard_collections: Vec::new(),
            passage_collection: String::new(),
            top_k_per_shard: default_top_k(),
            max_results: default_max_results(),
            k_rrf: default_k_rrf(),
            passage_id_meta_key: default_passage_id_key(),
        });

        Ok(Self {
            endpoints,
            task_to_endpoint,
            token_management: raw.token_management,
            retriever,
            reranker: raw.reranker,
            category_refinement: raw.category_refinement,
            conversation: raw.conversation,
            sampling: raw.sampling,
            response_templates: raw.response_templates.with_defaults_applied(),
            agent: raw.agent,
            category_vocabulary: raw.category_vocabulary,
        })
    }

    pub fn sampling_for(&self, task: &str) -> SamplingParams {
        self.sampling.get(task).cloned().unwrap_or_default().into_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raw() -> RawConfig {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "primary".to_string(),
            EndpointConfig {
                model_id: "gemma-3".to_string(),
                api_key_env: "TEST_COGOPS_API_KEY".to_string(),
                base_url_env: "TEST_COGOPS_BASE_URL".to_string(),
                max_context_tokens: 8192,
            },
        );

        RawConfig {
            endpoints,
            task_to_endpoint: Some(TaskToEndpointMapping {
                planner: "primary".to_string(),
                non_retrieval_responder: "primary".to_string(),
                reranker: "primary".to_string(),
                answer_generator: "primary".to_string(),
                summarizer: "primary".to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn resolve_reads_credentials_from_environment() {
        std::env::set_var("TEST_COGOPS_API_KEY", "secret");
        std::env::set_var("TEST_COGOPS_BASE_URL", "http://localhost:9000");

        let config = OrchestratorConfig::resolve(sample_raw()).unwrap();
        let endpoint = &config.endpoints["primary"];
        assert_eq!(endpoint.api_key, "secret");
        assert_eq!(endpoint.base_url, "http://localhost:9000");
    }

    #[test]
    fn resolve_fails_on_missing_environment_variable() {
        std::env::remove_var("TEST_COGOPS_MISSING_KEY");
        let mut raw = sample_raw();
        raw.endpoints.get_mut("primary").unwrap().api_key_env = "TEST_COGOPS_MISSING_KEY".to_string();

        let result = OrchestratorConfig::resolve(raw);
        assert!(result.is_err());
    }

    #[test]
    fn resolve_fails_when_task_mapping_references_unknown_endpoint() {
        std::env::set_var("TEST_COGOPS_API_KEY", "secret");
        std::env::set_var("TEST_COGOPS_BASE_URL", "http://localhost:9000");

        let mut raw = sample_raw();
        raw.task_to_endpoint.as_mut().unwrap().summarizer = "does_not_exist".to_string();

        let result = OrchestratorConfig::resolve(raw);
        assert!(matches!(result, Err(ConfigError::UnknownEndpoint(_))));
    }

    #[test]
    fn response_templates_fall_back_to_defaults_when_empty() {
        let templates = ResponseTemplates::default().with_defaults_applied();
        assert!(!templates.plan_generation_failed.is_empty());
        assert!(!templates.no_passages_found.is_empty());
    }

    #[test]
    fn sampling_for_unknown_task_returns_defaults() {
        std::env::set_var("TEST_COGOPS_API_KEY", "secret");
        std::env::set_var("TEST_COGOPS_BASE_URL", "http://localhost:9000");
        let config = OrchestratorConfig::resolve(sample_raw()).unwrap();
        let sampling = config.sampling_for("nonexistent_task");
        assert_eq!(sampling.temperature, SamplingParams::default().temperature);
    }
}
