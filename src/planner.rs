//! Query planning (C5): classifies a user query into one of the closed
//! intent kinds and emits a structured plan with the fields that kind
//! permits.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use crate::llm::{LlmCapability, LlmError, SamplingParams};

const PLANNER_SCHEMA_DESCRIPTION: &str = r#"{
  "type": "object",
  "properties": {
    "kind": {
      "type": "string",
      "enum": ["in_domain", "out_of_domain", "general_knowledge", "chitchat",
               "ambiguous", "abusive", "identity", "malicious", "unhandled"]
    },
    "search_query": {"type": ["string", "null"]},
    "clarification": {"type": ["string", "null"]},
    "category": {"type": ["string", "null"]}
  },
  "required": ["kind"]
}"#;

/// The closed intent vocabulary a query is classified into. Nine values:
/// the superset of the two divergent sets observed in the source material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    InDomain,
    OutOfDomain,
    GeneralKnowledge,
    Chitchat,
    Ambiguous,
    Abusive,
    Identity,
    Malicious,
    Unhandled,
}

impl IntentKind {
    /// Every kind other than `in_domain` and `ambiguous` routes to the
    /// non-retrieval responder (C6).
    pub fn is_non_retrieval(&self) -> bool {
        !matches!(self, IntentKind::InDomain | IntentKind::Ambiguous)
    }
}

/// A category name drawn from a configured closed vocabulary. Not
/// hard-coded in the core; validated by the caller against configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category(pub String);

/// The plan emitted by the planner for one turn. Field presence is
/// determined solely by `kind`.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub kind: IntentKind,
    pub search_query: Option<String>,
    pub clarification: Option<String>,
    pub category: Option<Category>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    kind: IntentKind,
    search_query: Option<String>,
    clarification: Option<String>,
    category: Option<String>,
}

impl From<RawPlan> for QueryPlan {
    fn from(raw: RawPlan) -> Self {
        Self {
            kind: raw.kind,
            search_query: raw.search_query,
            clarification: raw.clarification,
            category: raw.category.map(Category),
        }
    }
}

/// Error surfaced when the planner's structured call fails or the result
/// doesn't match the expected schema. The caller substitutes a canned
/// response; the planner itself does not retry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("plan generation failed: {0}")]
pub struct PlanError(pub String);

impl From<LlmError> for PlanError {
    fn from(err: LlmError) -> Self {
        PlanError(err.to_string())
    }
}

const PLANNER_PROMPT_TEMPLATE: &str = "\
You are a retrieval-decision specialist for a Bangladesh government services assistant. \
Classify the user's query into exactly one intent kind and emit the fields that kind requires.

Available service categories:
{available_services}

Intent kinds: in_domain, out_of_domain, general_knowledge, chitchat, ambiguous, abusive, identity, \
malicious, unhandled.

- in_domain: requires `search_query` and `category`; `clarification` must be null.
- ambiguous: requires `clarification`; `search_query` and `category` must be null.
- every other kind: all three optional fields must be null.

Conversation history:
{history_str}

User query:
{user_query}

Respond with a single JSON object.";

pub struct QueryPlanner {
    llm: Arc<dyn LlmCapability>,
    sampling: SamplingParams,
    available_services: String,
}

impl QueryPlanner {
    pub fn new(llm: Arc<dyn LlmCapability>, sampling: SamplingParams, available_services: String) -> Self {
        Self { llm, sampling, available_services }
    }

    /// Classify `user_query` given the verbatim history formatting (not the
    /// summarized log) to maximize coreference-resolution context.
    pub async fn plan(&self, history_text: &str, user_query: &str) -> Result<QueryPlan, PlanError> {
        let prompt = PLANNER_PROMPT_TEMPLATE
            .replace("{available_services}", &self.available_services)
            .replace("{history_str}", history_text)
            .replace("{user_query}", user_query);

        let schema: serde_json::Value = serde_json::from_str(PLANNER_SCHEMA_DESCRIPTION).expect("static schema is valid JSON");
        let value = self.llm.invoke_structured(&prompt, &schema, &self.sampling).await?;

        let raw: RawPlan = serde_json::from_value(value).map_err(|e| PlanError(e.to_string()))?;
        let plan: QueryPlan = raw.into();

        match plan.kind {
            IntentKind::InDomain if plan.search_query.is_none() => {
                Err(PlanError("in_domain plan is missing search_query".to_string()))
            }
            IntentKind::Ambiguous if plan.clarification.is_none() => {
                Err(PlanError("ambiguous plan is missing clarification".to_string()))
            }
            _ => Ok(plan),
        }
    }
}
