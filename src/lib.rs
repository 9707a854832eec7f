//! A conversational retrieval-augmented query orchestrator for Bangladesh
//! government services: classifies intent, retrieves and reranks candidate
//! passages, synthesizes a grounded streamed answer, and maintains a
//! bounded conversational memory.

pub mod config;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod planner;
pub mod reranker;
pub mod retriever;
pub mod router;
pub mod token;

pub use error::{OrchestratorError, Result};
pub use orchestrator::{ConversationMemory, ConversationOrchestrator, Event};
pub use planner::{Category, IntentKind, QueryPlan, QueryPlanner};
pub use reranker::{ParallelReranker, RankedPassage, RerankerConfig};
pub use retriever::{CandidatePassage, EmbeddingCapability, RetrieverConfig, VectorRetriever, VectorStoreCapability};
pub use router::{route, Branch};
pub use token::{PassageForPrompt, PromptSlots, TokenAccountant, TokenCounter, WhitespaceTokenCounter};
