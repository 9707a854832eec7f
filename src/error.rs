//! Error types for the conversation orchestrator.
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::llm::LlmError;
use crate::planner::PlanError;
use crate::retriever::RetrieverError;

/// All error types that can occur while driving a single conversation turn.
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    /// The query planner's structured call failed or returned a plan that
    /// doesn't validate against the expected shape.
    #[error("plan generation failed: {0}")]
    PlanGenerationFailed(String),

    /// Network/timeout failure reaching an LLM endpoint.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An LLM endpoint responded with a non-2xx status.
    #[error("upstream error ({status}): {message}")]
    UpstreamError { status: u16, message: String },

    /// A prompt exceeded an endpoint's context window and could not be
    /// truncated further.
    #[error("context overflow: prompt could not be fit within the endpoint's context window")]
    ContextOverflow,

    /// The vector store or an embedding call failed for every shard.
    #[error("retrieval failed: {0}")]
    RetrievalFailed(String),

    /// The turn was cancelled (client disconnect, shutdown).
    #[error("cancelled")]
    Cancelled,
}

impl From<LlmError> for OrchestratorError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::TransportError(msg) => OrchestratorError::TransportError(msg),
            LlmError::UpstreamError { status, message } => {
                OrchestratorError::UpstreamError { status, message }
            }
            LlmError::ContextOverflow => OrchestratorError::ContextOverflow,
            LlmError::EmptyResponse => {
                OrchestratorError::PlanGenerationFailed("empty response from provider".to_string())
            }
            LlmError::SchemaViolation(msg) => OrchestratorError::PlanGenerationFailed(msg),
        }
    }
}

impl From<PlanError> for OrchestratorError {
    fn from(err: PlanError) -> Self {
        OrchestratorError::PlanGenerationFailed(err.0)
    }
}

impl From<RetrieverError> for OrchestratorError {
    fn from(err: RetrieverError) -> Self {
        match err {
            RetrieverError::Cancelled => OrchestratorError::Cancelled,
            other => OrchestratorError::RetrievalFailed(other.to_string()),
        }
    }
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_generation_failed_message() {
        let err = OrchestratorError::PlanGenerationFailed("missing field intent".to_string());
        assert_eq!(err.to_string(), "plan generation failed: missing field intent");
    }

    #[test]
    fn upstream_error_message() {
        let err = OrchestratorError::UpstreamError { status: 503, message: "busy".to_string() };
        assert_eq!(err.to_string(), "upstream error (503): busy");
    }

    #[test]
    fn llm_transport_error_converts() {
        let err: OrchestratorError = LlmError::TransportError("timed out".to_string()).into();
        assert!(matches!(err, OrchestratorError::TransportError(_)));
    }

    #[test]
    fn llm_context_overflow_converts() {
        let err: OrchestratorError = LlmError::ContextOverflow.into();
        assert!(matches!(err, OrchestratorError::ContextOverflow));
    }

    #[test]
    fn llm_schema_violation_becomes_plan_generation_failed() {
        let err: OrchestratorError = LlmError::SchemaViolation("bad json".to_string()).into();
        assert!(matches!(err, OrchestratorError::PlanGenerationFailed(_)));
    }

    #[test]
    fn plan_error_becomes_plan_generation_failed() {
        let err: OrchestratorError = PlanError("missing field intent".to_string()).into();
        assert!(matches!(err, OrchestratorError::PlanGenerationFailed(_)));
    }

    #[test]
    fn retriever_cancelled_becomes_cancelled() {
        let err: OrchestratorError = RetrieverError::Cancelled.into();
        assert!(matches!(err, OrchestratorError::Cancelled));
    }

    #[test]
    fn retriever_materialization_failure_becomes_retrieval_failed() {
        let err: OrchestratorError = RetrieverError::MaterializationFailed("store down".to_string()).into();
        assert!(matches!(err, OrchestratorError::RetrievalFailed(_)));
    }

    #[test]
    fn result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(OrchestratorError::Cancelled)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }
}
