//! Response routing (C6): pure dispatch from a [`QueryPlan`] to one of the
//! turn branches. Carries no I/O of its own; the orchestrator executes
//! whichever branch is selected.

use crate::planner::{IntentKind, QueryPlan};

/// Which path the orchestrator should take for this turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Branch {
    /// Stream `clarification` back character-by-character.
    Clarifying(String),
    /// Call the non-retrieval responder with a routing prompt parameterized
    /// by the plan's kind.
    NonRetrieval(IntentKind),
    /// Run the retrieval+synthesis pathway.
    Retrieval,
}

/// Select the branch for `plan`. Pure function of `plan.kind`.
pub fn route(plan: &QueryPlan) -> Branch {
    match plan.kind {
        IntentKind::Ambiguous => {
            Branch::Clarifying(plan.clarification.clone().unwrap_or_default())
        }
        IntentKind::InDomain => Branch::Retrieval,
        other => Branch::NonRetrieval(other),
    }
}

/// The instruction text a non-retrieval routing prompt should convey for
/// each kind, parameterizing a single shared responder prompt template.
pub fn non_retrieval_instruction(kind: IntentKind) -> &'static str {
    match kind {
        IntentKind::OutOfDomain => {
            "The user asked about a real government service this assistant has no information on. Say so politely and do not fabricate details."
        }
        IntentKind::GeneralKnowledge => {
            "The user asked a general-knowledge question unrelated to government services. Answer briefly and factually."
        }
        IntentKind::Chitchat => "The user is making conversational small talk. Respond warmly and briefly.",
        IntentKind::Abusive => "The user's message contains abusive language. Respond calmly and do not escalate.",
        IntentKind::Identity => "The user is asking about the assistant's own identity or capabilities. Answer using the configured agent identity.",
        IntentKind::Malicious => "The user's message appears to request something harmful. Decline politely without elaborating on the request.",
        IntentKind::Unhandled => "The user's intent could not be classified into a known category. Respond helpfully and ask for clarification.",
        IntentKind::InDomain | IntentKind::Ambiguous => {
            unreachable!("in_domain and ambiguous never reach the non-retrieval responder")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(kind: IntentKind) -> QueryPlan {
        QueryPlan { kind, search_query: None, clarification: None, category: None }
    }

    #[test]
    fn ambiguous_routes_to_clarifying_with_text() {
        let mut p = plan(IntentKind::Ambiguous);
        p.clarification = Some("কোন কর?".to_string());
        assert_eq!(route(&p), Branch::Clarifying("কোন কর?".to_string()));
    }

    #[test]
    fn in_domain_routes_to_retrieval() {
        assert_eq!(route(&plan(IntentKind::InDomain)), Branch::Retrieval);
    }

    #[test]
    fn non_retrieval_kinds_route_to_non_retrieval_branch() {
        for kind in [
            IntentKind::OutOfDomain,
            IntentKind::GeneralKnowledge,
            IntentKind::Chitchat,
            IntentKind::Abusive,
            IntentKind::Identity,
            IntentKind::Malicious,
            IntentKind::Unhandled,
        ] {
            assert_eq!(route(&plan(kind)), Branch::NonRetrieval(kind));
        }
    }

    #[test]
    fn every_non_retrieval_kind_has_an_instruction() {
        for kind in [
            IntentKind::OutOfDomain,
            IntentKind::GeneralKnowledge,
            IntentKind::Chitchat,
            IntentKind::Abusive,
            IntentKind::Identity,
            IntentKind::Malicious,
            IntentKind::Unhandled,
        ] {
            assert!(!non_retrieval_instruction(kind).is_empty());
        }
    }
}
