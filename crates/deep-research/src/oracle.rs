//! The decision oracle: prompt + permitted actions in, one decision out

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::agent::{ActionSet, Decision, TokenTracker};
use crate::error::Result;
use crate::llm::StructuredLlm;

/// Usage bucket for decision calls
pub const ORACLE_TOOL: &str = "agent";

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// Return exactly one decision whose action is in `permitted`
    async fn decide(
        &self,
        prompt: &str,
        permitted: &ActionSet,
        tracker: &TokenTracker,
    ) -> Result<Decision>;
}

/// Oracle backed by schema-constrained model output
pub struct LlmDecisionOracle {
    llm: Arc<dyn StructuredLlm>,
}

impl LlmDecisionOracle {
    pub fn new(llm: Arc<dyn StructuredLlm>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl DecisionOracle for LlmDecisionOracle {
    #[instrument(skip_all, fields(permitted = ?permitted.permitted()))]
    async fn decide(
        &self,
        prompt: &str,
        permitted: &ActionSet,
        tracker: &TokenTracker,
    ) -> Result<Decision> {
        let schema = permitted.response_schema();
        let raw = self
            .llm
            .generate(ORACLE_TOOL, prompt, &schema, tracker)
            .await?;
        let decision = Decision::from_value(raw, permitted)?;
        debug!(action = %decision.kind(), "Oracle decided");
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ActionKind;
    use crate::error::ResearchError;
    use crate::test_support::CannedLlm;
    use serde_json::json;

    #[tokio::test]
    async fn test_decide_parses_and_meters() {
        let oracle = LlmDecisionOracle::new(Arc::new(CannedLlm::new(json!({
            "action": "reflect",
            "thoughts": "split it",
            "questionsToAnswer": ["a?", "b?", "c?"]
        }))));
        let tracker = TokenTracker::new(100);

        let decision = oracle
            .decide("prompt", &ActionSet::all(), &tracker)
            .await
            .unwrap();

        assert_eq!(decision.kind(), ActionKind::Reflect);
        assert_eq!(tracker.snapshot().by_tool[ORACLE_TOOL], 10);
        match decision {
            Decision::Reflect {
                questions_to_answer,
                ..
            } => assert_eq!(questions_to_answer.len(), 2),
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decide_rejects_out_of_set_action() {
        let oracle = LlmDecisionOracle::new(Arc::new(CannedLlm::new(json!({
            "action": "search",
            "thoughts": "more",
            "searchQuery": "x"
        }))));
        let tracker = TokenTracker::new(100);

        let err = oracle
            .decide("prompt", &ActionSet::answer_only(), &tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::ActionNotPermitted { .. }));
    }
}
