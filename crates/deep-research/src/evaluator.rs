//! Answer evaluation: is a candidate answer definitive?

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::agent::TokenTracker;
use crate::error::{ResearchError, Result};
use crate::llm::StructuredLlm;

pub const EVALUATOR_TOOL: &str = "evaluator";

/// Verdict on a candidate answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub is_definitive: bool,
    pub reasoning: String,
}

#[async_trait]
pub trait AnswerEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        question: &str,
        answer: &str,
        tracker: &TokenTracker,
    ) -> Result<Evaluation>;
}

pub struct LlmEvaluator {
    llm: Arc<dyn StructuredLlm>,
}

impl LlmEvaluator {
    pub fn new(llm: Arc<dyn StructuredLlm>) -> Self {
        Self { llm }
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "is_definitive": {
                    "type": "boolean",
                    "description": "Whether the answer provides a definitive response without uncertainty or 'I don't know' type statements"
                },
                "reasoning": {
                    "type": "string",
                    "description": "Explanation of why the answer is or isn't definitive"
                }
            },
            "required": ["is_definitive", "reasoning"]
        })
    }
}

fn evaluation_prompt(question: &str, answer: &str) -> String {
    format!(
        r#"You are an evaluator of answer definitiveness. Decide whether the given answer gives a definitive response to the question.

Core criterion:
- Answers such as "I don't know", "lack of information", "doesn't exist", "not sure", or highly hedged and ambiguous replies are NOT definitive.
- A direct, committed answer is definitive even if it is short, and even if it turns out to be wrong; correctness is not your concern here.

Examples:

Question: "What are the system requirements for running Python 3.9?"
Answer: "I'm not entirely sure, but I think you need a computer with some RAM."
Evaluation: {{"is_definitive": false, "reasoning": "The answer contains uncertainty markers like 'not entirely sure' and 'I think', making it non-definitive."}}

Question: "What are the system requirements for running Python 3.9?"
Answer: "Python 3.9 requires Windows 7 or later, macOS 10.11 or later, or Linux."
Evaluation: {{"is_definitive": true, "reasoning": "The answer makes clear, definitive statements without uncertainty markers or ambiguity."}}

Now evaluate this pair:
Question: {question}
Answer: {answer}"#,
        question = question,
        answer = answer
    )
}

#[async_trait]
impl AnswerEvaluator for LlmEvaluator {
    #[instrument(skip_all, fields(question_len = question.len(), answer_len = answer.len()))]
    async fn evaluate(
        &self,
        question: &str,
        answer: &str,
        tracker: &TokenTracker,
    ) -> Result<Evaluation> {
        let raw = self
            .llm
            .generate(
                EVALUATOR_TOOL,
                &evaluation_prompt(question, answer),
                &Self::schema(),
                tracker,
            )
            .await?;

        let evaluation: Evaluation = serde_json::from_value(raw)
            .map_err(|e| ResearchError::MalformedOutput {
                tool: EVALUATOR_TOOL,
                message: e.to_string(),
            })?;
        debug!(is_definitive = evaluation.is_definitive, "Answer evaluated");
        Ok(evaluation)
    }
}
