//! Post-mortem of a rejected attempt, fed back into the next attempt's prompt

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;

use crate::agent::TokenTracker;
use crate::error::{ResearchError, Result};
use crate::llm::StructuredLlm;

pub const ANALYZER_TOOL: &str = "analyzer";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    #[serde(default)]
    pub recap: String,
    pub blame: String,
    pub improvement: String,
}

#[async_trait]
pub trait FailureAnalyzer: Send + Sync {
    /// Diagnose a failed attempt from its diary, oldest entry first
    async fn analyze(&self, diary: &[String], tracker: &TokenTracker) -> Result<FailureAnalysis>;
}

pub struct LlmFailureAnalyzer {
    llm: Arc<dyn StructuredLlm>,
}

impl LlmFailureAnalyzer {
    pub fn new(llm: Arc<dyn StructuredLlm>) -> Self {
        Self { llm }
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "recap": {
                    "type": "string",
                    "description": "Recap of the actions taken and the steps conducted"
                },
                "blame": {
                    "type": "string",
                    "description": "Which action or step was the root cause of the bad answer"
                },
                "improvement": {
                    "type": "string",
                    "description": "Suggested key improvement for the next iteration, do not use bullet points, be concise and hot-take vibe"
                }
            },
            "required": ["recap", "blame", "improvement"]
        })
    }
}

fn analysis_prompt(diary: &[String]) -> String {
    format!(
        r#"You are an expert at analyzing search and reasoning processes. Review the sequence of steps below and work out what went wrong.

1. Recap the sequence of actions, highlighting the key decision points.
2. Identify whether search queries repeated themselves, whether URLs were actually read before answering, and where the reasoning went off track.
3. Name the root cause of the rejected answer.
4. Suggest one concrete improvement for the next attempt.

Steps to analyze:
{steps}"#,
        steps = diary.join("\n\n")
    )
}

#[async_trait]
impl FailureAnalyzer for LlmFailureAnalyzer {
    #[instrument(skip_all, fields(entries = diary.len()))]
    async fn analyze(&self, diary: &[String], tracker: &TokenTracker) -> Result<FailureAnalysis> {
        let raw = self
            .llm
            .generate(ANALYZER_TOOL, &analysis_prompt(diary), &Self::schema(), tracker)
            .await?;

        serde_json::from_value(raw).map_err(|e| ResearchError::MalformedOutput {
            tool: ANALYZER_TOOL,
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CannedLlm;

    #[test]
    fn test_prompt_contains_every_entry() {
        let prompt = analysis_prompt(&["At step 1, searched".to_string(), "At step 2, answered".to_string()]);
        assert!(prompt.contains("At step 1, searched\n\nAt step 2, answered"));
    }

    #[tokio::test]
    async fn test_analyze_parses_diagnosis() {
        let llm = CannedLlm::new(json!({
            "recap": "searched once then answered",
            "blame": "answered without reading sources",
            "improvement": "visit the top result first"
        }));
        let analyzer = LlmFailureAnalyzer::new(Arc::new(llm));
        let tracker = TokenTracker::new(100);

        let analysis = analyzer
            .analyze(&["At step 1, you took **answer**".to_string()], &tracker)
            .await
            .unwrap();

        assert_eq!(analysis.blame, "answered without reading sources");
        assert_eq!(analysis.improvement, "visit the top result first");
        assert!(tracker.total_usage() > 0);
    }
}
