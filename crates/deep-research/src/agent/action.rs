//! Oracle decisions and the per-step permitted action set

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ResearchError, Result};

/// Maximum sub-questions per reflect and URLs per visit
pub const MAX_ITEMS_PER_ACTION: usize = 2;

/// The four actions the oracle can choose from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Search,
    Answer,
    Reflect,
    Visit,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Search,
        ActionKind::Answer,
        ActionKind::Reflect,
        ActionKind::Visit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Search => "search",
            ActionKind::Answer => "answer",
            ActionKind::Reflect => "reflect",
            ActionKind::Visit => "visit",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which actions the oracle may pick on a given step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSet {
    pub search: bool,
    pub answer: bool,
    pub reflect: bool,
    pub visit: bool,
}

impl Default for ActionSet {
    fn default() -> Self {
        Self::all()
    }
}

impl ActionSet {
    pub fn all() -> Self {
        Self {
            search: true,
            answer: true,
            reflect: true,
            visit: true,
        }
    }

    /// Beast mode: nothing but a final answer
    pub fn answer_only() -> Self {
        Self {
            search: false,
            answer: true,
            reflect: false,
            visit: false,
        }
    }

    pub fn allows(&self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::Search => self.search,
            ActionKind::Answer => self.answer,
            ActionKind::Reflect => self.reflect,
            ActionKind::Visit => self.visit,
        }
    }

    pub fn set(&mut self, kind: ActionKind, allowed: bool) {
        match kind {
            ActionKind::Search => self.search = allowed,
            ActionKind::Answer => self.answer = allowed,
            ActionKind::Reflect => self.reflect = allowed,
            ActionKind::Visit => self.visit = allowed,
        }
    }

    pub fn disable(&mut self, kind: ActionKind) {
        self.set(kind, false);
    }

    pub fn permitted(&self) -> Vec<ActionKind> {
        ActionKind::ALL
            .into_iter()
            .filter(|k| self.allows(*k))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.permitted().is_empty()
    }

    /// JSON schema for a decision restricted to the permitted actions
    ///
    /// Ollama's `format` field does not cope well with `oneOf`, so the schema
    /// is a flat object: `action` and `thoughts` are required and every
    /// permitted action contributes its own optional payload fields.
    pub fn response_schema(&self) -> Value {
        let actions: Vec<&str> = self.permitted().iter().map(|k| k.as_str()).collect();

        let mut properties = Map::new();
        properties.insert(
            "action".to_string(),
            json!({
                "type": "string",
                "enum": actions,
                "description": "Must match exactly one action type"
            }),
        );
        properties.insert(
            "thoughts".to_string(),
            json!({
                "type": "string",
                "description": "Explain why choose this action, what's the thought process behind choosing this action"
            }),
        );

        if self.search {
            properties.insert(
                "searchQuery".to_string(),
                json!({
                    "type": "string",
                    "description": "Only required when choosing 'search' action, must be a short, keyword-based query that BM25, tf-idf based search engines can understand."
                }),
            );
        }

        if self.answer {
            properties.insert(
                "answer".to_string(),
                json!({
                    "type": "string",
                    "description": "Only required when choosing 'answer' action, must be the final answer in natural language"
                }),
            );
            properties.insert(
                "references".to_string(),
                json!({
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "exactQuote": {
                                "type": "string",
                                "description": "Exact relevant quote from the document"
                            },
                            "url": {
                                "type": "string",
                                "description": "URL of the document; must be directly from the context"
                            }
                        },
                        "required": ["exactQuote", "url"]
                    },
                    "description": "Must be an array of references that support the answer, each reference must contain an exact quote and the URL of the document"
                }),
            );
        }

        if self.reflect {
            properties.insert(
                "questionsToAnswer".to_string(),
                json!({
                    "type": "array",
                    "items": {
                        "type": "string",
                        "description": "each question must be a single line, concise and clear. not composite or compound, less than 20 words."
                    },
                    "description": "List of most important questions to fill the knowledge gaps of finding the answer to the original question",
                    "maxItems": MAX_ITEMS_PER_ACTION
                }),
            );
        }

        if self.visit {
            properties.insert(
                "URLTargets".to_string(),
                json!({
                    "type": "array",
                    "items": {"type": "string"},
                    "maxItems": MAX_ITEMS_PER_ACTION,
                    "description": "Must be an array of URLs, choose up the most relevant 2 URLs to visit"
                }),
            );
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": ["action", "thoughts"]
        })
    }
}

/// A supporting quote for an answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "exactQuote")]
    pub exact_quote: String,
    pub url: String,
}

/// One structured decision from the oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Decision {
    Search {
        thoughts: String,
        #[serde(rename = "searchQuery")]
        search_query: String,
    },
    Answer {
        thoughts: String,
        answer: String,
        #[serde(default)]
        references: Vec<Reference>,
    },
    Reflect {
        thoughts: String,
        #[serde(rename = "questionsToAnswer")]
        questions_to_answer: Vec<String>,
    },
    Visit {
        thoughts: String,
        #[serde(rename = "URLTargets")]
        url_targets: Vec<String>,
    },
}

impl Decision {
    /// Parse raw oracle output and check it against the permitted set
    pub fn from_value(value: Value, permitted: &ActionSet) -> Result<Self> {
        let decision: Decision = serde_json::from_value(value)
            .map_err(|e| ResearchError::InvalidDecision(e.to_string()))?;
        decision.validate(permitted)
    }

    /// Enforce the boundary rules: permitted action, non-empty payload, list caps
    pub fn validate(mut self, permitted: &ActionSet) -> Result<Self> {
        let kind = self.kind();
        if !permitted.allows(kind) {
            return Err(ResearchError::ActionNotPermitted { action: kind });
        }

        match &mut self {
            Decision::Search { search_query, .. } => {
                if search_query.trim().is_empty() {
                    return Err(ResearchError::InvalidDecision(
                        "search decision without searchQuery".to_string(),
                    ));
                }
            }
            Decision::Answer { answer, .. } => {
                if answer.trim().is_empty() {
                    return Err(ResearchError::InvalidDecision(
                        "answer decision with an empty answer".to_string(),
                    ));
                }
            }
            Decision::Reflect {
                questions_to_answer,
                ..
            } => {
                questions_to_answer.retain(|q| !q.trim().is_empty());
                questions_to_answer.truncate(MAX_ITEMS_PER_ACTION);
            }
            Decision::Visit { url_targets, .. } => {
                url_targets.retain(|u| !u.trim().is_empty());
                url_targets.truncate(MAX_ITEMS_PER_ACTION);
            }
        }

        Ok(self)
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Decision::Search { .. } => ActionKind::Search,
            Decision::Answer { .. } => ActionKind::Answer,
            Decision::Reflect { .. } => ActionKind::Reflect,
            Decision::Visit { .. } => ActionKind::Visit,
        }
    }

    pub fn thoughts(&self) -> &str {
        match self {
            Decision::Search { thoughts, .. }
            | Decision::Answer { thoughts, .. }
            | Decision::Reflect { thoughts, .. }
            | Decision::Visit { thoughts, .. } => thoughts,
        }
    }

    /// The answer text, if this is an answer decision
    pub fn answer(&self) -> Option<&str> {
        match self {
            Decision::Answer { answer, .. } => Some(answer),
            _ => None,
        }
    }

    pub fn references(&self) -> &[Reference] {
        match self {
            Decision::Answer { references, .. } => references,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_decision() {
        let value = json!({
            "action": "search",
            "thoughts": "need facts",
            "searchQuery": "rust borrow checker"
        });

        let decision = Decision::from_value(value, &ActionSet::all()).unwrap();
        assert_eq!(decision.kind(), ActionKind::Search);
        assert_eq!(decision.thoughts(), "need facts");
    }

    #[test]
    fn test_answer_references_default_empty() {
        let value = json!({
            "action": "answer",
            "thoughts": "done",
            "answer": "42"
        });

        let decision = Decision::from_value(value, &ActionSet::all()).unwrap();
        assert_eq!(decision.answer(), Some("42"));
        assert!(decision.references().is_empty());
    }

    #[test]
    fn test_reject_unpermitted_action() {
        let mut permitted = ActionSet::all();
        permitted.disable(ActionKind::Reflect);

        let value = json!({
            "action": "reflect",
            "thoughts": "hmm",
            "questionsToAnswer": ["a?"]
        });

        let err = Decision::from_value(value, &permitted).unwrap_err();
        assert!(matches!(
            err,
            ResearchError::ActionNotPermitted {
                action: ActionKind::Reflect
            }
        ));
    }

    #[test]
    fn test_reject_unknown_action_and_missing_payload() {
        let unknown = json!({"action": "dance", "thoughts": "?"});
        assert!(matches!(
            Decision::from_value(unknown, &ActionSet::all()),
            Err(ResearchError::InvalidDecision(_))
        ));

        let missing = json!({"action": "visit", "thoughts": "?"});
        assert!(matches!(
            Decision::from_value(missing, &ActionSet::all()),
            Err(ResearchError::InvalidDecision(_))
        ));
    }

    #[test]
    fn test_lists_truncated_to_two() {
        let value = json!({
            "action": "visit",
            "thoughts": "read",
            "URLTargets": ["https://a", "https://b", "https://c"]
        });

        let decision = Decision::from_value(value, &ActionSet::all()).unwrap();
        match decision {
            Decision::Visit { url_targets, .. } => {
                assert_eq!(url_targets, vec!["https://a", "https://b"])
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_schema_only_lists_permitted_actions() {
        let schema = ActionSet::answer_only().response_schema();
        assert_eq!(schema["properties"]["action"]["enum"], json!(["answer"]));
        assert!(schema["properties"].get("searchQuery").is_none());
        assert!(schema["properties"].get("URLTargets").is_none());
        assert!(schema["properties"].get("references").is_some());

        let full = ActionSet::all().response_schema();
        assert_eq!(full["properties"]["questionsToAnswer"]["maxItems"], json!(2));
        assert_eq!(full["required"], json!(["action", "thoughts"]));
    }

    #[test]
    fn test_decision_round_trips_wire_names() {
        let decision = Decision::Reflect {
            thoughts: "split".to_string(),
            questions_to_answer: vec!["what?".to_string()],
        };
        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(value["action"], "reflect");
        assert_eq!(value["questionsToAnswer"][0], "what?");
    }
}
