//! Test doubles shared by unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::TokenTracker;
use crate::error::Result;
use crate::llm::StructuredLlm;

/// Returns the same JSON for every call and meters a fixed cost
#[derive(Clone)]
pub struct CannedLlm {
    value: Value,
    cost: u64,
    calls: Arc<AtomicUsize>,
}

impl CannedLlm {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            cost: 10,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StructuredLlm for CannedLlm {
    async fn generate(
        &self,
        tool: &str,
        _prompt: &str,
        _schema: &Value,
        tracker: &TokenTracker,
    ) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tracker.record(tool, self.cost);
        Ok(self.value.clone())
    }
}
