//! The polymorphic tool registry.
//!
//! Every tool carries the base capability set (name, description, input
//! schema, execute); tools may additionally expose a guidance record
//! (usage triggers, best practices, synergies, workflow snippets) that is
//! surfaced in `tools/list`.  The registry is written only at startup and
//! read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::watch;

/// Cancellation and per-invocation context handed to every tool.
#[derive(Clone)]
pub struct ToolContext {
    shutdown: watch::Receiver<bool>,
}

impl ToolContext {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    /// True once the transport has begun shutting down.  Tools should
    /// observe this between network calls and return promptly.
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }
}

/// Optional enhanced capability set surfaced alongside the schema.
#[derive(Debug, Clone, Default)]
pub struct ToolGuidance {
    pub usage_triggers: Vec<&'static str>,
    pub best_practices: Vec<&'static str>,
    pub synergies: Vec<&'static str>,
    pub workflow_snippets: Vec<&'static str>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn input_schema(&self) -> Value;

    /// Enhanced capabilities; `None` for plain tools.
    fn guidance(&self) -> Option<ToolGuidance> {
        None
    }

    /// Run the tool.  `Ok` is the user-facing text; `Err` becomes a
    /// tool-level `isError` result, never a JSON-RPC error.
    async fn execute(&self, ctx: &ToolContext, args: &Value) -> Result<String>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        let index = self.tools.len();
        self.tools.push(tool);
        self.by_name.insert(name, index);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name
            .get(name)
            .and_then(|index| self.tools.get(*index))
            .map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Build the `tools/list` descriptor array.  Guidance fields are probed
    /// per tool and only emitted when present.
    pub fn descriptors(&self) -> Value {
        let list: Vec<Value> = self
            .tools
            .iter()
            .map(|tool| {
                let mut descriptor = json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.input_schema(),
                });
                if let Some(guidance) = tool.guidance() {
                    descriptor["usageTriggers"] = json!(guidance.usage_triggers);
                    descriptor["bestPractices"] = json!(guidance.best_practices);
                    descriptor["synergies"] = json!(guidance.synergies);
                    descriptor["workflowSnippets"] = json!(guidance.workflow_snippets);
                }
                descriptor
            })
            .collect();
        json!(list)
    }
}
