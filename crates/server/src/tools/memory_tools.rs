//! Memory-facing tools: store, retrieve, evolve.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};

use engram_memory::{CreateMemoryRequest, EvolveRequest, RetrieveRequest, Scope, TriggerType};

use crate::args;
use crate::registry::{Tool, ToolContext, ToolGuidance};
use crate::state::ServerState;

/// Longest content echo in a retrieval result line.
const CONTENT_SNIPPET: usize = 200;

pub struct StoreCodingMemoryTool {
    state: Arc<ServerState>,
}

impl StoreCodingMemoryTool {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Tool for StoreCodingMemoryTool {
    fn name(&self) -> &'static str {
        "store_coding_memory"
    }

    fn description(&self) -> &'static str {
        "Store a code snippet or programming insight as a memory. The content is analysed, \
         embedded, linked to similar prior memories, and persisted under a workspace."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "The code or insight to remember" },
                "workspace_id": { "type": "string", "description": "Workspace scope (path or logical name)" },
                "code_type": { "type": "string", "description": "Language hint, e.g. 'python'" },
                "context": { "type": "string", "description": "Extra context for the analysis" },
                "project_path": { "type": "string", "description": "Deprecated alias for workspace_id" }
            },
            "required": ["content"]
        })
    }

    fn guidance(&self) -> Option<ToolGuidance> {
        Some(ToolGuidance {
            usage_triggers: vec![
                "after solving a non-trivial problem",
                "after writing reusable code",
            ],
            best_practices: vec![
                "include enough surrounding code for the snippet to stand alone",
                "set code_type so links prefer same-language memories",
            ],
            synergies: vec!["retrieve_relevant_memories", "evolve_memory_network"],
            workflow_snippets: vec!["store_coding_memory -> retrieve_relevant_memories"],
        })
    }

    async fn execute(&self, ctx: &ToolContext, arguments: &Value) -> Result<String> {
        if ctx.is_cancelled() {
            bail!("operation cancelled");
        }
        let request = CreateMemoryRequest {
            content: args::required_string(arguments, "content")?,
            workspace_id: args::optional_string(arguments, "workspace_id")?,
            project_path: args::optional_string(arguments, "project_path")?,
            code_type: args::optional_string(arguments, "code_type")?,
            context: args::optional_string(arguments, "context")?,
        };

        let response = self.state.memory.create(request).await?;
        let mut text = String::from("Memory stored successfully!\n\n");
        let _ = writeln!(text, "Memory ID: {}", response.memory_id);
        let _ = writeln!(text, "Workspace: {}", response.workspace_id);
        let _ = writeln!(text, "Keywords: {}", response.keywords.join(", "));
        let _ = writeln!(text, "Tags: {}", response.tags.join(", "));
        let _ = writeln!(text, "Links Created: {}", response.links_created);
        Ok(text)
    }
}

pub struct RetrieveMemoriesTool {
    state: Arc<ServerState>,
}

impl RetrieveMemoriesTool {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Tool for RetrieveMemoriesTool {
    fn name(&self) -> &'static str {
        "retrieve_relevant_memories"
    }

    fn description(&self) -> &'static str {
        "Retrieve stored memories relevant to a query, ranked by similarity and scoped to a \
         workspace."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What you are looking for" },
                "workspace_id": { "type": "string", "description": "Workspace scope" },
                "max_results": { "type": "number", "description": "Result cap (default 5)" },
                "code_types": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Restrict to these language hints"
                },
                "min_relevance": { "type": "number", "description": "Similarity floor in [0,1] (default 0.7)" },
                "project_filter": { "type": "string", "description": "Deprecated alias for workspace_id" }
            },
            "required": ["query"]
        })
    }

    fn guidance(&self) -> Option<ToolGuidance> {
        Some(ToolGuidance {
            usage_triggers: vec!["before starting a task that feels familiar"],
            best_practices: vec!["query with intent, not identifiers"],
            synergies: vec!["store_coding_memory"],
            workflow_snippets: vec!["retrieve_relevant_memories -> adapt the closest match"],
        })
    }

    async fn execute(&self, ctx: &ToolContext, arguments: &Value) -> Result<String> {
        if ctx.is_cancelled() {
            bail!("operation cancelled");
        }
        let min_relevance = match args::optional_f64(arguments, "min_relevance")? {
            Some(value) if !(0.0..=1.0).contains(&value) => {
                bail!("min_relevance must be within [0, 1]")
            }
            Some(value) => value,
            None => 0.7,
        };
        let request = RetrieveRequest {
            query: args::required_string(arguments, "query")?,
            workspace_id: args::optional_string(arguments, "workspace_id")?,
            project_filter: args::optional_string(arguments, "project_filter")?,
            code_types: args::optional_string_array(arguments, "code_types")?,
            max_results: args::optional_i64(arguments, "max_results")?.unwrap_or(5),
            min_relevance,
        };

        let response = self.state.memory.retrieve(request).await?;
        if response.memories.is_empty() {
            return Ok(format!(
                "No relevant memories found in workspace '{}'.",
                response.workspace_id
            ));
        }

        let mut text = format!("Found {} relevant memories:\n", response.memories.len());
        for (index, item) in response.memories.iter().enumerate() {
            let snippet: String = item.memory.content.chars().take(CONTENT_SNIPPET).collect();
            let _ = write!(
                text,
                "\n{}. [{:.0}% match] {}\n   Context: {}\n   Content: {}\n   Tags: {}\n",
                index + 1,
                item.similarity * 100.0,
                item.match_reason,
                item.memory.context,
                snippet,
                item.memory.tags.join(", "),
            );
        }
        Ok(text)
    }
}

pub struct EvolveNetworkTool {
    state: Arc<ServerState>,
}

impl EvolveNetworkTool {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Tool for EvolveNetworkTool {
    fn name(&self) -> &'static str {
        "evolve_memory_network"
    }

    fn description(&self) -> &'static str {
        "Run one evolution pass over the memory network: refine context sentences, retag, and \
         add inter-memory links."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "trigger_type": {
                    "type": "string",
                    "enum": ["manual", "scheduled", "event"],
                    "description": "What initiated this pass (default manual)"
                },
                "scope": {
                    "type": "string",
                    "enum": ["recent", "all", "project"],
                    "description": "Selection scope (default recent)"
                },
                "max_memories": { "type": "number", "description": "Selection cap (default 100)" },
                "project_path": { "type": "string", "description": "Required when scope is 'project'" }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, arguments: &Value) -> Result<String> {
        if ctx.is_cancelled() {
            bail!("operation cancelled");
        }
        let trigger = match args::optional_string(arguments, "trigger_type")? {
            Some(raw) => TriggerType::parse(&raw)
                .ok_or_else(|| anyhow::anyhow!("trigger_type must be one of manual|scheduled|event"))?,
            None => TriggerType::Manual,
        };
        let scope = match args::optional_string(arguments, "scope")? {
            Some(raw) => Scope::parse(&raw)
                .ok_or_else(|| anyhow::anyhow!("scope must be one of recent|all|project"))?,
            None => Scope::Recent,
        };
        let project_path = args::optional_string(arguments, "project_path")?;
        if scope == Scope::Project && project_path.is_none() {
            bail!("scope 'project' requires project_path");
        }
        let max_memories = match args::optional_i64(arguments, "max_memories")? {
            Some(value) if value > 0 => value as usize,
            Some(_) => bail!("max_memories must be a positive integer"),
            None => 100,
        };

        let summary = self
            .state
            .evolution
            .evolve(EvolveRequest {
                trigger,
                scope,
                max_memories,
                project_path,
            })
            .await?;

        let mut text = String::from("Memory network evolution complete!\n\n");
        let _ = writeln!(text, "Trigger: {}", trigger.as_str());
        let _ = writeln!(text, "Memories Analyzed: {}", summary.memories_analyzed);
        let _ = writeln!(text, "Memories Evolved: {}", summary.memories_evolved);
        let _ = writeln!(text, "Links Created: {}", summary.links_created);
        let _ = writeln!(text, "Links Strengthened: {}", summary.links_strengthened);
        let _ = writeln!(text, "Contexts Updated: {}", summary.contexts_updated);
        let _ = writeln!(text, "Duration: {} ms", summary.duration_ms);
        Ok(text)
    }
}
