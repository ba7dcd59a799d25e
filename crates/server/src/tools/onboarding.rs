//! First-session onboarding.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::args;
use crate::registry::{Tool, ToolContext};
use crate::state::ServerState;

pub struct PerformOnboardingTool {
    state: Arc<ServerState>,
}

impl PerformOnboardingTool {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Tool for PerformOnboardingTool {
    fn name(&self) -> &'static str {
        "perform_onboarding"
    }

    fn description(&self) -> &'static str {
        "Initialise a workspace for a project and return an onboarding message describing how \
         to use the memory tools, optionally with the deployment's strategy guide."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "project_path": { "type": "string", "description": "Project to onboard; defaults to the working directory" },
                "project_name": { "type": "string", "description": "Display name for the workspace" },
                "include_strategy_guide": { "type": "boolean", "description": "Append the strategy guide (default true)" }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, arguments: &Value) -> Result<String> {
        if ctx.is_cancelled() {
            bail!("operation cancelled");
        }
        let project_path = args::optional_string(arguments, "project_path")?;
        let project_name = args::optional_string(arguments, "project_name")?;
        let include_guide =
            args::optional_bool(arguments, "include_strategy_guide")?.unwrap_or(true);

        let (info, created) = self
            .state
            .workspaces
            .init(project_path.as_deref(), project_name.as_deref())
            .await?;

        let mut text = String::new();
        let _ = writeln!(text, "Onboarding complete for '{}'.", info.name);
        let _ = writeln!(text);
        if created {
            let _ = writeln!(text, "A new workspace '{}' was created.", info.identifier);
        } else {
            let _ = writeln!(
                text,
                "Using the existing workspace '{}' ({} memories).",
                info.identifier, info.memory_count
            );
        }
        let _ = writeln!(text);
        let _ = writeln!(
            text,
            "Store insights with store_coding_memory as you work; recall them with \
             retrieve_relevant_memories before similar tasks; run evolve_memory_network \
             periodically to keep the graph fresh."
        );

        if include_guide {
            if let Some(guide) = &self.state.strategy_guide {
                let _ = writeln!(text);
                let _ = writeln!(text, "--- Strategy Guide ---");
                let _ = writeln!(text, "{guide}");
            }
        }
        Ok(text)
    }
}
