//! Workspace lifecycle tools.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};

use engram_memory::WorkspaceInfo;

use crate::args;
use crate::registry::{Tool, ToolContext};
use crate::state::ServerState;

fn describe(text: &mut String, info: &WorkspaceInfo) {
    let _ = writeln!(text, "Identifier: {}", info.identifier);
    let _ = writeln!(text, "Name: {}", info.name);
    let _ = writeln!(text, "Description: {}", info.description);
    let _ = writeln!(text, "Memory Count: {}", info.memory_count);
    match (info.created_at, info.updated_at) {
        (Some(created), Some(updated)) => {
            let _ = writeln!(text, "Created At: {}", created.to_rfc3339());
            let _ = writeln!(text, "Updated At: {}", updated.to_rfc3339());
        }
        _ => {
            let _ = writeln!(text, "Created At: (no memories yet)");
        }
    }
}

pub struct WorkspaceInitTool {
    state: Arc<ServerState>,
}

impl WorkspaceInitTool {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Tool for WorkspaceInitTool {
    fn name(&self) -> &'static str {
        "workspace_init"
    }

    fn description(&self) -> &'static str {
        "Initialise a workspace: retrieve it when it exists, create it otherwise. Defaults to \
         the current working directory."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "identifier": { "type": "string", "description": "Path or logical name; defaults to the working directory" },
                "name": { "type": "string", "description": "Display name used when creating" }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, arguments: &Value) -> Result<String> {
        if ctx.is_cancelled() {
            bail!("operation cancelled");
        }
        let identifier = args::optional_string(arguments, "identifier")?;
        let name = args::optional_string(arguments, "name")?;
        let (info, created) = self
            .state
            .workspaces
            .init(identifier.as_deref(), name.as_deref())
            .await?;

        let mut text = if created {
            String::from("Workspace initialized (created new).\n\n")
        } else {
            String::from("Workspace initialized (retrieved existing).\n\n")
        };
        describe(&mut text, &info);
        Ok(text)
    }
}

pub struct WorkspaceCreateTool {
    state: Arc<ServerState>,
}

impl WorkspaceCreateTool {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Tool for WorkspaceCreateTool {
    fn name(&self) -> &'static str {
        "workspace_create"
    }

    fn description(&self) -> &'static str {
        "Create a workspace explicitly. Fails when the workspace already exists."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "identifier": { "type": "string", "description": "Path or logical name" },
                "name": { "type": "string", "description": "Display name" },
                "description": { "type": "string", "description": "Free-form description" }
            },
            "required": ["identifier"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, arguments: &Value) -> Result<String> {
        if ctx.is_cancelled() {
            bail!("operation cancelled");
        }
        let identifier = args::required_string(arguments, "identifier")?;
        let name = args::optional_string(arguments, "name")?;
        let description = args::optional_string(arguments, "description")?;
        let info = self
            .state
            .workspaces
            .create(&identifier, name.as_deref(), description.as_deref())
            .await?;

        let mut text = String::from("Workspace created successfully.\n\nCreated: true\n");
        describe(&mut text, &info);
        Ok(text)
    }
}

pub struct WorkspaceRetrieveTool {
    state: Arc<ServerState>,
}

impl WorkspaceRetrieveTool {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Tool for WorkspaceRetrieveTool {
    fn name(&self) -> &'static str {
        "workspace_retrieve"
    }

    fn description(&self) -> &'static str {
        "Retrieve a workspace's derived view. Fails when the workspace does not exist."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "identifier": { "type": "string", "description": "Path or logical name" }
            },
            "required": ["identifier"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, arguments: &Value) -> Result<String> {
        if ctx.is_cancelled() {
            bail!("operation cancelled");
        }
        let identifier = args::required_string(arguments, "identifier")?;
        let info = self.state.workspaces.retrieve(&identifier).await?;

        let mut text = String::from("Workspace retrieved.\n\n");
        describe(&mut text, &info);
        Ok(text)
    }
}
