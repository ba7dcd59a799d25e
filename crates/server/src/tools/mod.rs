//! The seven exposed tools.

mod memory_tools;
mod onboarding;
mod workspace_tools;

use std::sync::Arc;

use crate::registry::ToolRegistry;
use crate::state::ServerState;

pub use memory_tools::{EvolveNetworkTool, RetrieveMemoriesTool, StoreCodingMemoryTool};
pub use onboarding::PerformOnboardingTool;
pub use workspace_tools::{WorkspaceCreateTool, WorkspaceInitTool, WorkspaceRetrieveTool};

/// Register the full tool surface.
pub fn register_all(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    registry.register(Arc::new(StoreCodingMemoryTool::new(Arc::clone(&state))));
    registry.register(Arc::new(RetrieveMemoriesTool::new(Arc::clone(&state))));
    registry.register(Arc::new(EvolveNetworkTool::new(Arc::clone(&state))));
    registry.register(Arc::new(WorkspaceInitTool::new(Arc::clone(&state))));
    registry.register(Arc::new(WorkspaceCreateTool::new(Arc::clone(&state))));
    registry.register(Arc::new(WorkspaceRetrieveTool::new(Arc::clone(&state))));
    registry.register(Arc::new(PerformOnboardingTool::new(state)));
}
