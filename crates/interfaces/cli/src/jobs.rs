//! Background jobs wired into the scheduler.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use engram_memory::{EvolveRequest, Scope, TriggerType};
use engram_scheduler::JobHandler;
use engram_server::ServerState;
use engram_store::VectorStore;

pub const EVOLUTION_JOB: &str = "scheduled_evolution";
pub const MAINTENANCE_JOB: &str = "collection_maintenance";

/// Daily, off-peak.
pub const MAINTENANCE_SCHEDULE: &str = "0 30 4 * * *";

/// Runs the evolution engine on the cron schedule with the scheduled
/// trigger and the recent scope.
pub struct ScheduledEvolutionJob {
    state: Arc<ServerState>,
}

impl ScheduledEvolutionJob {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl JobHandler for ScheduledEvolutionJob {
    async fn run(&self) -> Result<String> {
        let summary = self
            .state
            .evolution
            .evolve(EvolveRequest {
                trigger: TriggerType::Scheduled,
                scope: Scope::Recent,
                max_memories: 100,
                project_path: None,
            })
            .await?;
        Ok(format!(
            "analyzed {}, evolved {}, links +{}/^{}, contexts {}",
            summary.memories_analyzed,
            summary.memories_evolved,
            summary.links_created,
            summary.links_strengthened,
            summary.contexts_updated,
        ))
    }
}

/// Re-validates the collection and reports its size.
pub struct CollectionMaintenanceJob {
    store: Arc<dyn VectorStore>,
}

impl CollectionMaintenanceJob {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for CollectionMaintenanceJob {
    async fn run(&self) -> Result<String> {
        self.store.ensure_collection().await?;
        let total = self.store.count(None).await?;
        Ok(format!("collection healthy, {total} records"))
    }
}
