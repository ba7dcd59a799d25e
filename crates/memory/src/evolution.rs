//! The evolution engine: LLM-driven refinement of the memory graph.
//!
//! Content and embeddings are never touched; only context sentences, tag
//! sets, and links change.  Mutations are idempotent: tag lists compare as
//! sets, `(target, type)` identifies a link with stronger-wins semantics,
//! and context rewrites are last-writer-wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use engram_embeddings::Embedder;
use engram_llm::{CompletionRequest, LanguageModel, extract_json};
use engram_prompts::{PromptManager, RenderContext};
use engram_store::{Filter, VectorStore};

use crate::codec::{self, KEY_WORKSPACE};
use crate::schema::{LinkOutcome, LinkType, Memory, MemoryLink};
use crate::workspace::normalize;

/// Template driving the per-batch analysis.
pub const EVOLUTION_TEMPLATE: &str = "memory_evolution";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Manual,
    Scheduled,
    Event,
}

impl TriggerType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "manual" => Some(TriggerType::Manual),
            "scheduled" => Some(TriggerType::Scheduled),
            "event" => Some(TriggerType::Event),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Event => "event",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Recent,
    All,
    Project,
}

impl Scope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "recent" => Some(Scope::Recent),
            "all" => Some(Scope::All),
            "project" => Some(Scope::Project),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvolveRequest {
    pub trigger: TriggerType,
    pub scope: Scope,
    pub max_memories: usize,
    /// Required when `scope` is [`Scope::Project`].
    pub project_path: Option<String>,
}

impl Default for EvolveRequest {
    fn default() -> Self {
        Self {
            trigger: TriggerType::Manual,
            scope: Scope::Recent,
            max_memories: 100,
            project_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvolveSummary {
    pub memories_analyzed: usize,
    pub memories_evolved: usize,
    pub links_created: usize,
    pub links_strengthened: usize,
    pub contexts_updated: usize,
    pub duration_ms: u64,
}

/// The mutation proposal shape the LLM returns per batch.
#[derive(Debug, Clone, Default, Deserialize)]
struct EvolutionAnalysis {
    #[serde(default)]
    should_evolve: bool,
    #[serde(default)]
    #[allow(dead_code)]
    actions: Vec<String>,
    #[serde(default)]
    suggested_connections: Vec<SuggestedConnection>,
    #[serde(default)]
    context_updates: HashMap<String, String>,
    #[serde(default)]
    tag_updates: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct SuggestedConnection {
    target_id: String,
    link_type: String,
    strength: f32,
    #[serde(default)]
    reason: String,
}

/// Per-memory mutation plan assembled from one batch analysis.
#[derive(Default)]
struct MemoryMutation {
    new_context: Option<String>,
    new_tags: Option<Vec<String>>,
    new_links: Vec<MemoryLink>,
}

pub struct EvolutionEngine {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    prompts: Arc<PromptManager>,
    batch_size: usize,
    worker_count: usize,
}

impl EvolutionEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        prompts: Arc<PromptManager>,
    ) -> Self {
        Self {
            store,
            embedder,
            llm,
            prompts,
            batch_size: 10,
            worker_count: 2,
        }
    }

    pub fn with_batching(mut self, batch_size: usize, worker_count: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.worker_count = worker_count.max(1);
        self
    }

    /// Run one evolution pass.  Only selection failures abort the run;
    /// failed batches and failed mutations are logged and skipped.
    pub async fn evolve(&self, request: EvolveRequest) -> Result<EvolveSummary> {
        let started = Instant::now();
        let selected = self.select(&request).await.context("evolution selection failed")?;

        let mut summary = EvolveSummary {
            memories_analyzed: selected.len(),
            ..Default::default()
        };
        info!(
            trigger = request.trigger.as_str(),
            selected = selected.len(),
            "evolution pass starting"
        );

        for batch in selected.chunks(self.batch_size) {
            match self.analyse_batch(batch).await {
                Ok(analysis) => self.apply_batch(batch, analysis, &mut summary).await,
                Err(err) => {
                    warn!(%err, batch = batch.len(), "evolution batch failed — skipping");
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            evolved = summary.memories_evolved,
            links_created = summary.links_created,
            links_strengthened = summary.links_strengthened,
            contexts_updated = summary.contexts_updated,
            duration_ms = summary.duration_ms,
            "evolution pass complete"
        );
        Ok(summary)
    }

    /// Snapshot selection: a store query with a neutral embedding, ranked
    /// by the store's own ordering.
    async fn select(&self, request: &EvolveRequest) -> Result<Vec<Memory>> {
        let filter = match request.scope {
            Scope::Project => {
                let raw = request
                    .project_path
                    .as_deref()
                    .ok_or_else(|| anyhow!("scope 'project' requires project_path"))?;
                let workspace = normalize(raw)
                    .map_err(|err| anyhow!("invalid project_path: {err}"))?;
                Some(Filter::eq(KEY_WORKSPACE, workspace))
            }
            Scope::Recent | Scope::All => None,
        };

        // Probe the embedder once for the deployment's dimension, then use
        // the zero vector as the neutral query point.
        let probe = self.embedder.embed("").await?;
        let neutral = vec![0.0f32; probe.len().max(1)];

        let matches = self
            .store
            .query(&neutral, request.max_memories.max(1), filter.as_ref())
            .await?;
        Ok(matches
            .iter()
            .map(|hit| codec::from_record(&hit.record))
            .collect())
    }

    async fn analyse_batch(&self, batch: &[Memory]) -> Result<EvolutionAnalysis> {
        let template = self
            .prompts
            .get(EVOLUTION_TEMPLATE)
            .context("evolution template unavailable")?;
        let rendered = template.render(&RenderContext {
            memories: enumerate_batch(batch),
            ..Default::default()
        });

        let completion = CompletionRequest::new(rendered)
            .with_sampling(template.config.temperature, template.config.max_tokens)
            .with_json();
        let body = self.llm.complete(&completion).await?;
        extract_json(&body).ok_or_else(|| anyhow!("evolution response was not the expected JSON shape"))
    }

    async fn apply_batch(
        &self,
        batch: &[Memory],
        analysis: EvolutionAnalysis,
        summary: &mut EvolveSummary,
    ) {
        if !analysis.should_evolve {
            debug!(batch = batch.len(), "batch needs no evolution");
            return;
        }

        let batch_ids: Vec<&str> = batch.iter().map(|memory| memory.id.as_str()).collect();
        let mut plans: HashMap<String, MemoryMutation> = HashMap::new();

        for (memory_id, context) in &analysis.context_updates {
            if !batch_ids.contains(&memory_id.as_str()) {
                warn!(memory_id, "context update targets a memory outside the batch — skipping");
                continue;
            }
            plans.entry(memory_id.clone()).or_default().new_context = Some(context.clone());
        }

        for (memory_id, tags) in &analysis.tag_updates {
            if !batch_ids.contains(&memory_id.as_str()) {
                warn!(memory_id, "tag update targets a memory outside the batch — skipping");
                continue;
            }
            plans.entry(memory_id.clone()).or_default().new_tags = Some(tags.clone());
        }

        for connection in &analysis.suggested_connections {
            let Some(link_type) = LinkType::parse(&connection.link_type) else {
                warn!(link_type = %connection.link_type, "unknown link type — skipping connection");
                continue;
            };
            if !self.target_exists(batch, &connection.target_id).await {
                warn!(target = %connection.target_id, "connection target does not exist — skipping");
                continue;
            }
            // The connection originates from the first batch memory that can
            // legally carry it (the target itself is skipped).
            let Some(source) = batch
                .iter()
                .find(|memory| memory.id != connection.target_id)
            else {
                continue;
            };
            plans
                .entry(source.id.clone())
                .or_default()
                .new_links
                .push(MemoryLink {
                    target_id: connection.target_id.clone(),
                    link_type,
                    strength: connection.strength.clamp(0.0, 1.0),
                    reason: connection.reason.clone(),
                });
        }

        // Apply per-memory plans; distinct memories in parallel, bounded by
        // the worker count.
        let results = futures::stream::iter(plans.into_iter().filter_map(|(memory_id, plan)| {
            batch
                .iter()
                .find(|memory| memory.id == memory_id)
                .cloned()
                .map(|memory| (memory, plan))
        }))
        .map(|(memory, plan)| self.apply_mutation(memory, plan))
        .buffer_unordered(self.worker_count)
        .collect::<Vec<_>>()
        .await;

        for outcome in results {
            match outcome {
                Ok(Some(applied)) => {
                    summary.memories_evolved += 1;
                    summary.links_created += applied.links_created;
                    summary.links_strengthened += applied.links_strengthened;
                    summary.contexts_updated += applied.contexts_updated;
                }
                Ok(None) => {}
                Err(err) => warn!(%err, "evolution mutation failed — skipping"),
            }
        }
    }

    async fn target_exists(&self, batch: &[Memory], target_id: &str) -> bool {
        if batch.iter().any(|memory| memory.id == target_id) {
            return true;
        }
        match self.store.fetch(&[target_id.to_string()]).await {
            Ok(records) => !records.is_empty(),
            Err(err) => {
                warn!(%err, target_id, "target existence check failed — treating as missing");
                false
            }
        }
    }

    /// Apply one memory's plan and persist it if anything changed.
    async fn apply_mutation(
        &self,
        mut memory: Memory,
        plan: MemoryMutation,
    ) -> Result<Option<AppliedMutation>> {
        let mut applied = AppliedMutation::default();

        if let Some(context) = plan.new_context {
            if memory.context != context {
                memory.context = context;
                applied.contexts_updated += 1;
            }
        }
        if let Some(tags) = plan.new_tags {
            if memory.replace_tags(tags) {
                applied.tags_changed = true;
            }
        }
        for link in plan.new_links {
            match memory.add_link(link) {
                LinkOutcome::Created => applied.links_created += 1,
                LinkOutcome::Strengthened => applied.links_strengthened += 1,
                LinkOutcome::Rejected => {}
            }
        }

        if !applied.any() {
            return Ok(None);
        }

        memory.updated_at = Utc::now();
        let metadata = codec::to_metadata(&memory);
        self.store
            .add(&memory.id, &memory.embedding, &memory.content, &metadata)
            .await
            .with_context(|| format!("failed to persist evolved memory {}", memory.id))?;
        debug!(memory_id = %memory.id, "memory evolved");
        Ok(Some(applied))
    }
}

#[derive(Default)]
struct AppliedMutation {
    links_created: usize,
    links_strengthened: usize,
    contexts_updated: usize,
    tags_changed: bool,
}

impl AppliedMutation {
    fn any(&self) -> bool {
        self.links_created > 0
            || self.links_strengthened > 0
            || self.contexts_updated > 0
            || self.tags_changed
    }
}

/// Render the batch the way the evolution prompt expects it.
fn enumerate_batch(batch: &[Memory]) -> String {
    batch
        .iter()
        .map(|memory| {
            let links = memory
                .links
                .iter()
                .map(|link| {
                    format!(
                        "{}({}, {:.2})",
                        link.target_id,
                        link.link_type.as_str(),
                        link.strength
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            format!(
                "- id: {}\n  content: {}\n  context: {}\n  keywords: {}\n  tags: {}\n  workspace: {}\n  code_type: {}\n  links: {}",
                memory.id,
                memory.content,
                memory.context,
                memory.keywords.join(","),
                memory.tags.join(","),
                memory.workspace_id,
                memory.code_type,
                if links.is_empty() { "(none)" } else { &links },
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{StaticEmbedder, StubLlm, write_evolution_template};
    use engram_store::InMemoryStore;
    use serde_json::Map;

    fn seed_memory(id: &str, workspace: &str) -> Memory {
        Memory {
            id: id.to_string(),
            content: format!("content of {id}"),
            context: "original context".to_string(),
            keywords: vec!["kw".to_string()],
            tags: vec!["old".to_string()],
            workspace_id: workspace.to_string(),
            code_type: "python".to_string(),
            embedding: vec![0.5, 0.5],
            links: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    async fn seed(store: &InMemoryStore, memory: &Memory) {
        store
            .add(
                &memory.id,
                &memory.embedding,
                &memory.content,
                &codec::to_metadata(memory),
            )
            .await
            .unwrap();
    }

    fn engine(
        store: Arc<InMemoryStore>,
        llm: Arc<StubLlm>,
        dir: &std::path::Path,
    ) -> EvolutionEngine {
        write_evolution_template(dir);
        EvolutionEngine::new(
            store,
            Arc::new(StaticEmbedder::fixed(vec![0.0, 0.0])),
            llm,
            Arc::new(engram_prompts::PromptManager::with_directory(dir)),
        )
    }

    fn mutation_reply() -> String {
        serde_json::json!({
            "should_evolve": true,
            "actions": ["refine context", "retag"],
            "context_updates": { "m1": "v1" },
            "tag_updates": { "m1": ["a", "b"] },
            "suggested_connections": [
                { "target_id": "m2", "link_type": "pattern", "strength": 0.8, "reason": "r" }
            ],
        })
        .to_string()
    }

    async fn stored(store: &InMemoryStore, id: &str) -> Memory {
        let records = store.fetch(&[id.to_string()]).await.unwrap();
        codec::from_record(&records[0])
    }

    #[tokio::test]
    async fn applies_context_tags_and_connections() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        seed(&store, &seed_memory("m1", "w")).await;
        seed(&store, &seed_memory("m2", "w")).await;

        let llm = Arc::new(StubLlm::always(&mutation_reply()));
        let engine = engine(store.clone(), llm, dir.path());
        let summary = engine.evolve(EvolveRequest::default()).await.unwrap();

        assert_eq!(summary.memories_analyzed, 2);
        assert_eq!(summary.memories_evolved, 1);
        assert_eq!(summary.links_created, 1);
        assert_eq!(summary.contexts_updated, 1);

        let m1 = stored(&store, "m1").await;
        assert_eq!(m1.context, "v1");
        assert_eq!(m1.tags, vec!["a", "b"]);
        assert_eq!(m1.links.len(), 1);
        assert_eq!(m1.links[0].target_id, "m2");
        assert_eq!(m1.links[0].link_type, LinkType::Pattern);
    }

    #[tokio::test]
    async fn running_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        seed(&store, &seed_memory("m1", "w")).await;
        seed(&store, &seed_memory("m2", "w")).await;

        let llm = Arc::new(StubLlm::always(&mutation_reply()));
        let engine = engine(store.clone(), llm, dir.path());
        engine.evolve(EvolveRequest::default()).await.unwrap();
        let second = engine.evolve(EvolveRequest::default()).await.unwrap();

        // Second run changes nothing: same context, same tag set, one link.
        assert_eq!(second.memories_evolved, 0);
        assert_eq!(second.links_created, 0);
        assert_eq!(second.links_strengthened, 0);
        assert_eq!(second.contexts_updated, 0);

        let m1 = stored(&store, "m1").await;
        assert_eq!(m1.context, "v1");
        assert_eq!(m1.tags, vec!["a", "b"]);
        assert_eq!(m1.links.len(), 1);
        assert!((m1.links[0].strength - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn stronger_connection_replaces_weaker() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let mut m1 = seed_memory("m1", "w");
        m1.links.push(MemoryLink {
            target_id: "m2".to_string(),
            link_type: LinkType::Pattern,
            strength: 0.5,
            reason: "old".to_string(),
        });
        seed(&store, &m1).await;
        seed(&store, &seed_memory("m2", "w")).await;

        let llm = Arc::new(StubLlm::always(&mutation_reply()));
        let engine = engine(store.clone(), llm, dir.path());
        let summary = engine.evolve(EvolveRequest::default()).await.unwrap();

        assert_eq!(summary.links_strengthened, 1);
        assert_eq!(summary.links_created, 0);
        let m1 = stored(&store, "m1").await;
        assert_eq!(m1.links.len(), 1);
        assert!((m1.links[0].strength - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn should_evolve_false_means_no_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        seed(&store, &seed_memory("m1", "w")).await;

        let llm = Arc::new(StubLlm::always(
            &serde_json::json!({"should_evolve": false, "context_updates": {"m1": "ignored"}})
                .to_string(),
        ));
        let engine = engine(store.clone(), llm, dir.path());
        let summary = engine.evolve(EvolveRequest::default()).await.unwrap();

        assert_eq!(summary.memories_analyzed, 1);
        assert_eq!(summary.memories_evolved, 0);
        assert_eq!(stored(&store, "m1").await.context, "original context");
    }

    #[tokio::test]
    async fn missing_target_and_unknown_type_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        seed(&store, &seed_memory("m1", "w")).await;

        let reply = serde_json::json!({
            "should_evolve": true,
            "suggested_connections": [
                { "target_id": "ghost", "link_type": "pattern", "strength": 0.8, "reason": "r" },
                { "target_id": "m1", "link_type": "friendship", "strength": 0.8, "reason": "r" }
            ],
        })
        .to_string();
        let llm = Arc::new(StubLlm::always(&reply));
        let engine = engine(store.clone(), llm, dir.path());
        let summary = engine.evolve(EvolveRequest::default()).await.unwrap();

        assert_eq!(summary.links_created, 0);
        assert!(stored(&store, "m1").await.links.is_empty());
    }

    #[tokio::test]
    async fn self_connections_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        seed(&store, &seed_memory("m1", "w")).await;

        // Single-memory batch: the only possible source equals the target.
        let reply = serde_json::json!({
            "should_evolve": true,
            "suggested_connections": [
                { "target_id": "m1", "link_type": "pattern", "strength": 0.8, "reason": "r" }
            ],
        })
        .to_string();
        let llm = Arc::new(StubLlm::always(&reply));
        let engine = engine(store.clone(), llm, dir.path());
        let summary = engine.evolve(EvolveRequest::default()).await.unwrap();

        assert_eq!(summary.links_created, 0);
        assert!(stored(&store, "m1").await.links.is_empty());
    }

    #[tokio::test]
    async fn failed_batch_is_skipped_and_later_batches_continue() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        for index in 0..3 {
            seed(&store, &seed_memory(&format!("m{index}"), "w")).await;
        }

        // First batch reply is garbage (fails JSON extraction), second works.
        let good = serde_json::json!({
            "should_evolve": true,
            "context_updates": { "m2": "updated" },
        })
        .to_string();
        let llm = Arc::new(StubLlm::sequence(vec!["not json", good.as_str()]));
        let engine = engine(store.clone(), llm, dir.path()).with_batching(2, 2);
        let summary = engine.evolve(EvolveRequest::default()).await.unwrap();

        assert_eq!(summary.memories_analyzed, 3);
        assert_eq!(summary.contexts_updated, 1);
        assert_eq!(stored(&store, "m2").await.context, "updated");
    }

    #[tokio::test]
    async fn project_scope_filters_by_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        seed(&store, &seed_memory("in-scope", "proj")).await;
        seed(&store, &seed_memory("out-of-scope", "other")).await;

        let reply = serde_json::json!({
            "should_evolve": true,
            "context_updates": { "in-scope": "touched", "out-of-scope": "touched" },
        })
        .to_string();
        let llm = Arc::new(StubLlm::always(&reply));
        let engine = engine(store.clone(), llm, dir.path());
        let summary = engine
            .evolve(EvolveRequest {
                scope: Scope::Project,
                project_path: Some("proj".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(summary.memories_analyzed, 1);
        assert_eq!(stored(&store, "in-scope").await.context, "touched");
        assert_eq!(stored(&store, "out-of-scope").await.context, "original context");
    }

    #[tokio::test]
    async fn project_scope_requires_project_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(StubLlm::always("{}"));
        let engine = engine(store, llm, dir.path());
        let err = engine
            .evolve(EvolveRequest {
                scope: Scope::Project,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("selection failed"));
    }

    #[tokio::test]
    async fn selection_respects_max_memories() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        for index in 0..6 {
            seed(&store, &seed_memory(&format!("m{index}"), "w")).await;
        }
        let llm = Arc::new(StubLlm::always(
            &serde_json::json!({"should_evolve": false}).to_string(),
        ));
        let engine = engine(store, llm, dir.path());
        let summary = engine
            .evolve(EvolveRequest {
                max_memories: 4,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.memories_analyzed, 4);
    }
}
