//! The memory pipeline: construct → embed → link → store → retrieve.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use engram_embeddings::Embedder;
use engram_llm::{CompletionRequest, LanguageModel, extract_json};
use engram_prompts::{PromptManager, RenderContext};
use engram_store::{Filter, VectorStore};

use crate::codec::{self, KEY_PROJECT_PATH, KEY_WORKSPACE};
use crate::schema::{LinkOutcome, LinkType, Memory, MemoryAnalysis, MemoryLink};
use crate::workspace::{default_identifier, normalize};

/// Template driving the note-construction analysis.
pub const NOTE_CONSTRUCTION_TEMPLATE: &str = "note_construction";

/// Neighbours considered during link generation.
const LINK_CANDIDATES: usize = 10;
/// Minimum link-strength similarity for a new edge.
const LINK_THRESHOLD: f32 = 0.7;

// ── Similarity conventions ───────────────────────────────────────────────────
//
// The store returns an L2-like distance `d >= 0`.  Retrieval ranking uses
// the reciprocal form; link strengths use the linear clamped form.  Both
// are used consistently so the literal thresholds keep their meaning.

pub fn retrieval_similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

pub fn link_strength(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

// ── Requests / responses ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CreateMemoryRequest {
    pub content: String,
    pub workspace_id: Option<String>,
    /// Deprecated alias for `workspace_id`; the newer field wins.
    pub project_path: Option<String>,
    pub code_type: Option<String>,
    /// Caller-supplied context hint passed through to the analysis prompt.
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateMemoryResponse {
    pub memory_id: String,
    pub workspace_id: String,
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
    pub links_created: usize,
}

#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    pub query: String,
    pub workspace_id: Option<String>,
    /// Deprecated alias for `workspace_id`; the newer field wins.
    pub project_filter: Option<String>,
    pub code_types: Vec<String>,
    pub max_results: i64,
    pub min_relevance: f64,
}

impl Default for RetrieveRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            workspace_id: None,
            project_filter: None,
            code_types: Vec::new(),
            max_results: 5,
            min_relevance: 0.7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievedMemory {
    pub memory: Memory,
    pub similarity: f32,
    pub match_reason: String,
}

#[derive(Debug, Clone)]
pub struct RetrieveResponse {
    pub workspace_id: String,
    pub memories: Vec<RetrievedMemory>,
}

/// Resolve the workspace scope: explicit id > legacy alias > default.
pub fn resolve_workspace(workspace_id: Option<&str>, legacy: Option<&str>) -> Result<String> {
    let raw = workspace_id
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| legacy.map(str::trim).filter(|value| !value.is_empty()));
    match raw {
        Some(raw) => normalize(raw).map_err(|err| anyhow!("invalid workspace identifier: {err}")),
        None => Ok(default_identifier()),
    }
}

// ── Service ──────────────────────────────────────────────────────────────────

pub struct MemoryService {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    prompts: Arc<PromptManager>,
}

impl MemoryService {
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
        }
    }

    pub fn store(&self) -> Arc<dyn VectorStore> {
        Arc::clone(&self.store)
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    /// Create a memory: analyse, embed, link, persist.
    ///
    /// LLM analysis failure is fatal: a memory without analysis is not
    /// stored.  Link generation is best-effort and never fails the create.
    pub async fn create(&self, request: CreateMemoryRequest) -> Result<CreateMemoryResponse> {
        let workspace_id =
            resolve_workspace(request.workspace_id.as_deref(), request.project_path.as_deref())?;
        let memory_id = Uuid::new_v4().to_string();

        let analysis = self.analyse(&request, &workspace_id).await?;
        let embedding = self
            .embedder
            .embed(&request.content)
            .await
            .context("failed to embed memory content")?;

        let now = Utc::now();
        let mut memory = Memory {
            id: memory_id,
            content: request.content.clone(),
            context: analysis.context,
            keywords: analysis.keywords,
            tags: analysis.tags,
            workspace_id: workspace_id.clone(),
            code_type: request.code_type.unwrap_or_default(),
            embedding,
            links: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: serde_json::Map::new(),
        };

        let links_created = match self.generate_links(&mut memory).await {
            Ok(count) => count,
            Err(err) => {
                warn!(%err, memory_id = %memory.id, "link generation failed — storing without links");
                0
            }
        };

        let metadata = codec::to_metadata(&memory);
        self.store
            .add(&memory.id, &memory.embedding, &memory.content, &metadata)
            .await
            .context("failed to persist memory")?;

        info!(
            memory_id = %memory.id,
            workspace = %workspace_id,
            keywords = memory.keywords.len(),
            links = links_created,
            "memory stored"
        );
        Ok(CreateMemoryResponse {
            memory_id: memory.id,
            workspace_id,
            keywords: memory.keywords,
            tags: memory.tags,
            links_created,
        })
    }

    async fn analyse(
        &self,
        request: &CreateMemoryRequest,
        workspace_id: &str,
    ) -> Result<MemoryAnalysis> {
        let template = self
            .prompts
            .get(NOTE_CONSTRUCTION_TEMPLATE)
            .context("note construction template unavailable")?;
        let rendered = template.render(&RenderContext {
            content: request.content.clone(),
            project_path: workspace_id.to_string(),
            code_type: request.code_type.clone().unwrap_or_default(),
            context: request.context.clone().unwrap_or_default(),
            ..Default::default()
        });

        let completion = CompletionRequest::new(rendered)
            .with_sampling(template.config.temperature, template.config.max_tokens)
            .with_json();
        let body = self
            .llm
            .complete(&completion)
            .await
            .context("memory analysis failed")?;
        let analysis: MemoryAnalysis = extract_json(&body)
            .ok_or_else(|| anyhow!("memory analysis response was not the expected JSON shape"))?;
        Ok(analysis.with_defaults())
    }

    /// Link the new memory to its nearest neighbours.
    async fn generate_links(&self, memory: &mut Memory) -> Result<usize> {
        let matches = self
            .store
            .query(&memory.embedding, LINK_CANDIDATES, None)
            .await?;

        let mut created = 0;
        for hit in matches {
            if hit.record.id == memory.id {
                continue;
            }
            let strength = link_strength(hit.distance);
            if strength <= LINK_THRESHOLD {
                continue;
            }
            let other = codec::from_record(&hit.record);
            let link_type = classify_link(memory, &other);
            let link = MemoryLink {
                target_id: other.id.clone(),
                link_type,
                strength,
                reason: format!(
                    "Semantically similar content ({:.0}% match)",
                    strength * 100.0
                ),
            };
            if memory.add_link(link) == LinkOutcome::Created {
                created += 1;
                debug!(
                    source = %memory.id,
                    target = %other.id,
                    link_type = link_type.as_str(),
                    strength,
                    "link created"
                );
            }
        }
        Ok(created)
    }

    /// Retrieve memories relevant to a query, scoped to a workspace.
    pub async fn retrieve(&self, request: RetrieveRequest) -> Result<RetrieveResponse> {
        let workspace_id = resolve_workspace(
            request.workspace_id.as_deref(),
            request.project_filter.as_deref(),
        )?;
        let max_results = if request.max_results <= 0 {
            5
        } else {
            request.max_results as usize
        };
        let min_relevance = if request.min_relevance <= 0.0 {
            0.3
        } else {
            request.min_relevance as f32
        };

        let embedding = self
            .embedder
            .embed(&request.query)
            .await
            .context("failed to embed query")?;

        // Scope clause: resolved workspace id, or the legacy project-path
        // field for records written before workspace ids existed.
        let legacy_value = match request.project_filter.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                normalize(raw).map_err(|err| anyhow!("invalid project filter: {err}"))?
            }
            _ => workspace_id.clone(),
        };
        let mut clauses = vec![Filter::or(vec![
            Filter::eq(KEY_WORKSPACE, workspace_id.clone()),
            Filter::eq(KEY_PROJECT_PATH, legacy_value),
        ])];
        if !request.code_types.is_empty() {
            clauses.push(Filter::is_in(
                codec::KEY_CODE_TYPE,
                request.code_types.iter().map(|value| json!(value)).collect(),
            ));
        }
        let filter = Filter::and(clauses);

        // Over-fetch so relevance filtering still fills max_results.
        let matches = self
            .store
            .query(&embedding, max_results * 2, Some(&filter))
            .await
            .context("memory query failed")?;

        let query_lower = request.query.to_lowercase();
        let mut memories = Vec::new();
        for hit in matches {
            let similarity = retrieval_similarity(hit.distance);
            if similarity < min_relevance {
                continue;
            }
            let memory = codec::from_record(&hit.record);
            let match_reason = match_reason(&memory, &query_lower);
            memories.push(RetrievedMemory {
                memory,
                similarity,
                match_reason,
            });
            if memories.len() >= max_results {
                break;
            }
        }

        debug!(
            workspace = %workspace_id,
            results = memories.len(),
            "retrieval complete"
        );
        Ok(RetrieveResponse {
            workspace_id,
            memories,
        })
    }
}

/// Link-type rule: shared code type beats keyword overlap beats the
/// generic solution edge.
fn classify_link(source: &Memory, other: &Memory) -> LinkType {
    if !source.code_type.is_empty() && source.code_type == other.code_type {
        return LinkType::Technology;
    }
    let overlap = source.keywords.iter().any(|keyword| {
        other
            .keywords
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(keyword))
    });
    if overlap {
        LinkType::Pattern
    } else {
        LinkType::Solution
    }
}

fn match_reason(memory: &Memory, query_lower: &str) -> String {
    memory
        .keywords
        .iter()
        .find(|keyword| !keyword.is_empty() && query_lower.contains(&keyword.to_lowercase()))
        .map(|keyword| format!("Keyword match: {keyword}"))
        .unwrap_or_else(|| "Content similarity match".to_string())
}
