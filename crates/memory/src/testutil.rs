//! In-process stub providers shared by the test suites in this crate and
//! downstream ones.  Not part of the public contract.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use engram_embeddings::Embedder;
use engram_llm::{CompletionRequest, LanguageModel, LlmError};
use engram_prompts::PromptManager;
use engram_store::{Filter, InMemoryStore, QueryMatch, StoredRecord, VectorStore};

use crate::service::MemoryService;

/// Scripted language model.  `always` repeats one canned reply; `sequence`
/// pops replies in order and repeats the last; `failing` errors every call.
pub struct StubLlm {
    script: Mutex<Vec<String>>,
    fail: bool,
    prompts_seen: Mutex<Vec<String>>,
}

impl StubLlm {
    pub fn always(reply: &str) -> Self {
        Self {
            script: Mutex::new(vec![reply.to_string()]),
            fail: false,
            prompts_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn sequence(replies: Vec<&str>) -> Self {
        Self {
            script: Mutex::new(replies.into_iter().map(String::from).collect()),
            fail: false,
            prompts_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            fail: true,
            prompts_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts_seen(&self) -> Vec<String> {
        self.prompts_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for StubLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.prompts_seen
            .lock()
            .unwrap()
            .push(request.prompt.clone());
        if self.fail {
            return Err(LlmError::Transport("stubbed failure".to_string()));
        }
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            Ok(script.remove(0))
        } else {
            script
                .first()
                .cloned()
                .ok_or_else(|| LlmError::Transport("stub script empty".to_string()))
        }
    }
}

/// Deterministic embedder with explicit text → vector assignments and an
/// optional catch-all default.
pub struct StaticEmbedder {
    map: HashMap<String, Vec<f32>>,
    default: Option<Vec<f32>>,
}

impl StaticEmbedder {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            default: None,
        }
    }

    /// Every text maps to the same vector.
    pub fn fixed(vector: Vec<f32>) -> Self {
        Self {
            map: HashMap::new(),
            default: Some(vector),
        }
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.map.insert(text.to_string(), vector);
        self
    }

    pub fn with_default(mut self, vector: Vec<f32>) -> Self {
        self.default = Some(vector);
        self
    }
}

impl Default for StaticEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for StaticEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(vector) = self.map.get(text) {
            return Ok(vector.clone());
        }
        self.default
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no stub embedding for '{text}'"))
    }
}

/// Store wrapper whose nearest-neighbour query always fails; everything
/// else delegates.  Exercises the best-effort link-generation path.
pub struct FailingQueryStore {
    inner: Arc<InMemoryStore>,
}

impl FailingQueryStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl VectorStore for FailingQueryStore {
    async fn ensure_collection(&self) -> Result<()> {
        self.inner.ensure_collection().await
    }

    async fn add(
        &self,
        id: &str,
        embedding: &[f32],
        document: &str,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.inner.add(id, embedding, document, metadata).await
    }

    async fn query(
        &self,
        _embedding: &[f32],
        _n: usize,
        _filter: Option<&Filter>,
    ) -> Result<Vec<QueryMatch>> {
        anyhow::bail!("query unavailable")
    }

    async fn get(
        &self,
        filter: Option<&Filter>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredRecord>> {
        self.inner.get(filter, limit, offset).await
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<StoredRecord>> {
        self.inner.fetch(ids).await
    }
}

/// Wire a [`MemoryService`] from parts, loading templates from `dir`.
pub fn service_with(
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    prompts_dir: &Path,
) -> MemoryService {
    MemoryService::new(store, embedder, llm, Arc::new(PromptManager::with_directory(prompts_dir)))
}

/// Minimal note-construction template fixture.
pub fn write_note_template(dir: &Path) {
    std::fs::write(
        dir.join("note_construction.yaml"),
        "name: note_construction\nversion: 1\ntemplate: |\n  Analyse {{content}} ({{code_type}}) in {{project_path}}. Hint: {{context}}\nconfig:\n  temperature: 0.1\n  max_tokens: 1000\n",
    )
    .unwrap();
}

/// Minimal evolution template fixture.
pub fn write_evolution_template(dir: &Path) {
    std::fs::write(
        dir.join("memory_evolution.yaml"),
        "name: memory_evolution\nversion: 1\ntemplate: |\n  Review these memories and propose refinements:\n  {{memories}}\nconfig:\n  temperature: 0.2\n  max_tokens: 2000\n",
    )
    .unwrap();
}
