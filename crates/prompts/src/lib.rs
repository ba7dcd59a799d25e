//! Prompt template manager.
//!
//! Templates are YAML records in a directory, one file per template,
//! loaded on first use and cached by name.  With hot reload enabled a
//! template whose file mtime is newer than its cached load time is re-read
//! on next use; otherwise the first load is authoritative for the process.

mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use serde::Deserialize;
use tracing::debug;

use engram_config::PromptsConfig;

pub use watcher::PromptWatcher;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template '{0}' not found in {1}")]
    NotFound(String, String),
    #[error("template file {0} is unreadable: {1}")]
    Unreadable(String, String),
    #[error("template file {0} is not valid YAML: {1}")]
    Malformed(String, String),
    #[error("template '{name}' is invalid: {reason}")]
    Invalid { name: String, reason: String },
}

/// Model-configuration attributes carried by every template.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 1000,
            top_p: None,
            top_k: None,
        }
    }
}

/// A parsed template record.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub description: String,
    pub template: String,
    #[serde(default)]
    pub config: ModelConfig,
}

fn default_version() -> u32 {
    1
}

impl PromptTemplate {
    fn validate(&self, file: &str) -> Result<(), TemplateError> {
        let fail = |reason: &str| TemplateError::Invalid {
            name: if self.name.is_empty() {
                file.to_string()
            } else {
                self.name.clone()
            },
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(fail("name must not be empty"));
        }
        if self.template.trim().is_empty() {
            return Err(fail("body must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.config.temperature) {
            return Err(fail("temperature must be within [0, 2]"));
        }
        if self.config.max_tokens == 0 {
            return Err(fail("max_tokens must be greater than zero"));
        }
        Ok(())
    }

    /// Substitute `{{field}}` placeholders.  Unknown placeholders are left
    /// intact so a typo shows up in the rendered prompt rather than
    /// vanishing.
    pub fn render(&self, context: &RenderContext) -> String {
        let mut rendered = self.template.clone();
        for (key, value) in context.bindings() {
            rendered = rendered.replace(&format!("{{{{{key}}}}}"), &value);
        }
        rendered
    }
}

/// The well-known render fields plus an open custom map.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub content: String,
    pub project_path: String,
    pub code_type: String,
    pub context: String,
    pub query: String,
    pub memories: String,
    pub custom: HashMap<String, String>,
}

impl RenderContext {
    fn bindings(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("content".to_string(), self.content.clone()),
            ("project_path".to_string(), self.project_path.clone()),
            ("code_type".to_string(), self.code_type.clone()),
            ("context".to_string(), self.context.clone()),
            ("query".to_string(), self.query.clone()),
            ("memories".to_string(), self.memories.clone()),
        ];
        for (key, value) in &self.custom {
            pairs.push((key.clone(), value.clone()));
        }
        pairs
    }
}

struct CachedTemplate {
    template: PromptTemplate,
    loaded_at: SystemTime,
}

/// Loads, validates, caches, and renders named templates.
pub struct PromptManager {
    directory: PathBuf,
    cache_enabled: bool,
    hot_reload: bool,
    cache: RwLock<HashMap<String, CachedTemplate>>,
}

impl PromptManager {
    pub fn new(config: &PromptsConfig) -> Self {
        Self {
            directory: PathBuf::from(&config.directory),
            cache_enabled: config.cache_enabled,
            hot_reload: config.hot_reload,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_directory(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            cache_enabled: true,
            hot_reload: false,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch a template by name, consulting the cache per the reload policy.
    pub fn get(&self, name: &str) -> Result<PromptTemplate, TemplateError> {
        let path = self.directory.join(format!("{name}.yaml"));

        if self.cache_enabled {
            let cache = self.cache.read().unwrap();
            if let Some(cached) = cache.get(name) {
                if !self.hot_reload || !is_stale(&path, cached.loaded_at) {
                    return Ok(cached.template.clone());
                }
                debug!(name, "template file changed on disk — reloading");
            }
        }

        let template = self.load(name, &path)?;
        if self.cache_enabled {
            self.cache.write().unwrap().insert(
                name.to_string(),
                CachedTemplate {
                    template: template.clone(),
                    loaded_at: SystemTime::now(),
                },
            );
        }
        Ok(template)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Drop a cached template so the next `get` re-reads it from disk.
    /// Used by the directory watcher.
    pub fn invalidate(&self, name: &str) {
        self.cache.write().unwrap().remove(name);
    }

    fn load(&self, name: &str, path: &Path) -> Result<PromptTemplate, TemplateError> {
        let file = path.display().to_string();
        if !path.exists() {
            return Err(TemplateError::NotFound(
                name.to_string(),
                self.directory.display().to_string(),
            ));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|err| TemplateError::Unreadable(file.clone(), err.to_string()))?;
        let template: PromptTemplate = serde_yaml::from_str(&raw)
            .map_err(|err| TemplateError::Malformed(file.clone(), err.to_string()))?;
        template.validate(&file)?;
        debug!(name = %template.name, version = template.version, "template loaded");
        Ok(template)
    }
}

fn is_stale(path: &Path, loaded_at: SystemTime) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(|mtime| mtime > loaded_at)
        .unwrap_or(false)
}
