//! Workspace identifiers and the derived workspace view.
//!
//! A workspace is a scope label, either a filesystem-like path or a logical
//! name.  There is no workspace record in the store: existence means "at
//! least one memory carries this id".  Explicitly created-but-empty
//! workspaces live in an in-process registry until their first memory
//! write materialises them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::{Result, bail};
use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use engram_store::{Filter, VectorStore};

use crate::codec::{KEY_CREATED_AT, KEY_UPDATED_AT, KEY_WORKSPACE};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WorkspaceError {
    #[error("workspace identifier must not be empty")]
    Empty,
    #[error("workspace identifier must not contain newlines")]
    Newline,
    #[error("workspace identifier contains invalid character '{0}'")]
    InvalidCharacter(char),
}

/// Normalise and validate a workspace identifier.
///
/// Paths are canonicalised lexically (collapse `.`/`..`, strip the trailing
/// separator); logical names are trimmed and lower-cased.  Normalisation is
/// a retraction: applying it twice equals applying it once.
pub fn normalize(raw: &str) -> Result<String, WorkspaceError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(WorkspaceError::Empty);
    }
    if trimmed.contains('\n') || trimmed.contains('\r') {
        return Err(WorkspaceError::Newline);
    }

    let normalised = if is_path(trimmed) {
        canonicalize_lexically(trimmed)
    } else {
        trimmed.to_lowercase()
    };

    if normalised.is_empty() {
        return Err(WorkspaceError::Empty);
    }
    for character in normalised.chars() {
        let allowed = character.is_ascii_alphanumeric()
            || matches!(character, '.' | '_' | '/' | '-');
        if !allowed {
            return Err(WorkspaceError::InvalidCharacter(character));
        }
    }
    Ok(normalised)
}

/// The default identifier: the process working directory, or the literal
/// `default` when it is unavailable or fails validation.
pub fn default_identifier() -> String {
    std::env::current_dir()
        .ok()
        .map(|cwd| cwd.display().to_string())
        .and_then(|cwd| normalize(&cwd).ok())
        .unwrap_or_else(|| "default".to_string())
}

/// Path detection: absolute, contains a separator, or dot-relative.
fn is_path(raw: &str) -> bool {
    raw.starts_with('/') || raw.contains('/') || raw.starts_with("./") || raw.starts_with("../")
}

/// Pure lexical canonicalisation; never touches the filesystem, so the
/// retraction property holds for identifiers that do not exist on disk.
fn canonicalize_lexically(raw: &str) -> String {
    let absolute = raw.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                let last_is_up = matches!(segments.last(), Some(&".."));
                if !absolute && (segments.is_empty() || last_is_up) {
                    // Relative prefixes like "../.." cannot collapse.
                    segments.push("..");
                } else {
                    segments.pop();
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        String::new()
    } else if !joined.contains('/') && !joined.starts_with("..") {
        // A relative path that collapsed to a bare segment would be
        // re-classified as a logical name on the next pass; keep the
        // explicit relative marker so normalisation stays idempotent.
        format!("./{joined}")
    } else {
        joined
    }
}

/// Synthesised display name for an identifier with no stored record.
pub fn display_name(identifier: &str) -> String {
    if identifier == "default" {
        return "Default Workspace".to_string();
    }
    if is_path(identifier) {
        let basename = identifier
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|part| !part.is_empty())
            .unwrap_or(identifier);
        return format!("Project: {basename}");
    }
    title_case(identifier)
}

fn title_case(name: &str) -> String {
    name.split(|c| c == '-' || c == '_' || c == ' ')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Derived view over one workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub identifier: String,
    pub name: String,
    pub description: String,
    pub memory_count: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Explicitly created workspace awaiting its first memory.
struct RegisteredWorkspace {
    name: Option<String>,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

pub struct WorkspaceService {
    store: Arc<dyn VectorStore>,
    registry: Mutex<HashMap<String, RegisteredWorkspace>>,
}

const STATS_PAGE: usize = 200;

impl WorkspaceService {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self {
            store,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Operational existence: a stored memory carries the id, or the
    /// workspace was explicitly created in this process.
    pub async fn exists(&self, identifier: &str) -> Result<bool> {
        if self.registry.lock().unwrap().contains_key(identifier) {
            return Ok(true);
        }
        let filter = Filter::eq(KEY_WORKSPACE, identifier);
        let page = self.store.get(Some(&filter), 1, 0).await?;
        Ok(!page.is_empty())
    }

    /// Smart init: retrieve when the workspace exists, create otherwise.
    /// Returns the info plus whether a create happened.
    pub async fn init(
        &self,
        identifier: Option<&str>,
        name: Option<&str>,
    ) -> Result<(WorkspaceInfo, bool)> {
        let resolved = match identifier {
            Some(raw) => normalize(raw)?,
            None => default_identifier(),
        };
        if self.exists(&resolved).await? {
            return Ok((self.describe(&resolved).await?, false));
        }
        let info = self.create_normalized(&resolved, name, None)?;
        Ok((info, true))
    }

    /// Explicit create; fails when the workspace already exists.
    pub async fn create(
        &self,
        identifier: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<WorkspaceInfo> {
        let resolved = normalize(identifier)?;
        if self.exists(&resolved).await? {
            bail!("workspace '{resolved}' already exists");
        }
        self.create_normalized(&resolved, name, description)
    }

    fn create_normalized(
        &self,
        resolved: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<WorkspaceInfo> {
        let created_at = Utc::now();
        self.registry.lock().unwrap().insert(
            resolved.to_string(),
            RegisteredWorkspace {
                name: name.map(ToString::to_string),
                description: description.map(ToString::to_string),
                created_at,
            },
        );
        debug!(workspace = resolved, "workspace created");
        Ok(WorkspaceInfo {
            identifier: resolved.to_string(),
            name: name
                .map(ToString::to_string)
                .unwrap_or_else(|| display_name(resolved)),
            description: description
                .map(ToString::to_string)
                .unwrap_or_else(|| synthesized_description(resolved)),
            memory_count: 0,
            created_at: None,
            updated_at: None,
        })
    }

    /// Explicit retrieve; fails when the workspace does not exist.
    pub async fn retrieve(&self, identifier: &str) -> Result<WorkspaceInfo> {
        let resolved = normalize(identifier)?;
        if !self.exists(&resolved).await? {
            bail!("workspace '{resolved}' does not exist");
        }
        self.describe(&resolved).await
    }

    /// Build the derived view by paging metadata of every matching memory.
    pub async fn describe(&self, identifier: &str) -> Result<WorkspaceInfo> {
        let filter = Filter::eq(KEY_WORKSPACE, identifier);
        let mut memory_count = 0usize;
        let mut earliest: Option<i64> = None;
        let mut latest: Option<i64> = None;

        let mut offset = 0;
        loop {
            let page = self.store.get(Some(&filter), STATS_PAGE, offset).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            memory_count += page.len();
            for record in &page {
                if let Some(created) = record.metadata.get(KEY_CREATED_AT).and_then(|v| v.as_i64())
                {
                    earliest = Some(earliest.map_or(created, |current| current.min(created)));
                }
                if let Some(updated) = record.metadata.get(KEY_UPDATED_AT).and_then(|v| v.as_i64())
                {
                    latest = Some(latest.map_or(updated, |current| current.max(updated)));
                }
            }
        }

        let (name, description) = {
            let registry = self.registry.lock().unwrap();
            match registry.get(identifier) {
                Some(entry) => (entry.name.clone(), entry.description.clone()),
                None => (None, None),
            }
        };

        Ok(WorkspaceInfo {
            identifier: identifier.to_string(),
            name: name.unwrap_or_else(|| display_name(identifier)),
            description: description.unwrap_or_else(|| synthesized_description(identifier)),
            memory_count,
            created_at: earliest.and_then(|sec| Utc.timestamp_opt(sec, 0).single()),
            updated_at: latest.and_then(|sec| Utc.timestamp_opt(sec, 0).single()),
        })
    }
}

fn synthesized_description(identifier: &str) -> String {
    if identifier == "default" {
        "Fallback workspace for unscoped memories".to_string()
    } else if is_path(identifier) {
        format!("Workspace for the project at {identifier}")
    } else {
        format!("Workspace '{identifier}'")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_store::InMemoryStore;
    use serde_json::json;

    // ── normalisation ──────────────────────────────────────────────────────

    #[test]
    fn names_are_trimmed_and_lowercased() {
        assert_eq!(normalize("  Web-2024 ").unwrap(), "web-2024");
    }

    #[test]
    fn paths_are_canonicalised() {
        assert_eq!(normalize("/a/b/../c/").unwrap(), "/a/c");
        assert_eq!(normalize("a/./b").unwrap(), "a/b");
        assert_eq!(normalize("../lib").unwrap(), "../lib");
    }

    #[test]
    fn relative_path_keeps_its_marker() {
        // "./Foo" must stay a path, not decay into the logical name "foo".
        assert_eq!(normalize("./Foo").unwrap(), "./Foo");
    }

    #[test]
    fn normalisation_is_a_retraction() {
        for raw in ["  Web-2024 ", "/a/b/../c/", "./Foo", "a/./b", "../lib", "default"] {
            let once = normalize(raw).unwrap();
            let twice = normalize(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn rejects_empty_newline_and_bad_characters() {
        assert_eq!(normalize("   "), Err(WorkspaceError::Empty));
        assert_eq!(normalize("a\nb"), Err(WorkspaceError::Newline));
        assert_eq!(
            normalize("has space"),
            Err(WorkspaceError::InvalidCharacter(' '))
        );
        assert_eq!(
            normalize("semi;colon"),
            Err(WorkspaceError::InvalidCharacter(';'))
        );
    }

    // ── display synthesis ──────────────────────────────────────────────────

    #[test]
    fn display_names_by_identifier_kind() {
        assert_eq!(display_name("/home/dev/webapp"), "Project: webapp");
        assert_eq!(display_name("web-2024"), "Web 2024");
        assert_eq!(display_name("default"), "Default Workspace");
    }

    // ── service ────────────────────────────────────────────────────────────

    fn record_meta(workspace: &str, created: i64, updated: i64) -> serde_json::Map<String, serde_json::Value> {
        let mut metadata = serde_json::Map::new();
        metadata.insert(KEY_WORKSPACE.to_string(), json!(workspace));
        metadata.insert(KEY_CREATED_AT.to_string(), json!(created));
        metadata.insert(KEY_UPDATED_AT.to_string(), json!(updated));
        metadata
    }

    #[tokio::test]
    async fn create_then_create_fails() {
        let store = Arc::new(InMemoryStore::new());
        let service = WorkspaceService::new(store);

        let info = service.create("web-2024", None, None).await.unwrap();
        assert_eq!(info.identifier, "web-2024");
        assert_eq!(info.memory_count, 0);

        let err = service.create("Web-2024", None, None).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn retrieve_missing_workspace_fails() {
        let store = Arc::new(InMemoryStore::new());
        let service = WorkspaceService::new(store);
        let err = service.retrieve("ghost").await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn init_creates_then_retrieves() {
        let store = Arc::new(InMemoryStore::new());
        let service = WorkspaceService::new(store);

        let (_, created) = service.init(Some("api"), None).await.unwrap();
        assert!(created);
        let (_, created_again) = service.init(Some("api"), None).await.unwrap();
        assert!(!created_again);
    }

    #[tokio::test]
    async fn stats_derive_from_stored_memories() {
        let store = Arc::new(InMemoryStore::new());
        store
            .add("m1", &[0.0], "doc1", &record_meta("algs", 100, 150))
            .await
            .unwrap();
        store
            .add("m2", &[0.0], "doc2", &record_meta("algs", 90, 200))
            .await
            .unwrap();
        store
            .add("m3", &[0.0], "doc3", &record_meta("other", 10, 20))
            .await
            .unwrap();

        let service = WorkspaceService::new(store);
        let info = service.retrieve("algs").await.unwrap();
        assert_eq!(info.memory_count, 2);
        assert_eq!(info.created_at.unwrap().timestamp(), 90);
        assert_eq!(info.updated_at.unwrap().timestamp(), 200);
        assert_eq!(info.name, "Algs");
    }

    #[tokio::test]
    async fn existence_is_satisfied_by_stored_memory() {
        let store = Arc::new(InMemoryStore::new());
        store
            .add("m1", &[0.0], "doc", &record_meta("seen", 1, 1))
            .await
            .unwrap();
        let service = WorkspaceService::new(store);
        assert!(service.exists("seen").await.unwrap());
        assert!(!service.exists("unseen").await.unwrap());
    }

    #[tokio::test]
    async fn created_workspace_reports_custom_name() {
        let store = Arc::new(InMemoryStore::new());
        let service = WorkspaceService::new(store);
        service
            .create("web-2024", Some("Web Platform"), Some("frontend work"))
            .await
            .unwrap();
        let info = service.retrieve("web-2024").await.unwrap();
        assert_eq!(info.name, "Web Platform");
        assert_eq!(info.description, "frontend work");
    }
}
