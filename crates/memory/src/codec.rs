//! Flat metadata (de)serialisation between [`Memory`] and the store's
//! wire form.
//!
//! Recognised keys: `context`, `keywords` (comma-joined), `tags`
//! (comma-joined), `workspace_id`, `project_path` (legacy mirror of the
//! workspace id), `code_type`, `created_at` / `updated_at` (epoch seconds),
//! and `links` (JSON-encoded edge list).  Any other key is preserved
//! round-trip untouched.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value, json};

use engram_store::StoredRecord;

use crate::schema::{Memory, MemoryLink};

pub const KEY_CONTEXT: &str = "context";
pub const KEY_KEYWORDS: &str = "keywords";
pub const KEY_TAGS: &str = "tags";
pub const KEY_WORKSPACE: &str = "workspace_id";
pub const KEY_PROJECT_PATH: &str = "project_path";
pub const KEY_CODE_TYPE: &str = "code_type";
pub const KEY_CREATED_AT: &str = "created_at";
pub const KEY_UPDATED_AT: &str = "updated_at";
pub const KEY_LINKS: &str = "links";

const RECOGNISED: &[&str] = &[
    KEY_CONTEXT,
    KEY_KEYWORDS,
    KEY_TAGS,
    KEY_WORKSPACE,
    KEY_PROJECT_PATH,
    KEY_CODE_TYPE,
    KEY_CREATED_AT,
    KEY_UPDATED_AT,
    KEY_LINKS,
];

/// Flatten a memory's scalar fields into store metadata.
pub fn to_metadata(memory: &Memory) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert(KEY_CONTEXT.to_string(), json!(memory.context));
    metadata.insert(KEY_KEYWORDS.to_string(), json!(memory.keywords.join(",")));
    metadata.insert(KEY_TAGS.to_string(), json!(memory.tags.join(",")));
    metadata.insert(KEY_WORKSPACE.to_string(), json!(memory.workspace_id));
    metadata.insert(KEY_PROJECT_PATH.to_string(), json!(memory.workspace_id));
    metadata.insert(KEY_CODE_TYPE.to_string(), json!(memory.code_type));
    metadata.insert(
        KEY_CREATED_AT.to_string(),
        json!(memory.created_at.timestamp()),
    );
    metadata.insert(
        KEY_UPDATED_AT.to_string(),
        json!(memory.updated_at.timestamp()),
    );
    if !memory.links.is_empty() {
        let encoded = serde_json::to_string(&memory.links).unwrap_or_else(|_| "[]".to_string());
        metadata.insert(KEY_LINKS.to_string(), json!(encoded));
    }
    // Caller-supplied extras never override the recognised keys.
    for (key, value) in &memory.metadata {
        if !RECOGNISED.contains(&key.as_str()) {
            metadata.insert(key.clone(), value.clone());
        }
    }
    metadata
}

/// Reconstruct a memory view from a stored record.
pub fn from_record(record: &StoredRecord) -> Memory {
    let metadata = &record.metadata;
    let string_of = |key: &str| -> String {
        metadata
            .get(key)
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string()
    };

    let links: Vec<MemoryLink> = metadata
        .get(KEY_LINKS)
        .and_then(|value| value.as_str())
        .and_then(|encoded| serde_json::from_str(encoded).ok())
        .unwrap_or_default();

    let extras: Map<String, Value> = metadata
        .iter()
        .filter(|(key, _)| !RECOGNISED.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Memory {
        id: record.id.clone(),
        content: record.document.clone(),
        context: string_of(KEY_CONTEXT),
        keywords: split_joined(&string_of(KEY_KEYWORDS)),
        tags: split_joined(&string_of(KEY_TAGS)),
        workspace_id: string_of(KEY_WORKSPACE),
        code_type: string_of(KEY_CODE_TYPE),
        embedding: record.embedding.clone(),
        links,
        created_at: epoch_of(metadata, KEY_CREATED_AT),
        updated_at: epoch_of(metadata, KEY_UPDATED_AT),
        metadata: extras,
    }
}

fn split_joined(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

fn epoch_of(metadata: &Map<String, Value>, key: &str) -> DateTime<Utc> {
    metadata
        .get(key)
        .and_then(|value| value.as_i64())
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LinkType;

    fn sample() -> Memory {
        let created = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        Memory {
            id: "mem-1".to_string(),
            content: "def add(a, b): return a + b".to_string(),
            context: "Two-integer addition function.".to_string(),
            keywords: vec!["add".to_string(), "function".to_string()],
            tags: vec!["python".to_string(), "arithmetic".to_string()],
            workspace_id: "algs".to_string(),
            code_type: "python".to_string(),
            embedding: vec![0.1, 0.2],
            links: vec![MemoryLink {
                target_id: "mem-2".to_string(),
                link_type: LinkType::Technology,
                strength: 0.9,
                reason: "Semantically similar content (90% match)".to_string(),
            }],
            created_at: created,
            updated_at: created,
            metadata: {
                let mut extras = Map::new();
                extras.insert("trigger".to_string(), json!("manual"));
                extras
            },
        }
    }

    #[test]
    fn flattens_scalars_and_joins_lists() {
        let metadata = to_metadata(&sample());
        assert_eq!(metadata[KEY_KEYWORDS], "add,function");
        assert_eq!(metadata[KEY_TAGS], "python,arithmetic");
        assert_eq!(metadata[KEY_WORKSPACE], "algs");
        assert_eq!(metadata[KEY_PROJECT_PATH], "algs");
        assert_eq!(metadata[KEY_CREATED_AT], 1_700_000_000i64);
        assert_eq!(metadata["trigger"], "manual");
    }

    #[test]
    fn extras_cannot_shadow_recognised_keys() {
        let mut memory = sample();
        memory
            .metadata
            .insert(KEY_WORKSPACE.to_string(), json!("spoofed"));
        let metadata = to_metadata(&memory);
        assert_eq!(metadata[KEY_WORKSPACE], "algs");
    }

    #[test]
    fn round_trips_through_a_record() {
        let memory = sample();
        let record = StoredRecord {
            id: memory.id.clone(),
            document: memory.content.clone(),
            embedding: memory.embedding.clone(),
            metadata: to_metadata(&memory),
        };
        let restored = from_record(&record);

        assert_eq!(restored.id, memory.id);
        assert_eq!(restored.content, memory.content);
        assert_eq!(restored.context, memory.context);
        assert_eq!(restored.keywords, memory.keywords);
        assert_eq!(restored.tags, memory.tags);
        assert_eq!(restored.workspace_id, memory.workspace_id);
        assert_eq!(restored.code_type, memory.code_type);
        assert_eq!(restored.created_at, memory.created_at);
        assert_eq!(restored.links.len(), 1);
        assert_eq!(restored.links[0].target_id, "mem-2");
        assert_eq!(restored.links[0].link_type, LinkType::Technology);
        // Unrecognised keys survive the round trip.
        assert_eq!(restored.metadata["trigger"], "manual");
    }

    #[test]
    fn tolerates_missing_and_malformed_fields() {
        let record = StoredRecord {
            id: "bare".to_string(),
            document: "doc".to_string(),
            embedding: vec![],
            metadata: {
                let mut metadata = Map::new();
                metadata.insert(KEY_LINKS.to_string(), json!("{corrupt"));
                metadata
            },
        };
        let memory = from_record(&record);
        assert!(memory.keywords.is_empty());
        assert!(memory.links.is_empty());
        assert_eq!(memory.workspace_id, "");
    }
}
