//! Vector-store client.
//!
//! The store is an external collection of `(id, embedding, document,
//! metadata)` records.  This crate speaks the Chroma HTTP API
//! ([`ChromaStore`]) and ships an in-process [`InMemoryStore`] with the
//! same semantics for tests and offline development.  Records are flat and
//! untyped here; the memory crate layers its typed view on top.

mod chroma;
mod filter;
mod memstore;

pub use chroma::ChromaStore;
pub use filter::Filter;
pub use memstore::InMemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// One stored record, metadata still in its flat wire form.  The embedding
/// rides along so callers can rewrite metadata without re-embedding.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: String,
    pub document: String,
    pub embedding: Vec<f32>,
    pub metadata: Map<String, Value>,
}

/// A nearest-neighbour hit: the record plus its raw distance (L2-like,
/// `d >= 0`).  Distance→similarity conversion happens in the caller.
#[derive(Debug, Clone)]
pub struct QueryMatch {
    pub record: StoredRecord,
    pub distance: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if needed; "already exists" is success.
    async fn ensure_collection(&self) -> Result<()>;

    /// Insert or overwrite one record.  Re-adding an existing id replaces
    /// its document and metadata, which is how evolved memories persist.
    async fn add(
        &self,
        id: &str,
        embedding: &[f32],
        document: &str,
        metadata: &Map<String, Value>,
    ) -> Result<()>;

    /// Nearest-neighbour query, optionally constrained by a metadata filter.
    /// Returns at most `n` matches, closest first.
    async fn query(
        &self,
        embedding: &[f32],
        n: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<QueryMatch>>;

    /// Metadata fetch without a query embedding.  Used for workspace
    /// existence checks and stat paging.  `offset`/`limit` page through
    /// matches in store order.
    async fn get(
        &self,
        filter: Option<&Filter>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredRecord>>;

    /// Fetch specific records by id.  Missing ids are silently absent from
    /// the result.
    async fn fetch(&self, ids: &[String]) -> Result<Vec<StoredRecord>>;

    /// Number of records matching the filter.
    async fn count(&self, filter: Option<&Filter>) -> Result<usize> {
        // Generic fallback: page until exhausted.  Concrete stores may
        // answer this more cheaply.
        let mut total = 0;
        let mut offset = 0;
        loop {
            let page = self.get(filter, 500, offset).await?;
            if page.is_empty() {
                return Ok(total);
            }
            total += page.len();
            offset += page.len();
        }
    }
}
