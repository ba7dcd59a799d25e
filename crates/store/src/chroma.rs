//! Chroma HTTP client.
//!
//! Collection bootstrap uses `get_or_create`, so an "already exists"
//! response is indistinguishable from a fresh create: both return the
//! collection id, which is cached write-once for the process lifetime.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use engram_config::ChromaDbConfig;

use crate::filter::Filter;
use crate::{QueryMatch, StoredRecord, VectorStore};

pub struct ChromaStore {
    client: reqwest::Client,
    base_url: String,
    collection_name: String,
    /// Write-once collection id cache.
    collection_id: OnceCell<String>,
}

impl ChromaStore {
    pub fn new(config: &ChromaDbConfig) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection_name: config.collection.clone(),
            collection_id: OnceCell::new(),
        })
    }

    async fn collection_id(&self) -> Result<&str> {
        self.collection_id
            .get_or_try_init(|| self.fetch_collection_id())
            .await
            .map(String::as_str)
    }

    async fn fetch_collection_id(&self) -> Result<String> {
        let endpoint = format!("{}/api/v1/collections", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(&json!({ "name": self.collection_name, "get_or_create": true }))
            .send()
            .await
            .context("collection bootstrap request failed")?;

        let status = response.status();
        let body: Value = response.json().await.context("collection response unreadable")?;
        if !status.is_success() {
            bail!("collection bootstrap returned {status}: {body}");
        }

        let id = body
            .get("id")
            .and_then(|id| id.as_str())
            .with_context(|| format!("collection response missing id: {body}"))?
            .to_string();
        info!(collection = %self.collection_name, id = %id, "vector-store collection ready");
        Ok(id)
    }

    async fn post(&self, suffix: &str, payload: &Value) -> Result<Value> {
        let collection_id = self.collection_id().await?;
        let endpoint = format!(
            "{}/api/v1/collections/{}/{}",
            self.base_url, collection_id, suffix
        );
        let response = self
            .client
            .post(&endpoint)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("vector-store {suffix} request failed"))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("vector-store {suffix} response unreadable"))?;
        if !status.is_success() {
            bail!("vector-store {suffix} returned {status}: {body}");
        }
        Ok(body)
    }
}

#[async_trait]
impl VectorStore for ChromaStore {
    async fn ensure_collection(&self) -> Result<()> {
        self.collection_id().await.map(|_| ())
    }

    async fn add(
        &self,
        id: &str,
        embedding: &[f32],
        document: &str,
        metadata: &Map<String, Value>,
    ) -> Result<()> {
        // upsert so re-adding an evolved memory replaces the old record.
        let payload = json!({
            "ids": [id],
            "embeddings": [embedding],
            "documents": [document],
            "metadatas": [metadata],
        });
        self.post("upsert", &payload).await?;
        debug!(id, "record stored");
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        n: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<QueryMatch>> {
        let mut payload = json!({
            "query_embeddings": [embedding],
            "n_results": n,
            "include": ["documents", "metadatas", "embeddings", "distances"],
        });
        if let Some(filter) = filter {
            payload["where"] = filter.to_value();
        }
        let body = self.post("query", &payload).await?;

        // Responses nest one row per query embedding; we always send one.
        let ids = first_row(&body, "ids");
        let documents = first_row(&body, "documents");
        let metadatas = first_row(&body, "metadatas");
        let embeddings = first_row(&body, "embeddings");
        let distances = first_row(&body, "distances");

        let mut matches = Vec::with_capacity(ids.len());
        for (index, id) in ids.iter().enumerate() {
            let Some(id) = id.as_str() else { continue };
            matches.push(QueryMatch {
                record: record_at(id, index, &documents, &embeddings, &metadatas),
                distance: distances
                    .get(index)
                    .and_then(|distance| distance.as_f64())
                    .unwrap_or(f64::MAX) as f32,
            });
        }
        Ok(matches)
    }

    async fn get(
        &self,
        filter: Option<&Filter>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredRecord>> {
        let mut payload = json!({
            "limit": limit,
            "offset": offset,
            "include": ["documents", "metadatas", "embeddings"],
        });
        if let Some(filter) = filter {
            payload["where"] = filter.to_value();
        }
        let body = self.post("get", &payload).await?;
        Ok(parse_flat_records(&body))
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<StoredRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let payload = json!({
            "ids": ids,
            "include": ["documents", "metadatas", "embeddings"],
        });
        let body = self.post("get", &payload).await?;
        Ok(parse_flat_records(&body))
    }
}

fn parse_flat_records(body: &Value) -> Vec<StoredRecord> {
    let ids = flat_row(body, "ids");
    let documents = flat_row(body, "documents");
    let embeddings = flat_row(body, "embeddings");
    let metadatas = flat_row(body, "metadatas");

    let mut records = Vec::with_capacity(ids.len());
    for (index, id) in ids.iter().enumerate() {
        let Some(id) = id.as_str() else { continue };
        records.push(record_at(id, index, &documents, &embeddings, &metadatas));
    }
    records
}

fn record_at(
    id: &str,
    index: usize,
    documents: &[Value],
    embeddings: &[Value],
    metadatas: &[Value],
) -> StoredRecord {
    StoredRecord {
        id: id.to_string(),
        document: documents
            .get(index)
            .and_then(|doc| doc.as_str())
            .unwrap_or_default()
            .to_string(),
        embedding: embeddings
            .get(index)
            .and_then(|row| row.as_array())
            .map(|values| {
                values
                    .iter()
                    .map(|value| value.as_f64().unwrap_or(0.0) as f32)
                    .collect()
            })
            .unwrap_or_default(),
        metadata: metadatas
            .get(index)
            .and_then(|meta| meta.as_object())
            .cloned()
            .unwrap_or_default(),
    }
}

/// `query` responses are `field: [[..]]`, one inner row per embedding.
fn first_row(body: &Value, field: &str) -> Vec<Value> {
    body.get(field)
        .and_then(|rows| rows.get(0))
        .and_then(|row| row.as_array())
        .cloned()
        .unwrap_or_default()
}

/// `get` responses are flat `field: [..]` arrays.
fn flat_row(body: &Value, field: &str) -> Vec<Value> {
    body.get(field)
        .and_then(|row| row.as_array())
        .cloned()
        .unwrap_or_default()
}
