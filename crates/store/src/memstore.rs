//! In-process [`VectorStore`] with the same observable semantics as the
//! remote one: squared-L2 distances, metadata filters, insertion-order
//! paging.  Used by the test suites and handy for offline development.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::filter::Filter;
use crate::{QueryMatch, StoredRecord, VectorStore};

#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<Vec<OwnedRecord>>,
}

struct OwnedRecord {
    id: String,
    embedding: Vec<f32>,
    document: String,
    metadata: Map<String, Value>,
}

impl OwnedRecord {
    fn to_stored(&self) -> StoredRecord {
        StoredRecord {
            id: self.id.clone(),
            document: self.document.clone(),
            embedding: self.embedding.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let mut sum = 0.0;
    for i in 0..len {
        let diff = a[i] - b[i];
        sum += diff * diff;
    }
    // Dimension mismatch contributes the full magnitude of the tail.
    for value in &a[len..] {
        sum += value * value;
    }
    for value in &b[len..] {
        sum += value * value;
    }
    sum
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn ensure_collection(&self) -> Result<()> {
        Ok(())
    }

    async fn add(
        &self,
        id: &str,
        embedding: &[f32],
        document: &str,
        metadata: &Map<String, Value>,
    ) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.iter_mut().find(|record| record.id == id) {
            existing.embedding = embedding.to_vec();
            existing.document = document.to_string();
            existing.metadata = metadata.clone();
        } else {
            records.push(OwnedRecord {
                id: id.to_string(),
                embedding: embedding.to_vec(),
                document: document.to_string(),
                metadata: metadata.clone(),
            });
        }
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        n: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<QueryMatch>> {
        let records = self.records.lock().unwrap();
        let mut matches: Vec<QueryMatch> = records
            .iter()
            .filter(|record| {
                filter
                    .map(|filter| filter.matches(&record.metadata))
                    .unwrap_or(true)
            })
            .map(|record| QueryMatch {
                record: record.to_stored(),
                distance: squared_l2(&record.embedding, embedding),
            })
            .collect();
        matches.sort_by(|left, right| left.distance.total_cmp(&right.distance));
        matches.truncate(n);
        Ok(matches)
    }

    async fn get(
        &self,
        filter: Option<&Filter>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|record| {
                filter
                    .map(|filter| filter.matches(&record.metadata))
                    .unwrap_or(true)
            })
            .skip(offset)
            .take(limit)
            .map(OwnedRecord::to_stored)
            .collect())
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<StoredRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter(|record| ids.iter().any(|id| *id == record.id))
            .map(OwnedRecord::to_stored)
            .collect())
    }
}
