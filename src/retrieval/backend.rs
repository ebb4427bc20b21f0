//! Vector backend seam and an in-memory simulation.
//!
//! The lifecycle engine never owns embeddings; it only needs similarity
//! search over documents whose metadata carries a tier label, optionally
//! with the tier constraint pushed into the backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::memory::Tier;

use super::filter::{MetadataFilter, TIER_METADATA_KEY};

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    /// Similarity in [0, 1], higher is closer
    pub score: f32,
    pub metadata: HashMap<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            score: 0.0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.metadata
            .insert(TIER_METADATA_KEY.to_string(), Value::from(tier.as_str()));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Tier label from metadata, if present and well formed.
    pub fn tier(&self) -> Option<Tier> {
        self.metadata
            .get(TIER_METADATA_KEY)
            .and_then(Value::as_str)
            .and_then(Tier::parse)
    }
}

/// Similarity search over tier-labelled documents.
#[async_trait]
pub trait VectorBackend: Send + Sync + std::fmt::Debug {
    /// Whether `search` honours a metadata filter natively.
    fn supports_metadata_filter(&self) -> bool;

    /// Top `limit` documents by similarity, highest first.
    ///
    /// Backends that cannot apply `filter` return `Error::FilterUnsupported`.
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Document>>;

    async fn store(&self, document: Document, embedding: Vec<f32>) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

/// How [`SimVectorBackend`] treats metadata filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterSupport {
    /// Advertised and applied
    #[default]
    Native,
    /// Not advertised; filtered calls fail
    Unsupported,
    /// Advertised, but filtered calls return `FilterUnsupported`
    Rejects,
    /// Advertised, but filtered calls fail with a backend error
    Fails,
    /// Advertised, but the filter is silently ignored
    Ignores,
}

/// One recorded `search` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchCall {
    pub limit: usize,
    pub filtered: bool,
}

/// In-memory backend with cosine similarity, for simulation and tests.
#[derive(Debug, Clone, Default)]
pub struct SimVectorBackend {
    documents: Arc<RwLock<HashMap<String, (Document, Vec<f32>)>>>,
    filter_support: FilterSupport,
    latency: Option<Duration>,
    calls: Arc<Mutex<Vec<SearchCall>>>,
}

impl SimVectorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter_support(mut self, support: FilterSupport) -> Self {
        self.filter_support = support;
        self
    }

    /// Sleep this long inside every search.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Searches issued so far, oldest first.
    pub fn calls(&self) -> Vec<SearchCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        // [-1, 1] -> [0, 1]
        (dot / (norm_a * norm_b) + 1.0) / 2.0
    }
}

#[async_trait]
impl VectorBackend for SimVectorBackend {
    fn supports_metadata_filter(&self) -> bool {
        self.filter_support != FilterSupport::Unsupported
    }

    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<Document>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(SearchCall {
                limit,
                filtered: filter.is_some(),
            });
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let applied = match (filter, self.filter_support) {
            (None, _) | (Some(_), FilterSupport::Ignores) => None,
            (Some(f), FilterSupport::Native) => Some(f),
            (Some(_), FilterSupport::Unsupported | FilterSupport::Rejects) => {
                return Err(Error::FilterUnsupported(
                    "simulated backend does not filter on metadata".to_string(),
                ))
            }
            (Some(_), FilterSupport::Fails) => {
                return Err(Error::Backend("simulated filtered search failure".to_string()))
            }
        };

        let documents = self
            .documents
            .read()
            .map_err(|e| Error::Backend(format!("backend lock poisoned: {e}")))?;

        let mut hits: Vec<Document> = documents
            .values()
            .filter(|(doc, _)| applied.map_or(true, |f| f.matches(doc.metadata.get(f.key()))))
            .filter(|(_, stored)| stored.len() == embedding.len())
            .map(|(doc, stored)| Document {
                score: Self::cosine_similarity(embedding, stored),
                ..doc.clone()
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn store(&self, document: Document, embedding: Vec<f32>) -> Result<()> {
        if document.id.is_empty() {
            return Err(Error::InvalidInput("document id must not be empty".to_string()));
        }
        if embedding.is_empty() {
            return Err(Error::InvalidInput("embedding must not be empty".to_string()));
        }

        let mut documents = self
            .documents
            .write()
            .map_err(|e| Error::Backend(format!("backend lock poisoned: {e}")))?;
        documents.insert(document.id.clone(), (document, embedding));
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        self.documents
            .read()
            .map(|d| d.len())
            .map_err(|e| Error::Backend(format!("backend lock poisoned: {e}")))
    }
}
