//! Tier-scoped retrieval.
//!
//! The tier constraint is pushed into the backend when it advertises
//! metadata filtering. Otherwise, or when the filtered call fails, the
//! retriever over-fetches unfiltered results and filters them itself,
//! widening the over-fetch while pages come back full but short on matches.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::config::{LifecycleConfig, RetrievalConfig};
use crate::error::{Error, Result};
use crate::memory::Tier;

use super::backend::{Document, VectorBackend};
use super::filter::MetadataFilter;

/// Create a linked cancellation handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Observer side of a cancellation signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle was dropped first.
    async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

async fn wait_cancelled(signal: &mut Option<CancelSignal>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

/// How a query was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Tier filter applied by the backend
    Native,
    /// Client-side filtering over `rounds` unfiltered fetches
    OverFetch { rounds: u32 },
    /// Engine disabled; no tier scoping
    Unscoped,
}

/// Documents plus how they were obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub documents: Vec<Document>,
    pub strategy: Strategy,
    /// Deadline hit; `documents` holds what was gathered before it
    pub timed_out: bool,
    pub cancelled: bool,
}

impl QueryOutcome {
    fn new(strategy: Strategy) -> Self {
        Self {
            documents: Vec::new(),
            strategy,
            timed_out: false,
            cancelled: false,
        }
    }
}

/// Restricts vector retrieval to a set of tiers.
#[derive(Debug, Clone)]
pub struct TierIsolatedRetriever {
    backend: Arc<dyn VectorBackend>,
    config: RetrievalConfig,
    enabled: bool,
}

impl TierIsolatedRetriever {
    pub fn new(backend: Arc<dyn VectorBackend>, config: RetrievalConfig) -> Self {
        Self {
            backend,
            config,
            enabled: true,
        }
    }

    /// Retriever honouring the engine switch in `config`.
    pub fn from_config(backend: Arc<dyn VectorBackend>, config: &LifecycleConfig) -> Self {
        Self {
            backend,
            config: config.retrieval.clone(),
            enabled: config.enabled,
        }
    }

    /// Single-tier convenience for [`query`](Self::query).
    ///
    /// On timeout the documents gathered so far are returned, possibly none.
    pub async fn query_tier(
        &self,
        embedding: &[f32],
        tier: Tier,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let outcome = self.query(embedding, &[tier], limit, None).await?;
        if outcome.timed_out {
            warn!(
                %tier,
                results = outcome.documents.len(),
                timeout_ms = self.config.timeout_ms,
                "Tier query hit its deadline"
            );
        }
        Ok(outcome.documents)
    }

    /// Up to `limit` documents whose tier is in `tiers`, best first.
    ///
    /// Bounded by the configured timeout; on timeout or cancellation the
    /// documents gathered so far are returned.
    #[instrument(skip(self, embedding, cancel))]
    pub async fn query(
        &self,
        embedding: &[f32],
        tiers: &[Tier],
        limit: usize,
        cancel: Option<&CancelSignal>,
    ) -> Result<QueryOutcome> {
        let deadline = Instant::now() + self.config.timeout();
        let mut cancel = cancel.cloned();

        if !self.enabled {
            return self.unscoped(embedding, limit, deadline, &mut cancel).await;
        }
        if tiers.is_empty() {
            return Err(Error::InvalidInput(
                "tier-scoped query needs at least one tier".to_string(),
            ));
        }
        if limit == 0 {
            return Ok(QueryOutcome::new(Strategy::Native));
        }

        let filter = MetadataFilter::tiers(tiers);

        if self.backend.supports_metadata_filter() {
            let search = self.backend.search(embedding, limit, Some(&filter));
            tokio::select! {
                biased;
                _ = wait_cancelled(&mut cancel) => {
                    debug!("Query cancelled during native search");
                    return Ok(QueryOutcome { cancelled: true, ..QueryOutcome::new(Strategy::Native) });
                }
                result = timeout_at(deadline, search) => match result {
                    Ok(Ok(documents)) => {
                        let returned = documents.len();
                        let kept = retain_tiers(documents, tiers, limit);
                        // A leaky filter can hide matches behind out-of-tier hits
                        if kept.len() >= limit || kept.len() == returned {
                            info!(strategy = "native", results = kept.len(), "Tier-scoped query");
                            return Ok(QueryOutcome { documents: kept, ..QueryOutcome::new(Strategy::Native) });
                        }
                        warn!(returned, kept = kept.len(), "Backend filter leaked other tiers; over-fetching");
                    }
                    Ok(Err(Error::FilterUnsupported(reason))) => {
                        debug!(%reason, "Backend rejected tier filter; over-fetching");
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Filtered search failed; over-fetching");
                    }
                    Err(_) => {
                        warn!(timeout_ms = self.config.timeout_ms, "Native search timed out");
                        return Ok(QueryOutcome { timed_out: true, ..QueryOutcome::new(Strategy::Native) });
                    }
                },
            }
        }

        self.over_fetch(embedding, tiers, limit, deadline, &mut cancel).await
    }

    async fn over_fetch(
        &self,
        embedding: &[f32],
        tiers: &[Tier],
        limit: usize,
        deadline: Instant,
        cancel: &mut Option<CancelSignal>,
    ) -> Result<QueryOutcome> {
        let mut factor = self.config.overfetch_factor.max(2);
        let mut outcome = QueryOutcome::new(Strategy::OverFetch { rounds: 0 });

        for round in 1..=self.config.max_overfetch_rounds.max(1) {
            let fetch = limit.saturating_mul(factor);
            let search = self.backend.search(embedding, fetch, None);

            let page = tokio::select! {
                biased;
                _ = wait_cancelled(cancel) => {
                    debug!(round, "Query cancelled during over-fetch");
                    outcome.cancelled = true;
                    break;
                }
                result = timeout_at(deadline, search) => match result {
                    Ok(Ok(page)) => page,
                    Ok(Err(e)) if round == 1 => return Err(e),
                    Ok(Err(e)) => {
                        warn!(round, error = %e, matched = outcome.documents.len(), "Widening search failed; returning partial results");
                        break;
                    }
                    Err(_) => {
                        warn!(round, timeout_ms = self.config.timeout_ms, "Over-fetch timed out; returning partial results");
                        outcome.timed_out = true;
                        break;
                    }
                },
            };

            outcome.strategy = Strategy::OverFetch { rounds: round };
            let full_page = page.len() >= fetch;
            // Each round re-ranks a superset of the previous page
            outcome.documents = retain_tiers(page, tiers, limit);

            if outcome.documents.len() >= limit || !full_page {
                break;
            }
            debug!(round, fetch, matched = outcome.documents.len(), "Short page; widening over-fetch");
            factor = factor.saturating_mul(2);
        }

        info!(
            strategy = "over_fetch",
            results = outcome.documents.len(),
            "Tier-scoped query"
        );
        Ok(outcome)
    }

    async fn unscoped(
        &self,
        embedding: &[f32],
        limit: usize,
        deadline: Instant,
        cancel: &mut Option<CancelSignal>,
    ) -> Result<QueryOutcome> {
        let mut outcome = QueryOutcome::new(Strategy::Unscoped);
        if limit == 0 {
            return Ok(outcome);
        }

        let search = self.backend.search(embedding, limit, None);
        tokio::select! {
            biased;
            _ = wait_cancelled(cancel) => outcome.cancelled = true,
            result = timeout_at(deadline, search) => match result {
                Ok(documents) => outcome.documents = documents?,
                Err(_) => outcome.timed_out = true,
            },
        }
        Ok(outcome)
    }
}

/// Keep documents tagged with one of `tiers`, in order, up to `limit`.
fn retain_tiers(documents: Vec<Document>, tiers: &[Tier], limit: usize) -> Vec<Document> {
    let total = documents.len();
    let kept: Vec<Document> = documents
        .into_iter()
        .filter(|d| d.tier().is_some_and(|t| tiers.contains(&t)))
        .take(limit)
        .collect();
    if kept.len() < total.min(limit) {
        debug!(dropped = total - kept.len(), "Discarded out-of-tier documents");
    }
    kept
}
