use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::extractor::{ExtractionError, FactExtractor};
use super::normalizer::{ContentNormalizer, NormalizeError};
use super::tabular::{TabularError, TabularParser};
use super::validation::{ExtractionResult, RejectionCategory};
use crate::document::{Document, DocumentStatus, DocumentType};
use crate::fact::FactKind;
use crate::storage::{DocumentStore, FactStore, RawContentStore, SearchBatch, SearchIndex};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Storage error: {0}")]
    Storage(#[from] crate::Error),
    #[error("Normalization error: {0}")]
    Normalization(#[from] NormalizeError),
    #[error(transparent)]
    Tabular(#[from] TabularError),
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),
}

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Documents claimed per store round trip
    pub batch_size: usize,
    /// Sleep between polls when nothing is pending, in milliseconds
    pub idle_interval_ms: u64,
    /// Only claim documents from this source
    pub source: Option<String>,
    /// Reclaim documents stuck in `processing` for this long (disabled when unset)
    pub stale_claim_after_seconds: Option<u64>,
    pub search_collection: String,
    /// Texts shorter than this are not indexed
    pub search_min_chars: usize,
    /// Indexed texts are cut to this length
    pub search_max_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            idle_interval_ms: 60_000,
            source: None,
            stale_claim_after_seconds: None,
            search_collection: "documents".to_string(),
            search_min_chars: 50,
            search_max_chars: 8000,
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub const fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    #[must_use]
    pub fn stale_claim_after(&self) -> Option<chrono::Duration> {
        self.stale_claim_after_seconds
            .and_then(|s| i64::try_from(s).ok())
            .map(chrono::Duration::seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Completed with at least one accepted fact
    pub documents_processed: u64,
    pub documents_no_data: u64,
    pub documents_failed: u64,
    pub facts_rejected_citation: u64,
    pub facts_rejected_bounds: u64,
    pub facts_rejected_incomplete: u64,
    pub storage_errors: u64,
    pub waste_events_created: u64,
    pub emission_events_created: u64,
    pub exchange_events_created: u64,
    pub started_at: Option<DateTime<Utc>>,
}

impl PipelineStats {
    #[must_use]
    pub const fn facts_created(&self) -> u64 {
        self.waste_events_created + self.emission_events_created + self.exchange_events_created
    }

    #[must_use]
    pub const fn facts_rejected(&self) -> u64 {
        self.facts_rejected_citation + self.facts_rejected_bounds + self.facts_rejected_incomplete
    }

    fn record_created(&mut self, kind: FactKind) {
        match kind {
            FactKind::WasteEvent => self.waste_events_created += 1,
            FactKind::EmissionEvent => self.emission_events_created += 1,
            FactKind::ExchangeEvent => self.exchange_events_created += 1,
        }
    }

    fn record_rejection(&mut self, category: RejectionCategory) {
        match category {
            RejectionCategory::Citation => self.facts_rejected_citation += 1,
            RejectionCategory::Bounds => self.facts_rejected_bounds += 1,
            RejectionCategory::Incomplete => self.facts_rejected_incomplete += 1,
        }
    }
}

/// Per-document tally of what happened to the extracted candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentReport {
    pub accepted: usize,
    pub persisted: usize,
    pub rejected: usize,
}

/// Lazy cursor over pending documents, claiming one bounded batch at a
/// time.
pub struct PendingStream {
    store: Arc<dyn DocumentStore>,
    source: Option<String>,
    batch_size: usize,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

impl PendingStream {
    pub fn new(store: Arc<dyn DocumentStore>, source: Option<String>, batch_size: usize) -> Self {
        Self {
            store,
            source,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Next claimed document; `None` once the store has nothing pending.
    pub async fn next(&mut self) -> crate::Result<Option<Document>> {
        if self.buffer.is_empty() && !self.exhausted {
            let batch = self
                .store
                .claim_pending(self.source.as_deref(), self.batch_size)
                .await?;
            if batch.is_empty() {
                self.exhausted = true;
            } else {
                debug!(claimed = batch.len(), "claimed batch");
                self.buffer.extend(batch);
            }
        }
        Ok(self.buffer.pop_front())
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Hands claimed documents that were never started back to `pending`.
    pub async fn release_unstarted(&mut self) -> crate::Result<usize> {
        let ids: Vec<Uuid> = self.buffer.drain(..).map(|d| d.id).collect();
        if !ids.is_empty() {
            self.store.release(&ids).await?;
        }
        Ok(ids.len())
    }
}

/// Moves documents from `pending` to a terminal status, one at a time.
pub struct Orchestrator {
    documents: Arc<dyn DocumentStore>,
    facts: Arc<dyn FactStore>,
    raw: Arc<dyn RawContentStore>,
    search: Option<Arc<dyn SearchIndex>>,
    normalizer: ContentNormalizer,
    tabular: TabularParser,
    extractor: FactExtractor,
    config: OrchestratorConfig,
    stats: PipelineStats,
}

impl Orchestrator {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        facts: Arc<dyn FactStore>,
        raw: Arc<dyn RawContentStore>,
    ) -> Self {
        Self {
            documents,
            facts,
            raw,
            search: None,
            normalizer: ContentNormalizer::default(),
            tabular: TabularParser::default(),
            extractor: FactExtractor::default(),
            config: OrchestratorConfig::default(),
            stats: PipelineStats::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_search(mut self, search: Arc<dyn SearchIndex>) -> Self {
        self.search = Some(search);
        self
    }

    #[must_use]
    pub fn with_normalizer(mut self, normalizer: ContentNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    #[must_use]
    pub fn with_tabular(mut self, tabular: TabularParser) -> Self {
        self.tabular = tabular;
        self
    }

    #[must_use]
    pub fn with_extractor(mut self, extractor: FactExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    #[must_use]
    pub fn stream_pending(&self, batch_size: usize) -> PendingStream {
        PendingStream::new(
            Arc::clone(&self.documents),
            self.config.source.clone(),
            batch_size,
        )
    }

    /// Processes one claimed document and records its terminal status.
    /// Never fails: every error ends up on the document.
    pub async fn process_one(&mut self, document: &Document) -> DocumentStatus {
        info!(
            document_id = %document.id,
            document_type = %document.document_type,
            locator = %document.locator,
            "processing document"
        );

        let (status, error_message) = match self.extract_document(document).await {
            Ok(report) if report.accepted > 0 => {
                self.stats.documents_processed += 1;
                info!(
                    document_id = %document.id,
                    persisted = report.persisted,
                    rejected = report.rejected,
                    "document completed"
                );
                (DocumentStatus::Completed, None)
            }
            Ok(report) => {
                self.stats.documents_no_data += 1;
                info!(document_id = %document.id, rejected = report.rejected, "no facts accepted");
                (DocumentStatus::CompletedNoData, None)
            }
            Err(e) => {
                self.stats.documents_failed += 1;
                warn!(document_id = %document.id, error = %e, "document failed");
                (DocumentStatus::Failed, Some(e.to_string()))
            }
        };

        if let Err(e) = self
            .documents
            .update_status(document.id, status, error_message.as_deref())
            .await
        {
            self.stats.storage_errors += 1;
            error!(document_id = %document.id, error = %e, "failed to record document status");
        }

        status
    }

    /// Claims at most one batch and processes it.
    pub async fn run_batch(&mut self) -> IngestResult<usize> {
        let batch = self
            .documents
            .claim_pending(self.config.source.as_deref(), self.config.batch_size.max(1))
            .await?;
        let count = batch.len();
        for document in batch {
            self.process_one(&document).await;
        }
        Ok(count)
    }

    /// Processes pending documents until none are left or `cancel` fires.
    /// Claimed documents not yet started are released on cancellation; the
    /// one in flight is finished first.
    pub async fn drain(&mut self, cancel: &CancellationToken) -> IngestResult<usize> {
        let mut stream = self.stream_pending(self.config.batch_size);
        let mut processed = 0;

        loop {
            if cancel.is_cancelled() {
                let released = stream.release_unstarted().await?;
                if released > 0 {
                    info!(released, "released unstarted documents");
                }
                break;
            }
            let Some(document) = stream.next().await? else {
                break;
            };
            self.process_one(&document).await;
            processed += 1;
        }

        Ok(processed)
    }

    /// Polls for work until `cancel` fires, sleeping when idle.
    pub async fn run_continuous(&mut self, cancel: CancellationToken) -> PipelineStats {
        self.stats.started_at = Some(Utc::now());
        info!(
            batch_size = self.config.batch_size,
            source = ?self.config.source,
            "orchestrator starting"
        );

        while !cancel.is_cancelled() {
            let processed = match self.drain(&cancel).await {
                Ok(processed) => processed,
                Err(e) => {
                    error!(error = %e, "failed to claim documents");
                    0
                }
            };

            if processed == 0 {
                debug!(idle = ?self.config.idle_interval(), "no pending documents, sleeping");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.idle_interval()) => {}
                }
            }
        }

        info!(
            processed = self.stats.documents_processed,
            no_data = self.stats.documents_no_data,
            failed = self.stats.documents_failed,
            facts = self.stats.facts_created(),
            rejected = self.stats.facts_rejected(),
            "orchestrator stopped"
        );
        self.stats.clone()
    }

    async fn extract_document(&mut self, document: &Document) -> IngestResult<DocumentReport> {
        let raw = self.raw.get(&document.raw_ref).await?;

        let results = if document.document_type == DocumentType::Tabular {
            let outcome = self.tabular.parse(&raw)?;
            drop(raw);
            info!(
                document_id = %document.id,
                profile = %outcome.profile,
                rows = outcome.rows_read,
                candidates = outcome.candidates.len(),
                skipped = outcome.values_skipped,
                truncated = outcome.truncated,
                "parsed tabular export"
            );
            if outcome.truncated {
                self.record_truncation(document, outcome.rows_read).await;
            }
            self.extractor.validator().validate_all(outcome.candidates, "")
        } else {
            let text = self.normalizer.clean(&raw, document.document_type)?;
            drop(raw);
            let results = self.extractor.extract_all(&text).await?;
            self.index_text(document, &text).await;
            results
        };

        Ok(self.persist(document, results).await)
    }

    /// Marks a tabular document whose rows past the configured cap were
    /// never read.
    async fn record_truncation(&mut self, document: &Document, rows_read: usize) {
        warn!(
            document_id = %document.id,
            rows_read,
            "row cap reached, remaining rows skipped"
        );
        let mut entries = serde_json::Map::new();
        entries.insert("truncated".to_string(), serde_json::Value::Bool(true));
        entries.insert("rows_read".to_string(), serde_json::Value::from(rows_read));
        if let Err(e) = self.documents.merge_metadata(document.id, entries).await {
            self.stats.storage_errors += 1;
            error!(document_id = %document.id, error = %e, "failed to record truncation");
        }
    }

    async fn persist(&mut self, document: &Document, results: Vec<ExtractionResult>) -> DocumentReport {
        let mut report = DocumentReport::default();

        for result in results {
            match result {
                ExtractionResult::Accepted(fact) => {
                    report.accepted += 1;
                    let fact = fact.with_document(document.id);
                    match self.facts.insert_fact(&fact).await {
                        Ok(_) => {
                            report.persisted += 1;
                            self.stats.record_created(fact.kind());
                        }
                        Err(e) => {
                            self.stats.storage_errors += 1;
                            warn!(
                                document_id = %document.id,
                                kind = %fact.kind(),
                                error = %e,
                                "failed to store fact"
                            );
                        }
                    }
                }
                ExtractionResult::Rejected { kind, reason, .. } => {
                    report.rejected += 1;
                    self.stats.record_rejection(reason.category());
                    debug!(document_id = %document.id, %kind, reason = %reason, "fact rejected");
                }
            }
        }

        report
    }

    async fn index_text(&self, document: &Document, text: &str) {
        let Some(search) = &self.search else {
            return;
        };
        if text.chars().count() < self.config.search_min_chars {
            return;
        }

        let chunk: String = text.chars().take(self.config.search_max_chars).collect();
        let mut metadata = serde_json::Map::new();
        metadata.insert("source".to_string(), document.source.clone().into());
        metadata.insert("type".to_string(), document.document_type.as_str().into());
        if let Some(year) = document.metadata.get("year") {
            metadata.insert("year".to_string(), year.clone());
        }

        let batch = SearchBatch {
            collection: self.config.search_collection.clone(),
            texts: vec![chunk],
            metadata: vec![metadata],
            ids: vec![document.id.to_string()],
        };

        if let Err(e) = search.add(batch).await {
            warn!(document_id = %document.id, error = %e, "failed to index document text");
        }
    }
}
