use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use governor::{Quota, RateLimiter};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::client::{Transport, TransportError, UserAgentPool};
use super::config::FetchConfig;
use crate::document::{DocumentType, NewDocument};
use crate::storage::{DocumentStore, RawContentStore};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Gave up on {locator} after {attempts} attempts: {last}")]
    GaveUp {
        locator: String,
        attempts: u32,
        last: String,
    },
    #[error("Refused to fetch {locator}: {source}")]
    Rejected {
        locator: String,
        #[source]
        source: TransportError,
    },
}

/// Counters shared by every worker of a fetch run.
#[derive(Debug, Default)]
pub struct FetchCounters {
    attempts: AtomicU64,
    fetched: AtomicU64,
    not_found: AtomicU64,
    rate_limited: AtomicU64,
    saved: AtomicU64,
    duplicates: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    pub attempts: u64,
    pub fetched: u64,
    pub not_found: u64,
    pub rate_limited: u64,
    pub saved: u64,
    pub duplicates: u64,
    pub errors: u64,
}

impl FetchCounters {
    #[must_use]
    pub fn snapshot(&self) -> FetchStats {
        FetchStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn saved(&self) -> u64 {
        self.saved.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bytes of one successful retrieval.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub locator: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResource {
    /// Document type from the `Content-Type` header, else the locator's
    /// file extension.
    #[must_use]
    pub fn inferred_type(&self) -> Option<DocumentType> {
        self.content_type
            .as_deref()
            .and_then(DocumentType::from_mime)
            .or_else(|| extension_type(&self.locator))
    }
}

fn extension_type(locator: &str) -> Option<DocumentType> {
    let path = Url::parse(locator)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| locator.to_string());
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    DocumentType::from_extension(ext)
}

/// SHA-256 of raw bytes, lowercase hex.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A locator queued for retrieval.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub locator: String,
    pub document_type: Option<DocumentType>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl FetchJob {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            document_type: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub const fn with_type(mut self, document_type: DocumentType) -> Self {
        self.document_type = Some(document_type);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

type RequestLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Polite, retrying retriever owned by a single worker.
pub struct Fetcher {
    source: String,
    transport: Arc<dyn Transport>,
    documents: Arc<dyn DocumentStore>,
    raw: Arc<dyn RawContentStore>,
    config: FetchConfig,
    agents: UserAgentPool,
    user_agent: String,
    consecutive_failures: u32,
    limiter: Option<RequestLimiter>,
    counters: Arc<FetchCounters>,
}

impl Fetcher {
    pub fn new(
        source: impl Into<String>,
        transport: Arc<dyn Transport>,
        documents: Arc<dyn DocumentStore>,
        raw: Arc<dyn RawContentStore>,
        config: FetchConfig,
    ) -> Self {
        let agents = UserAgentPool::new(&config.user_agents);
        let user_agent = agents.random_user_agent();
        // One request per `min_delay`, no bursting. A zero delay disables pacing.
        let limiter = Quota::with_period(config.min_delay())
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));
        Self {
            source: source.into(),
            transport,
            documents,
            raw,
            config,
            agents,
            user_agent,
            consecutive_failures: 0,
            limiter,
            counters: Arc::new(FetchCounters::default()),
        }
    }

    #[must_use]
    pub fn with_counters(mut self, counters: Arc<FetchCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn counters(&self) -> &Arc<FetchCounters> {
        &self.counters
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    async fn wait_turn(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    fn rotate_user_agent(&mut self) {
        self.user_agent = self.agents.rotate(&self.user_agent);
        self.consecutive_failures = 0;
        debug!(user_agent = %self.user_agent, "rotated user agent");
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.config.rotate_after_failures > 0
            && self.consecutive_failures >= self.config.rotate_after_failures
        {
            self.rotate_user_agent();
        }
    }

    /// Retrieves `locator`, retrying rate limits and transient failures
    /// with strictly increasing waits.
    ///
    /// `Ok(None)` means the resource does not exist (404). `Err` means the
    /// fetcher gave up; the error counter has already been incremented.
    pub async fn fetch(&mut self, locator: &str) -> Result<Option<FetchedResource>, FetchError> {
        self.wait_turn().await;

        let attempts = self.config.max_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let wait = self.config.backoff_delay(attempt - 1);
                debug!(locator, attempt, wait = ?wait, "backing off");
                tokio::time::sleep(wait).await;
            }

            FetchCounters::bump(&self.counters.attempts);

            match self.transport.get(locator, &self.user_agent).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    self.consecutive_failures = 0;
                    FetchCounters::bump(&self.counters.fetched);
                    return Ok(Some(FetchedResource {
                        locator: locator.to_string(),
                        status: response.status,
                        content_type: response.content_type,
                        body: response.body,
                    }));
                }
                Ok(response) if response.status == 404 => {
                    FetchCounters::bump(&self.counters.not_found);
                    debug!(locator, "not found");
                    return Ok(None);
                }
                Ok(response) if response.status == 429 => {
                    FetchCounters::bump(&self.counters.rate_limited);
                    warn!(locator, attempt = attempt + 1, "rate limited");
                    last_error = "HTTP 429".to_string();
                    self.rotate_user_agent();
                }
                Ok(response) => {
                    warn!(locator, status = response.status, attempt = attempt + 1, "unexpected status");
                    last_error = format!("HTTP {}", response.status);
                    self.record_failure();
                }
                Err(e) if !e.is_retryable() => {
                    FetchCounters::bump(&self.counters.errors);
                    warn!(locator, error = %e, "locator refused");
                    return Err(FetchError::Rejected {
                        locator: locator.to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(locator, error = %e, attempt = attempt + 1, "request failed");
                    last_error = e.to_string();
                    self.record_failure();
                }
            }
        }

        FetchCounters::bump(&self.counters.errors);
        warn!(locator, attempts, error = %last_error, "giving up");
        Err(FetchError::GaveUp {
            locator: locator.to_string(),
            attempts,
            last: last_error,
        })
    }

    /// Stores raw bytes and registers a pending document, unless the same
    /// content was seen before.
    pub async fn save(
        &self,
        bytes: &[u8],
        locator: &str,
        document_type: DocumentType,
        mut metadata: serde_json::Map<String, serde_json::Value>,
    ) -> crate::Result<Option<Uuid>> {
        let hash = content_hash(bytes);

        if self.documents.contains_hash(&hash).await? {
            FetchCounters::bump(&self.counters.duplicates);
            debug!(locator, hash = %&hash[..16], "duplicate content");
            return Ok(None);
        }

        let raw_ref = self
            .raw
            .put(&self.source, &hash, document_type.extension(), bytes)
            .await?;

        metadata.insert("size_bytes".to_string(), bytes.len().into());
        metadata.insert("fetched_at".to_string(), Utc::now().to_rfc3339().into());
        metadata.insert("raw_ref".to_string(), raw_ref.clone().into());

        let document = NewDocument::new(&self.source, locator, document_type, &hash, raw_ref)
            .with_metadata(metadata);

        match self.documents.insert(document).await? {
            Some(id) => {
                FetchCounters::bump(&self.counters.saved);
                info!(document_id = %id, locator, size = bytes.len(), "saved document");
                Ok(Some(id))
            }
            None => {
                FetchCounters::bump(&self.counters.duplicates);
                debug!(locator, "duplicate content");
                Ok(None)
            }
        }
    }

    /// Fetches and saves one job. Failures are logged and counted, never
    /// propagated.
    pub async fn run_job(&mut self, job: FetchJob) -> Option<Uuid> {
        let resource = match self.fetch(&job.locator).await {
            Ok(Some(resource)) => resource,
            Ok(None) | Err(_) => return None,
        };

        let document_type = job
            .document_type
            .or_else(|| resource.inferred_type())
            .unwrap_or(DocumentType::Raw);

        match self
            .save(&resource.body, &job.locator, document_type, job.metadata)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                FetchCounters::bump(&self.counters.errors);
                warn!(locator = %job.locator, error = %e, "failed to save document");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(locator: &str, content_type: Option<&str>) -> FetchedResource {
        FetchedResource {
            locator: locator.to_string(),
            status: 200,
            content_type: content_type.map(String::from),
            body: vec![],
        }
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_inferred_type_prefers_content_type() {
        let r = resource("https://example.gov/report.csv", Some("application/pdf"));

        assert_eq!(r.inferred_type(), Some(DocumentType::Pdf));
    }

    #[test]
    fn test_inferred_type_from_extension() {
        let r = resource("https://example.gov/files/tri_2022.CSV?download=1", None);

        assert_eq!(r.inferred_type(), Some(DocumentType::Tabular));
        assert_eq!(resource("https://example.gov/about", None).inferred_type(), None);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = FetchCounters::default();
        FetchCounters::bump(&counters.saved);
        FetchCounters::bump(&counters.saved);

        let stats = counters.snapshot();

        assert_eq!(stats.saved, 2);
        assert_eq!(counters.saved(), 2);
        assert_eq!(stats.errors, 0);
    }
}
