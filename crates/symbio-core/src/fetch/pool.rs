use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client::Transport;
use super::config::FetchConfig;
use super::fetcher::{FetchCounters, FetchJob, FetchStats, Fetcher};
use crate::storage::{DocumentStore, RawContentStore};

/// Fixed-size set of fetch workers fed through a bounded queue.
///
/// Each worker owns a [`Fetcher`] and therefore its own delay clock and
/// user agent; counters are shared.
pub struct FetchPool {
    source: String,
    transport: Arc<dyn Transport>,
    documents: Arc<dyn DocumentStore>,
    raw: Arc<dyn RawContentStore>,
    config: FetchConfig,
    limit: Option<u64>,
}

impl FetchPool {
    pub fn new(
        source: impl Into<String>,
        transport: Arc<dyn Transport>,
        documents: Arc<dyn DocumentStore>,
        raw: Arc<dyn RawContentStore>,
        config: FetchConfig,
    ) -> Self {
        Self {
            source: source.into(),
            transport,
            documents,
            raw,
            config,
            limit: None,
        }
    }

    /// Stop once this many new documents were saved.
    #[must_use]
    pub const fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    /// Runs every job until the queue drains, the limit is reached or
    /// `cancel` fires.
    pub async fn run<I>(&self, jobs: I, cancel: CancellationToken) -> FetchStats
    where
        I: IntoIterator<Item = FetchJob>,
    {
        let counters = Arc::new(FetchCounters::default());
        let stop = cancel.child_token();
        let (tx, rx) = mpsc::channel::<FetchJob>(self.config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        info!(source = %self.source, workers = self.config.workers, "starting fetch run");

        let mut handles = Vec::with_capacity(self.config.workers);
        for worker in 0..self.config.workers.max(1) {
            let mut fetcher = Fetcher::new(
                self.source.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&self.documents),
                Arc::clone(&self.raw),
                self.config.clone(),
            )
            .with_counters(Arc::clone(&counters));
            let rx = Arc::clone(&rx);
            let stop = stop.clone();
            let limit = self.limit;

            handles.push(tokio::spawn(async move {
                loop {
                    if stop.is_cancelled() {
                        break;
                    }
                    let job = tokio::select! {
                        () = stop.cancelled() => break,
                        job = async { rx.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else { break };

                    fetcher.run_job(job).await;

                    if limit.is_some_and(|limit| fetcher.counters().saved() >= limit) {
                        info!(worker, "document limit reached");
                        stop.cancel();
                    }
                }
            }));
        }

        for job in jobs {
            tokio::select! {
                () = stop.cancelled() => break,
                sent = tx.send(job) => if sent.is_err() { break },
            }
        }
        drop(tx);

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "fetch worker panicked");
            }
        }

        let stats = counters.snapshot();
        info!(
            source = %self.source,
            saved = stats.saved,
            duplicates = stats.duplicates,
            not_found = stats.not_found,
            errors = stats.errors,
            "fetch run finished"
        );
        stats
    }
}
