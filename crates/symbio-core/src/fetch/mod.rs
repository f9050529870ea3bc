mod client;
mod config;
mod fetcher;
mod pool;

pub use client::{HttpTransport, Transport, TransportError, TransportResponse, UserAgentPool};
pub use config::{FetchConfig, FetchConfigError};
pub use fetcher::{
    content_hash, FetchCounters, FetchError, FetchJob, FetchStats, FetchedResource, Fetcher,
};
pub use pool::FetchPool;
