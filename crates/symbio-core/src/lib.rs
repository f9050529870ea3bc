pub mod config;
pub mod document;
pub mod error;
pub mod fact;
pub mod fetch;
pub mod ingest;
pub mod storage;

pub use config::{ConfigError, EngineConfig, ModelConfig, StorageConfig};
pub use document::{Document, DocumentStatus, DocumentType, NewDocument};
pub use error::{Error, Result};
pub use fact::{
    Citation, CitationKind, EmissionEvent, ExchangeEvent, Fact, FactData, FactKind, Measurement,
    WasteEvent,
};
pub use fetch::{FetchConfig, FetchPool, Fetcher, HttpTransport};
pub use ingest::{Orchestrator, OrchestratorConfig, PipelineStats};
pub use storage::{
    DocumentStore, FactStore, FsRawStore, RawContentStore, SearchBatch, SearchIndex, Storage,
};
