use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Document not found: {0}")]
    DocumentNotFound(uuid::Uuid),

    #[error("Invalid document type: {0}")]
    InvalidDocumentType(String),

    #[error("Invalid document status: {0}")]
    InvalidStatus(String),

    #[error("Invalid fact: {0}")]
    InvalidFact(String),

    #[error("Raw content not found: {0}")]
    RawContentNotFound(String),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
