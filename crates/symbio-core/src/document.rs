use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    WebText,
    Pdf,
    Tabular,
    Raw,
}

impl DocumentType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WebText => "web_text",
            Self::Pdf => "pdf",
            Self::Tabular => "tabular",
            Self::Raw => "raw",
        }
    }

    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "html" | "htm" | "xhtml" => Some(Self::WebText),
            "pdf" => Some(Self::Pdf),
            "csv" | "tsv" => Some(Self::Tabular),
            "txt" | "json" | "xml" => Some(Self::Raw),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or(mime).trim();
        match essence {
            "text/html" | "application/xhtml+xml" => Some(Self::WebText),
            "application/pdf" => Some(Self::Pdf),
            "text/csv" | "application/csv" | "text/tab-separated-values" => Some(Self::Tabular),
            "text/plain" | "application/json" | "application/xml" | "text/xml" => Some(Self::Raw),
            _ => None,
        }
    }

    /// File extension used when the raw bytes are written to disk.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::WebText => "html",
            Self::Pdf => "pdf",
            Self::Tabular => "csv",
            Self::Raw => "bin",
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web_text" => Ok(Self::WebText),
            "pdf" => Ok(Self::Pdf),
            "tabular" => Ok(Self::Tabular),
            "raw" => Ok(Self::Raw),
            _ => Err(crate::Error::InvalidDocumentType(s.to_string())),
        }
    }
}

/// Processing state of a document.
///
/// `Pending -> Processing -> {Completed, CompletedNoData, Failed}`. The
/// transition out of `Pending` is an atomic claim performed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    CompletedNoData,
    Failed,
}

impl DocumentStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::CompletedNoData => "completed_no_data",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedNoData | Self::Failed)
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "completed_no_data" => Ok(Self::CompletedNoData),
            "failed" => Ok(Self::Failed),
            _ => Err(crate::Error::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub source: String,
    pub locator: String,
    pub document_type: DocumentType,
    pub content_hash: String,
    pub raw_ref: String,
    pub status: DocumentStatus,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub ingested_at: DateTime<Utc>,
}

/// A document as handed to the store on first sight of its content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    pub source: String,
    pub locator: String,
    pub document_type: DocumentType,
    pub content_hash: String,
    pub raw_ref: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NewDocument {
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        locator: impl Into<String>,
        document_type: DocumentType,
        content_hash: impl Into<String>,
        raw_ref: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            locator: locator.into(),
            document_type,
            content_hash: content_hash.into(),
            raw_ref: raw_ref.into(),
            metadata: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Materializes the pending document the store will hold.
    #[must_use]
    pub fn into_document(self) -> Document {
        Document {
            id: Uuid::now_v7(),
            source: self.source,
            locator: self.locator,
            document_type: self.document_type,
            content_hash: self.content_hash,
            raw_ref: self.raw_ref,
            status: DocumentStatus::Pending,
            error_message: None,
            metadata: self.metadata,
            ingested_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_type_from_extension() {
        assert_eq!(DocumentType::from_extension("HTML"), Some(DocumentType::WebText));
        assert_eq!(DocumentType::from_extension("pdf"), Some(DocumentType::Pdf));
        assert_eq!(DocumentType::from_extension("csv"), Some(DocumentType::Tabular));
        assert_eq!(DocumentType::from_extension("exe"), None);
    }

    #[test]
    fn test_document_type_from_mime_ignores_parameters() {
        assert_eq!(
            DocumentType::from_mime("text/html; charset=utf-8"),
            Some(DocumentType::WebText)
        );
        assert_eq!(DocumentType::from_mime("text/csv"), Some(DocumentType::Tabular));
        assert_eq!(DocumentType::from_mime("image/png"), None);
    }

    #[test]
    fn test_status_parse() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Completed,
            DocumentStatus::CompletedNoData,
            DocumentStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("done".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!DocumentStatus::Pending.is_terminal());
        assert!(!DocumentStatus::Processing.is_terminal());
        assert!(DocumentStatus::Completed.is_terminal());
        assert!(DocumentStatus::CompletedNoData.is_terminal());
        assert!(DocumentStatus::Failed.is_terminal());
    }

    #[test]
    fn test_new_document_starts_pending() {
        let doc = NewDocument::new("epa", "https://example.com/a.csv", DocumentType::Tabular, "abc", "epa/abc.csv")
            .into_document();

        assert_eq!(doc.status, DocumentStatus::Pending);
        assert!(doc.error_message.is_none());
        assert_eq!(doc.source, "epa");
    }
}
