use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::debug;
use uuid::Uuid;

use crate::{
    document::{Document, DocumentStatus, NewDocument},
    fact::{Fact, FactData, FactKind, Measurement},
    Error, Result,
};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    locator TEXT NOT NULL,
    document_type TEXT NOT NULL,
    content_hash TEXT NOT NULL UNIQUE,
    raw_ref TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    ingested_at TEXT NOT NULL,
    claimed_at TEXT,
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status, ingested_at);
CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source);

CREATE TABLE IF NOT EXISTS waste_events (
    id TEXT PRIMARY KEY,
    document_id TEXT REFERENCES documents(id),
    material TEXT NOT NULL,
    category TEXT,
    quantity_tons REAL,
    original_value REAL,
    original_unit TEXT,
    company TEXT,
    location TEXT,
    year INTEGER,
    treatment TEXT,
    citation TEXT NOT NULL,
    citation_kind TEXT NOT NULL,
    confidence REAL NOT NULL,
    requires_review INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_waste_document ON waste_events(document_id);
CREATE INDEX IF NOT EXISTS idx_waste_material ON waste_events(material);

CREATE TABLE IF NOT EXISTS emission_events (
    id TEXT PRIMARY KEY,
    document_id TEXT REFERENCES documents(id),
    substance TEXT NOT NULL,
    quantity_tons REAL,
    original_value REAL,
    original_unit TEXT,
    company TEXT,
    location TEXT,
    year INTEGER NOT NULL,
    scope TEXT,
    citation TEXT NOT NULL,
    citation_kind TEXT NOT NULL,
    confidence REAL NOT NULL,
    requires_review INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_emission_document ON emission_events(document_id);

CREATE TABLE IF NOT EXISTS exchange_events (
    id TEXT PRIMARY KEY,
    document_id TEXT REFERENCES documents(id),
    material TEXT NOT NULL,
    source_company TEXT NOT NULL,
    target_company TEXT NOT NULL,
    volume_tons REAL,
    original_value REAL,
    original_unit TEXT,
    eco_park TEXT,
    year INTEGER,
    citation TEXT NOT NULL,
    citation_kind TEXT NOT NULL,
    confidence REAL NOT NULL,
    requires_review INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_exchange_document ON exchange_events(document_id);
"#;

const DOCUMENT_COLUMNS: &str =
    "id, source, locator, document_type, content_hash, raw_ref, status, error_message, metadata, ingested_at";

/// Eligibility of a row for claiming. The two binds are the stale cutoff,
/// which disables reclaiming when NULL.
const CLAIMABLE: &str =
    "(status = 'pending' OR (status = 'processing' AND ? IS NOT NULL AND claimed_at < ?))";

type DocumentRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
);

/// Persistent record of retrieved documents and their processing state.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts a pending document; `None` when the content hash is known.
    async fn insert(&self, document: NewDocument) -> Result<Option<Uuid>>;

    async fn contains_hash(&self, content_hash: &str) -> Result<bool>;

    /// Atomically moves up to `limit` pending documents to `processing`
    /// and returns them. Concurrent callers never receive the same row.
    async fn claim_pending(&self, source: Option<&str>, limit: usize) -> Result<Vec<Document>>;

    async fn update_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Merges `entries` into the document's metadata, replacing keys that
    /// already exist.
    async fn merge_metadata(
        &self,
        id: Uuid,
        entries: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;

    /// Returns claimed but unprocessed documents to `pending`.
    async fn release(&self, ids: &[Uuid]) -> Result<()>;

    async fn get_document(&self, id: Uuid) -> Result<Document>;
}

/// Sink for validated facts, one table per record kind.
#[async_trait]
pub trait FactStore: Send + Sync {
    async fn insert_fact(&self, fact: &Fact) -> Result<Uuid>;
}

/// Holds raw bytes outside the document table.
#[async_trait]
pub trait RawContentStore: Send + Sync {
    /// Stores bytes and returns the reference kept on the document.
    async fn put(&self, source: &str, content_hash: &str, extension: &str, bytes: &[u8]) -> Result<String>;

    async fn get(&self, raw_ref: &str) -> Result<Vec<u8>>;
}

/// Texts handed to a vector/keyword index after extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchBatch {
    pub collection: String,
    pub texts: Vec<String>,
    pub metadata: Vec<serde_json::Map<String, serde_json::Value>>,
    pub ids: Vec<String>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn add(&self, batch: SearchBatch) -> Result<()>;
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct Storage {
    pool: Pool<Sqlite>,
    stale_claim_after: Option<chrono::Duration>,
}

impl Storage {
    pub async fn open(path: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{path}?mode=rwc"))
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self {
            pool,
            stale_claim_after: None,
        })
    }

    pub async fn open_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self {
            pool,
            stale_claim_after: None,
        })
    }

    /// Lets `claim_pending` take over documents left in `processing` for
    /// longer than `window`, e.g. after a crashed worker.
    #[must_use]
    pub const fn with_stale_claim_after(mut self, window: Option<chrono::Duration>) -> Self {
        self.stale_claim_after = window;
        self
    }

    pub async fn count_by_status(&self) -> Result<Vec<(DocumentStatus, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM documents GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(status, count)| Ok((status.parse()?, count)))
            .collect()
    }

    pub async fn count_facts(&self, kind: FactKind) -> Result<i64> {
        let table = fact_table(kind);
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Citations of every fact extracted from one document, all kinds.
    pub async fn citations_for_document(&self, document_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT citation FROM waste_events WHERE document_id = ?
            UNION ALL SELECT citation FROM emission_events WHERE document_id = ?
            UNION ALL SELECT citation FROM exchange_events WHERE document_id = ?
            "#,
        )
        .bind(document_id.to_string())
        .bind(document_id.to_string())
        .bind(document_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(c,)| c).collect())
    }
}

#[async_trait]
impl DocumentStore for Storage {
    async fn insert(&self, document: NewDocument) -> Result<Option<Uuid>> {
        let document = document.into_document();
        let metadata = serde_json::to_string(&document.metadata)?;

        let result = sqlx::query(
            r#"
            INSERT INTO documents (id, source, locator, document_type, content_hash, raw_ref, status, metadata, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO NOTHING
            "#,
        )
        .bind(document.id.to_string())
        .bind(&document.source)
        .bind(&document.locator)
        .bind(document.document_type.as_str())
        .bind(&document.content_hash)
        .bind(&document.raw_ref)
        .bind(document.status.as_str())
        .bind(metadata)
        .bind(timestamp(document.ingested_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(hash = %document.content_hash, "duplicate content hash, not inserted");
            return Ok(None);
        }

        Ok(Some(document.id))
    }

    async fn contains_hash(&self, content_hash: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM documents WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn claim_pending(&self, source: Option<&str>, limit: usize) -> Result<Vec<Document>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let stale_cutoff = self.stale_claim_after.map(|window| timestamp(now - window));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let sql = format!(
            r#"
            UPDATE documents SET status = 'processing', claimed_at = ?
            WHERE id IN (
                SELECT id FROM documents
                WHERE {CLAIMABLE} AND (? IS NULL OR source = ?)
                ORDER BY ingested_at, id
                LIMIT ?
            )
            AND {CLAIMABLE}
            RETURNING {DOCUMENT_COLUMNS}
            "#
        );

        let mut rows: Vec<DocumentRow> = sqlx::query_as(&sql)
            .bind(timestamp(now))
            .bind(stale_cutoff.as_deref())
            .bind(stale_cutoff.as_deref())
            .bind(source)
            .bind(source)
            .bind(limit)
            .bind(stale_cutoff.as_deref())
            .bind(stale_cutoff.as_deref())
            .fetch_all(&self.pool)
            .await?;

        rows.sort_by(|a, b| (&a.9, &a.0).cmp(&(&b.9, &b.0)));
        rows.into_iter().map(parse_document_row).collect()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let processed_at = status.is_terminal().then(|| timestamp(Utc::now()));

        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?, error_message = ?, processed_at = COALESCE(?, processed_at)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(processed_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id));
        }

        Ok(())
    }

    async fn merge_metadata(
        &self,
        id: Uuid,
        entries: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let patch = serde_json::to_string(&entries)?;

        let result = sqlx::query("UPDATE documents SET metadata = json_patch(metadata, ?) WHERE id = ?")
            .bind(patch)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id));
        }

        Ok(())
    }

    async fn release(&self, ids: &[Uuid]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE documents SET status = 'pending', claimed_at = NULL WHERE id = ? AND status = 'processing'",
            )
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Document> {
        let row: DocumentRow =
            sqlx::query_as(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?
                .ok_or(Error::DocumentNotFound(id))?;

        parse_document_row(row)
    }
}

#[async_trait]
impl FactStore for Storage {
    async fn insert_fact(&self, fact: &Fact) -> Result<Uuid> {
        if fact.data().subject().trim().is_empty() {
            return Err(Error::InvalidFact(format!(
                "{} without material or substance",
                fact.kind()
            )));
        }

        let id = fact.id().to_string();
        let document_id = fact.document_id().map(|d| d.to_string());
        let citation = fact.citation();
        let (tons, original_value, original_unit) = measurement_columns(fact.data().quantity());
        let created_at = timestamp(fact.created_at());

        let query = match fact.data() {
            FactData::WasteEvent(event) => sqlx::query(
                r#"
                INSERT INTO waste_events (id, document_id, material, category, quantity_tons, original_value, original_unit,
                    company, location, year, treatment, citation, citation_kind, confidence, requires_review, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(document_id)
            .bind(&event.material)
            .bind(&event.category)
            .bind(tons)
            .bind(original_value)
            .bind(original_unit)
            .bind(&event.company)
            .bind(&event.location)
            .bind(event.year)
            .bind(&event.treatment),
            FactData::EmissionEvent(event) => {
                let year = event.year.ok_or_else(|| {
                    Error::InvalidFact(format!("emission of {} without a year", event.substance))
                })?;
                sqlx::query(
                    r#"
                    INSERT INTO emission_events (id, document_id, substance, quantity_tons, original_value, original_unit,
                        company, location, year, scope, citation, citation_kind, confidence, requires_review, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id)
                .bind(document_id)
                .bind(&event.substance)
                .bind(tons)
                .bind(original_value)
                .bind(original_unit)
                .bind(&event.company)
                .bind(&event.location)
                .bind(year)
                .bind(&event.scope)
            }
            FactData::ExchangeEvent(event) => {
                let (Some(source), Some(target)) = (&event.source_company, &event.target_company) else {
                    return Err(Error::InvalidFact(format!(
                        "exchange of {} without both companies",
                        event.material
                    )));
                };
                sqlx::query(
                    r#"
                    INSERT INTO exchange_events (id, document_id, material, source_company, target_company, volume_tons,
                        original_value, original_unit, eco_park, year, citation, citation_kind, confidence, requires_review, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(id)
                .bind(document_id)
                .bind(&event.material)
                .bind(source)
                .bind(target)
                .bind(tons)
                .bind(original_value)
                .bind(original_unit)
                .bind(&event.eco_park)
                .bind(event.year)
            }
        };

        query
            .bind(&citation.text)
            .bind(citation.kind.as_str())
            .bind(fact.confidence())
            .bind(fact.requires_review())
            .bind(created_at)
            .execute(&self.pool)
            .await?;

        Ok(fact.id())
    }
}

const fn fact_table(kind: FactKind) -> &'static str {
    match kind {
        FactKind::WasteEvent => "waste_events",
        FactKind::EmissionEvent => "emission_events",
        FactKind::ExchangeEvent => "exchange_events",
    }
}

fn measurement_columns(m: Option<&Measurement>) -> (Option<f64>, Option<f64>, Option<String>) {
    m.map_or((None, None, None), |m| {
        (Some(m.tons), Some(m.original_value), Some(m.original_unit.clone()))
    })
}

fn corrupt(reason: impl std::fmt::Display) -> Error {
    Error::CorruptRow {
        table: "documents",
        reason: reason.to_string(),
    }
}

fn parse_document_row(row: DocumentRow) -> Result<Document> {
    let (
        id,
        source,
        locator,
        document_type,
        content_hash,
        raw_ref,
        status,
        error_message,
        metadata,
        ingested_at,
    ) = row;

    Ok(Document {
        id: id.parse().map_err(corrupt)?,
        source,
        locator,
        document_type: document_type.parse()?,
        content_hash,
        raw_ref,
        status: status.parse()?,
        error_message,
        metadata: serde_json::from_str(&metadata)?,
        ingested_at: DateTime::parse_from_rfc3339(&ingested_at)
            .map_err(corrupt)?
            .with_timezone(&Utc),
    })
}

/// Content-addressed raw bytes on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsRawStore {
    root: PathBuf,
}

impl FsRawStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn path_segment(source: &str) -> String {
    let segment: String = source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if segment.is_empty() {
        "unknown".to_string()
    } else {
        segment
    }
}

#[async_trait]
impl RawContentStore for FsRawStore {
    async fn put(&self, source: &str, content_hash: &str, extension: &str, bytes: &[u8]) -> Result<String> {
        let dir = path_segment(source);
        let stem = content_hash.get(..16).unwrap_or(content_hash);
        let raw_ref = format!("{dir}/{stem}.{extension}");
        let path = self.root.join(&raw_ref);

        if !tokio::fs::try_exists(&path).await? {
            tokio::fs::create_dir_all(self.root.join(&dir)).await?;
            tokio::fs::write(&path, bytes).await?;
        }

        Ok(raw_ref)
    }

    async fn get(&self, raw_ref: &str) -> Result<Vec<u8>> {
        if raw_ref.split('/').any(|part| part == "..") {
            return Err(Error::RawContentNotFound(raw_ref.to_string()));
        }

        match tokio::fs::read(self.root.join(raw_ref)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::RawContentNotFound(raw_ref.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
