use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use symbio_core::fetch::content_hash;
use symbio_core::ingest::{
    ExtractionError, ExtractionStrategy, Extractor, FactCandidate, FactExtractor, TabularParser,
    Validator,
};
use symbio_core::{
    DocumentStatus, DocumentStore, DocumentType, Error, Fact, FactData, FactKind, FactStore,
    FsRawStore, Measurement, NewDocument, Orchestrator, RawContentStore, Result, Storage,
    WasteEvent,
};
use uuid::Uuid;

const REPORT: &str = "Annual recovery summary. In 2021, Acme Corp recycled 40 tonnes of slag. \
    Globex shipped 12 tonnes of glass cullet to a local plant. Initech composted 300 tonnes of \
    food waste. Hooli reused 8 tonnes of pallets on site.";

fn waste(company: &str, material: &str, tons: f64, citation: &str) -> FactCandidate {
    FactCandidate::quoted(
        FactData::WasteEvent(WasteEvent {
            material: material.to_string(),
            company: Some(company.to_string()),
            quantity: Some(Measurement::new(tons, tons, "tonnes")),
            ..WasteEvent::default()
        }),
        Some(citation.to_string()),
        0.9,
    )
}

/// Returns a fixed candidate list regardless of the text.
struct FixedExtractor(Vec<FactCandidate>);

#[async_trait]
impl Extractor for FixedExtractor {
    fn strategy(&self) -> ExtractionStrategy {
        ExtractionStrategy::RuleBased
    }

    async fn candidates(&self, _text: &str) -> std::result::Result<Vec<FactCandidate>, ExtractionError> {
        Ok(self.0.clone())
    }
}

fn five_candidates() -> Vec<FactCandidate> {
    vec![
        waste("Acme Corp", "slag", 40.0, "Acme Corp recycled 40 tonnes of slag"),
        waste("Globex", "glass cullet", 12.0, "Globex shipped 12 tonnes of glass cullet"),
        waste("Initech", "food waste", 300.0, "Initech composted 300 tonnes of food waste"),
        waste("Hooli", "pallets", 8.0, "Hooli reused 8 tonnes of pallets"),
        waste("Umbrella", "tyres", 900.0, "Umbrella burned 900 tonnes of tyres"),
    ]
}

/// Fact store that fails every second insert and delegates the rest.
struct FlakyFacts {
    inner: Arc<Storage>,
    calls: AtomicUsize,
}

#[async_trait]
impl FactStore for FlakyFacts {
    async fn insert_fact(&self, fact: &Fact) -> Result<Uuid> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
            return Err(Error::InvalidFact("simulated write failure".to_string()));
        }
        self.inner.insert_fact(fact).await
    }
}

struct Harness {
    storage: Arc<Storage>,
    raw: Arc<FsRawStore>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            storage: Arc::new(Storage::open_memory().await.unwrap()),
            raw: Arc::new(FsRawStore::open(dir.path()).await.unwrap()),
            _dir: dir,
        }
    }

    async fn add(&self, body: &[u8], document_type: DocumentType) -> Uuid {
        let hash = content_hash(body);
        let raw_ref = self
            .raw
            .put("reports", &hash, document_type.extension(), body)
            .await
            .unwrap();
        self.storage
            .insert(NewDocument::new("reports", "https://example.org/r", document_type, hash, raw_ref))
            .await
            .unwrap()
            .unwrap()
    }

    fn extractor() -> FactExtractor {
        FactExtractor::new(Validator::default()).with_rules(Box::new(FixedExtractor(five_candidates())))
    }
}

#[tokio::test]
async fn test_one_bad_candidate_does_not_sink_the_document() {
    let harness = Harness::new().await;
    let id = harness.add(REPORT.as_bytes(), DocumentType::Raw).await;
    let mut orchestrator =
        Orchestrator::new(harness.storage.clone(), harness.storage.clone(), harness.raw.clone())
            .with_extractor(Harness::extractor());

    orchestrator.run_batch().await.unwrap();

    let doc = harness.storage.get_document(id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(harness.storage.count_facts(FactKind::WasteEvent).await.unwrap(), 4);
    let stats = orchestrator.stats();
    assert_eq!(stats.waste_events_created, 4);
    assert_eq!(stats.facts_rejected_citation, 1);
    assert_eq!(stats.documents_processed, 1);

    let citations = harness.storage.citations_for_document(id).await.unwrap();
    assert!(citations.iter().all(|c| REPORT.contains(c.as_str())));
}

#[tokio::test]
async fn test_fact_write_failures_are_isolated() {
    let harness = Harness::new().await;
    let id = harness.add(REPORT.as_bytes(), DocumentType::Raw).await;
    let facts = Arc::new(FlakyFacts {
        inner: harness.storage.clone(),
        calls: AtomicUsize::new(0),
    });
    let mut orchestrator = Orchestrator::new(harness.storage.clone(), facts, harness.raw.clone())
        .with_extractor(Harness::extractor());

    orchestrator.run_batch().await.unwrap();

    assert_eq!(harness.storage.count_facts(FactKind::WasteEvent).await.unwrap(), 2);
    assert_eq!(orchestrator.stats().storage_errors, 2);
    assert_eq!(
        harness.storage.get_document(id).await.unwrap().status,
        DocumentStatus::Completed
    );
}

#[tokio::test]
async fn test_each_document_is_processed_once() {
    let harness = Harness::new().await;
    let first = harness.add(REPORT.as_bytes(), DocumentType::Raw).await;
    let second = harness.add(b"Nothing measurable happened this quarter.", DocumentType::Raw).await;
    let mut orchestrator =
        Orchestrator::new(harness.storage.clone(), harness.storage.clone(), harness.raw.clone());

    assert_eq!(orchestrator.run_batch().await.unwrap(), 2);
    assert_eq!(orchestrator.run_batch().await.unwrap(), 0);

    assert_eq!(
        harness.storage.get_document(second).await.unwrap().status,
        DocumentStatus::CompletedNoData
    );
    assert_ne!(
        harness.storage.get_document(first).await.unwrap().status,
        DocumentStatus::Pending
    );
}

#[test]
fn test_schema_detection_threshold() {
    let parser = TabularParser::default();

    let matched = parser.detect_profile(&["Facility Name", "Chemical", "Unit of Measure"]);
    let unmatched = parser.detect_profile(&["Facility Name", "Chemical", "Notes"]);

    assert_eq!(matched.unwrap().profile.name, "epa_tri");
    assert!(unmatched.is_none());
}

#[tokio::test]
async fn test_tri_export_end_to_end() {
    let harness = Harness::new().await;
    let csv = "\u{feff}FACILITY NAME,CHEMICAL,UNIT OF MEASURE,YEAR,107. TOTAL RELEASES,94. OFF-SITE RECYCLED TOTAL\n\
        Plant A,Toluene,Pounds,2021,2000,0\n\
        Plant B,Tritium,Curies,2021,500,\n\
        Plant C,Lead,Pounds,2022,,15\n\
        ,Benzene,Pounds,2021,10,10\n";
    let id = harness.add(csv.as_bytes(), DocumentType::Tabular).await;
    let mut orchestrator =
        Orchestrator::new(harness.storage.clone(), harness.storage.clone(), harness.raw.clone());

    orchestrator.run_batch().await.unwrap();

    assert_eq!(
        harness.storage.get_document(id).await.unwrap().status,
        DocumentStatus::Completed
    );
    let citations = harness.storage.citations_for_document(id).await.unwrap();
    assert_eq!(citations.len(), 2);
    assert!(citations
        .iter()
        .any(|c| c == "Plant A Disposal/Released 2000 Pounds of Toluene in 2021"));
    assert!(citations
        .iter()
        .any(|c| c == "Plant C Recycled 15 Pounds of Lead in 2022"));
}
