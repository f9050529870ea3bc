use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Facts below this confidence are stored but flagged for human review.
pub const AUTO_ACCEPT_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    WasteEvent,
    EmissionEvent,
    ExchangeEvent,
}

impl FactKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WasteEvent => "waste_event",
            Self::EmissionEvent => "emission_event",
            Self::ExchangeEvent => "exchange_event",
        }
    }
}

impl std::fmt::Display for FactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A quantity converted to metric tonnes, keeping the literal it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub tons: f64,
    pub original_value: f64,
    pub original_unit: String,
}

impl Measurement {
    #[must_use]
    pub fn new(tons: f64, original_value: f64, original_unit: impl Into<String>) -> Self {
        Self {
            tons,
            original_value,
            original_unit: original_unit.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WasteEvent {
    pub material: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Measurement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    /// Fate of the material: recycled, treated, released...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub treatment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmissionEvent {
    pub substance: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Measurement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeEvent {
    pub material: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Measurement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eco_park: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
}

/// Kind-specific payload of a fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FactData {
    WasteEvent(WasteEvent),
    EmissionEvent(EmissionEvent),
    ExchangeEvent(ExchangeEvent),
}

impl FactData {
    #[must_use]
    pub const fn kind(&self) -> FactKind {
        match self {
            Self::WasteEvent(_) => FactKind::WasteEvent,
            Self::EmissionEvent(_) => FactKind::EmissionEvent,
            Self::ExchangeEvent(_) => FactKind::ExchangeEvent,
        }
    }

    /// Material for waste and exchange events, substance for emissions.
    #[must_use]
    pub fn subject(&self) -> &str {
        match self {
            Self::WasteEvent(w) => &w.material,
            Self::EmissionEvent(e) => &e.substance,
            Self::ExchangeEvent(x) => &x.material,
        }
    }

    #[must_use]
    pub const fn quantity(&self) -> Option<&Measurement> {
        match self {
            Self::WasteEvent(w) => w.quantity.as_ref(),
            Self::EmissionEvent(e) => e.quantity.as_ref(),
            Self::ExchangeEvent(x) => x.volume.as_ref(),
        }
    }

    #[must_use]
    pub const fn year(&self) -> Option<i32> {
        match self {
            Self::WasteEvent(w) => w.year,
            Self::EmissionEvent(e) => e.year,
            Self::ExchangeEvent(x) => x.year,
        }
    }

    #[must_use]
    pub fn company(&self) -> Option<&str> {
        match self {
            Self::WasteEvent(w) => w.company.as_deref(),
            Self::EmissionEvent(e) => e.company.as_deref(),
            Self::ExchangeEvent(x) => x.source_company.as_deref(),
        }
    }

    /// Optional text fields that must be copied from the source, by name.
    /// `category` is derived from the material and is not included.
    #[must_use]
    pub fn quoted_fields(&self) -> Vec<(&'static str, &str)> {
        let fields: [(&'static str, Option<&String>); 3] = match self {
            Self::WasteEvent(w) => [
                ("company", w.company.as_ref()),
                ("location", w.location.as_ref()),
                ("treatment", w.treatment.as_ref()),
            ],
            Self::EmissionEvent(e) => [
                ("company", e.company.as_ref()),
                ("location", e.location.as_ref()),
                ("scope", e.scope.as_ref()),
            ],
            Self::ExchangeEvent(x) => [
                ("source_company", x.source_company.as_ref()),
                ("target_company", x.target_company.as_ref()),
                ("eco_park", x.eco_park.as_ref()),
            ],
        };

        fields
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v.as_str())))
            .filter(|(_, value)| !value.trim().is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationKind {
    /// Literal span of the cleaned source text.
    Quote,
    /// Statement synthesized from a single tabular row.
    RowDerived,
}

impl CitationKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::RowDerived => "row_derived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub kind: CitationKind,
    pub text: String,
}

/// A structured claim that passed validation.
///
/// There is no public constructor: facts come out of
/// [`crate::ingest::Validator`] only, so everything handed to a
/// [`crate::storage::FactStore`] has had its citation and bounds checked.
#[derive(Debug, Clone, Serialize)]
pub struct Fact {
    id: Uuid,
    document_id: Option<Uuid>,
    data: FactData,
    citation: Citation,
    confidence: f64,
    requires_review: bool,
    created_at: DateTime<Utc>,
}

impl Fact {
    pub(crate) fn new(data: FactData, citation: Citation, confidence: f64) -> Self {
        Self {
            id: Uuid::now_v7(),
            document_id: None,
            data,
            citation,
            confidence,
            requires_review: confidence < AUTO_ACCEPT_CONFIDENCE,
            created_at: Utc::now(),
        }
    }

    /// Binds the fact to the document it was extracted from.
    #[must_use]
    pub const fn with_document(mut self, document_id: Uuid) -> Self {
        self.document_id = Some(document_id);
        self
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn document_id(&self) -> Option<Uuid> {
        self.document_id
    }

    #[must_use]
    pub const fn kind(&self) -> FactKind {
        self.data.kind()
    }

    #[must_use]
    pub const fn data(&self) -> &FactData {
        &self.data
    }

    #[must_use]
    pub const fn citation(&self) -> &Citation {
        &self.citation
    }

    #[must_use]
    pub const fn confidence(&self) -> f64 {
        self.confidence
    }

    #[must_use]
    pub const fn requires_review(&self) -> bool {
        self.requires_review
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fact_data_serializes_with_kind_tag() {
        let data = FactData::WasteEvent(WasteEvent {
            material: "slag".into(),
            year: Some(2021),
            ..Default::default()
        });

        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["kind"], "waste_event");
        assert_eq!(json["material"], "slag");
        assert!(json.get("company").is_none());
    }

    #[test]
    fn test_low_confidence_requires_review() {
        let citation = Citation {
            kind: CitationKind::Quote,
            text: "slag".into(),
        };
        let data = FactData::EmissionEvent(EmissionEvent {
            substance: "CO2".into(),
            ..Default::default()
        });

        let sure = Fact::new(data.clone(), citation.clone(), 0.95);
        let unsure = Fact::new(data, citation, 0.6);

        assert!(!sure.requires_review());
        assert!(unsure.requires_review());
        assert_eq!(unsure.kind(), FactKind::EmissionEvent);
    }

    #[test]
    fn test_subject_by_kind() {
        let exchange = FactData::ExchangeEvent(ExchangeEvent {
            material: "steam".into(),
            source_company: Some("Asnaes".into()),
            ..Default::default()
        });

        assert_eq!(exchange.subject(), "steam");
        assert_eq!(exchange.company(), Some("Asnaes"));
        assert_eq!(exchange.kind(), FactKind::ExchangeEvent);
    }
}
