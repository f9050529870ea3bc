use std::sync::LazyLock;

use chrono::Datelike;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::units::{extract_quantities, parse_number};
use crate::fact::{Citation, CitationKind, Fact, FactData, FactKind};

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").expect("number regex"));

/// Plausibility limits applied to every candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationBounds {
    /// Earliest accepted reporting year
    pub min_year: i32,
    /// Latest accepted reporting year; `None` means next calendar year
    pub max_year: Option<i32>,
    /// Upper bound for waste and exchange quantities, in tonnes
    pub max_quantity_tons: f64,
    /// Upper bound for emission quantities, in tonnes
    pub max_emission_tons: f64,
    /// Material/substance name length, in characters
    pub min_material_len: usize,
    pub max_material_len: usize,
    /// Shortest quoted citation considered evidence
    pub min_citation_len: usize,
}

impl Default for ValidationBounds {
    fn default() -> Self {
        Self {
            min_year: 1970,
            max_year: None,
            max_quantity_tons: 1e8,
            max_emission_tons: 1e10,
            min_material_len: 2,
            max_material_len: 100,
            min_citation_len: 10,
        }
    }
}

impl ValidationBounds {
    #[must_use]
    pub fn effective_max_year(&self) -> i32 {
        self.max_year.unwrap_or_else(|| chrono::Utc::now().year() + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Text,
    TabularRow,
}

/// An unchecked fact proposed by an extractor or the tabular parser.
#[derive(Debug, Clone)]
pub struct FactCandidate {
    data: FactData,
    citation: Option<String>,
    confidence: f64,
    origin: Origin,
}

impl FactCandidate {
    /// A candidate backed by a quote from the source text.
    #[must_use]
    pub const fn quoted(data: FactData, citation: Option<String>, confidence: f64) -> Self {
        Self {
            data,
            citation,
            confidence,
            origin: Origin::Text,
        }
    }

    /// A candidate synthesized from one tabular row; its citation is a
    /// restatement of the row rather than a quote.
    pub(crate) const fn from_row(data: FactData, citation: String) -> Self {
        Self {
            data,
            citation: Some(citation),
            confidence: 1.0,
            origin: Origin::TabularRow,
        }
    }

    #[must_use]
    pub const fn data(&self) -> &FactData {
        &self.data
    }

    #[must_use]
    pub fn citation(&self) -> Option<&str> {
        self.citation.as_deref()
    }

    #[must_use]
    pub const fn confidence(&self) -> f64 {
        self.confidence
    }

    #[must_use]
    pub const fn kind(&self) -> FactKind {
        self.data.kind()
    }

    #[must_use]
    pub fn is_row_derived(&self) -> bool {
        self.origin == Origin::TabularRow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    Citation,
    Bounds,
    Incomplete,
}

/// Why a candidate did not become a fact.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("citation missing")]
    MissingCitation,
    #[error("citation too short: {len} chars (minimum {min})")]
    CitationTooShort { len: usize, min: usize },
    #[error("citation not found in source text: {0:?}")]
    CitationNotFound(String),
    #[error("quantity {0} does not appear in the citation")]
    QuantityNotCited(String),
    #[error("quantity {value} {unit} does not match the unit cited")]
    UnitNotCited { value: String, unit: String },
    #[error("{field} {value:?} does not appear in the source text")]
    NotInSource { field: &'static str, value: String },
    #[error("{field} out of bounds: {value} ({reason})")]
    OutOfBounds {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("required field missing: {0}")]
    MissingField(&'static str),
}

impl Rejection {
    #[must_use]
    pub const fn category(&self) -> RejectionCategory {
        match self {
            Self::MissingCitation
            | Self::CitationTooShort { .. }
            | Self::CitationNotFound(_)
            | Self::QuantityNotCited(_)
            | Self::UnitNotCited { .. }
            | Self::NotInSource { .. } => RejectionCategory::Citation,
            Self::OutOfBounds { .. } => RejectionCategory::Bounds,
            Self::MissingField(_) => RejectionCategory::Incomplete,
        }
    }

    fn out_of_bounds(field: &'static str, value: impl ToString, reason: impl Into<String>) -> Self {
        Self::OutOfBounds {
            field,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Outcome of validating one candidate.
#[derive(Debug, Clone)]
pub enum ExtractionResult {
    Accepted(Fact),
    Rejected {
        kind: FactKind,
        citation: Option<String>,
        reason: Rejection,
    },
}

impl ExtractionResult {
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    #[must_use]
    pub const fn fact(&self) -> Option<&Fact> {
        match self {
            Self::Accepted(fact) => Some(fact),
            Self::Rejected { .. } => None,
        }
    }

    #[must_use]
    pub const fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Accepted(_) => None,
            Self::Rejected { reason, .. } => Some(reason),
        }
    }
}

/// Whitespace-collapsed, lower-cased form used for citation matching.
#[must_use]
pub fn match_form(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// True when `citation` is a contiguous span of `text`, ignoring case and
/// runs of whitespace.
#[must_use]
pub fn citation_in_text(citation: &str, text: &str) -> bool {
    let citation = match_form(citation);
    !citation.is_empty() && match_form(text).contains(&citation)
}

/// The provenance and plausibility gate every fact passes through.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    bounds: ValidationBounds,
}

impl Validator {
    #[must_use]
    pub const fn new(bounds: ValidationBounds) -> Self {
        Self { bounds }
    }

    #[must_use]
    pub const fn bounds(&self) -> &ValidationBounds {
        &self.bounds
    }

    /// Validates a single candidate against the cleaned source text.
    #[must_use]
    pub fn validate(&self, candidate: FactCandidate, source_text: &str) -> ExtractionResult {
        self.validate_matched(candidate, &match_form(source_text))
    }

    /// Validates each candidate independently; one rejection never affects
    /// the others.
    #[must_use]
    pub fn validate_all(
        &self,
        candidates: Vec<FactCandidate>,
        source_text: &str,
    ) -> Vec<ExtractionResult> {
        let matched = match_form(source_text);
        candidates
            .into_iter()
            .map(|candidate| self.validate_matched(candidate, &matched))
            .collect()
    }

    fn validate_matched(&self, candidate: FactCandidate, matched_text: &str) -> ExtractionResult {
        let checks = self
            .check_citation(&candidate, matched_text)
            .and_then(|()| self.check_fields(&candidate.data))
            .and_then(|()| check_confidence(candidate.confidence));

        match checks {
            Ok(()) => {
                let kind = if candidate.is_row_derived() {
                    CitationKind::RowDerived
                } else {
                    CitationKind::Quote
                };
                let text = candidate.citation.unwrap_or_default().trim().to_string();
                let citation = Citation { kind, text };
                ExtractionResult::Accepted(Fact::new(candidate.data, citation, candidate.confidence))
            }
            Err(reason) => ExtractionResult::Rejected {
                kind: candidate.data.kind(),
                citation: candidate.citation,
                reason,
            },
        }
    }

    fn check_citation(&self, candidate: &FactCandidate, matched_text: &str) -> Result<(), Rejection> {
        let citation = candidate
            .citation
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(Rejection::MissingCitation)?;

        // Row statements are derived from the row itself and have no span
        // in the file to point at.
        if candidate.is_row_derived() {
            return Ok(());
        }

        let len = citation.chars().count();
        if len < self.bounds.min_citation_len {
            return Err(Rejection::CitationTooShort {
                len,
                min: self.bounds.min_citation_len,
            });
        }

        let quote = match_form(citation);
        if !matched_text.contains(&quote) {
            return Err(Rejection::CitationNotFound(citation.to_string()));
        }

        if let Some(quantity) = candidate.data.quantity() {
            let cited = NUMBER
                .find_iter(citation)
                .filter_map(|m| parse_number(m.as_str()))
                .any(|n| same_value(n, quantity.original_value));
            if !cited {
                return Err(Rejection::QuantityNotCited(quantity.original_value.to_string()));
            }

            // The cited number and unit must convert to the same tonnage.
            let same_mass = extract_quantities(citation).iter().any(|q| {
                same_value(q.value, quantity.original_value)
                    && q.tons.is_some_and(|tons| same_value(tons, quantity.tons))
            });
            if !same_mass {
                return Err(Rejection::UnitNotCited {
                    value: quantity.original_value.to_string(),
                    unit: quantity.original_unit.clone(),
                });
            }
        }

        if let Some(year) = candidate.data.year() {
            if !matched_text.contains(&year.to_string()) {
                return Err(Rejection::NotInSource {
                    field: "year",
                    value: year.to_string(),
                });
            }
        }

        let subject = match_form(candidate.data.subject());
        if !subject.is_empty() && !matched_text.contains(&subject) {
            return Err(Rejection::NotInSource {
                field: "material",
                value: candidate.data.subject().to_string(),
            });
        }

        for (field, value) in candidate.data.quoted_fields() {
            if !matched_text.contains(&match_form(value)) {
                return Err(Rejection::NotInSource {
                    field,
                    value: value.to_string(),
                });
            }
        }

        Ok(())
    }

    fn check_fields(&self, data: &FactData) -> Result<(), Rejection> {
        let subject = data.subject().trim();
        if subject.is_empty() {
            return Err(Rejection::MissingField(match data {
                FactData::EmissionEvent(_) => "substance",
                _ => "material",
            }));
        }

        let len = subject.chars().count();
        if len < self.bounds.min_material_len || len > self.bounds.max_material_len {
            return Err(Rejection::out_of_bounds(
                "material",
                len,
                format!(
                    "length must be {}..={}",
                    self.bounds.min_material_len, self.bounds.max_material_len
                ),
            ));
        }

        match data {
            FactData::EmissionEvent(e) if e.year.is_none() => {
                return Err(Rejection::MissingField("year"));
            }
            FactData::ExchangeEvent(x) => {
                if x.source_company.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    return Err(Rejection::MissingField("source_company"));
                }
                if x.target_company.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    return Err(Rejection::MissingField("target_company"));
                }
            }
            _ => {}
        }

        if let Some(year) = data.year() {
            let max_year = self.bounds.effective_max_year();
            if year < self.bounds.min_year || year > max_year {
                return Err(Rejection::out_of_bounds(
                    "year",
                    year,
                    format!("must be {}..={max_year}", self.bounds.min_year),
                ));
            }
        }

        if let Some(quantity) = data.quantity() {
            let max = match data {
                FactData::EmissionEvent(_) => self.bounds.max_emission_tons,
                _ => self.bounds.max_quantity_tons,
            };
            if !quantity.tons.is_finite() || quantity.tons <= 0.0 {
                return Err(Rejection::out_of_bounds("quantity", quantity.tons, "must be positive"));
            }
            if quantity.tons > max {
                return Err(Rejection::out_of_bounds(
                    "quantity",
                    quantity.tons,
                    format!("exceeds {max} t"),
                ));
            }
        }

        Ok(())
    }
}

fn same_value(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

fn check_confidence(confidence: f64) -> Result<(), Rejection> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(Rejection::out_of_bounds("confidence", confidence, "must be within 0..=1"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{EmissionEvent, ExchangeEvent, Measurement, WasteEvent};

    const TEXT: &str = "Annual report.\nIn 2023, Acme Corp processed 5,000 tonnes of fly ash. Other news.";

    fn waste(material: &str, tons: f64, raw: f64, year: Option<i32>) -> FactData {
        FactData::WasteEvent(WasteEvent {
            material: material.into(),
            quantity: Some(Measurement::new(tons, raw, "tonnes")),
            year,
            ..Default::default()
        })
    }

    fn quoted(data: FactData, citation: &str) -> FactCandidate {
        FactCandidate::quoted(data, Some(citation.into()), 0.8)
    }

    #[test]
    fn test_citation_in_text_ignores_case_and_whitespace() {
        assert!(citation_in_text("acme corp   PROCESSED\n5,000 tonnes", TEXT));
        assert!(!citation_in_text("Acme Corp processed 6,000 tonnes", TEXT));
        assert!(!citation_in_text("   ", TEXT));
    }

    #[test]
    fn test_accepts_cited_fact() {
        let validator = Validator::default();
        let candidate = quoted(
            waste("fly ash", 5000.0, 5000.0, Some(2023)),
            "In 2023, Acme Corp processed 5,000 tonnes of fly ash.",
        );

        let result = validator.validate(candidate, TEXT);

        let fact = result.fact().expect("accepted");
        assert_eq!(fact.citation().kind, CitationKind::Quote);
        assert!(fact.requires_review());
    }

    #[test]
    fn test_rejects_missing_citation() {
        let validator = Validator::default();
        let candidate = FactCandidate::quoted(waste("fly ash", 5000.0, 5000.0, None), None, 0.9);

        let result = validator.validate(candidate, TEXT);

        assert_eq!(result.rejection(), Some(&Rejection::MissingCitation));
    }

    #[test]
    fn test_rejects_fabricated_citation() {
        let validator = Validator::default();
        let candidate = quoted(
            waste("fly ash", 9000.0, 9000.0, Some(2023)),
            "Acme Corp processed 9,000 tonnes of fly ash.",
        );

        let result = validator.validate(candidate, TEXT);

        let reason = result.rejection().expect("rejected");
        assert!(matches!(reason, Rejection::CitationNotFound(_)));
        assert_eq!(reason.category(), RejectionCategory::Citation);
    }

    #[test]
    fn test_rejects_quantity_absent_from_genuine_quote() {
        let validator = Validator::default();
        let candidate = quoted(
            waste("fly ash", 7000.0, 7000.0, Some(2023)),
            "In 2023, Acme Corp processed 5,000 tonnes of fly ash.",
        );

        let result = validator.validate(candidate, TEXT);

        assert_eq!(
            result.rejection(),
            Some(&Rejection::QuantityNotCited("7000".into()))
        );
    }

    #[test]
    fn test_rejects_year_not_in_text() {
        let validator = Validator::default();
        let candidate = quoted(
            waste("fly ash", 5000.0, 5000.0, Some(2019)),
            "Acme Corp processed 5,000 tonnes of fly ash.",
        );

        let result = validator.validate(candidate, TEXT);

        assert!(matches!(
            result.rejection(),
            Some(Rejection::NotInSource { field: "year", .. })
        ));
    }

    #[test]
    fn test_bounds_rejection_is_distinct_from_citation() {
        let text = "In 2023 the smelter shipped 500,000,000 tonnes of slag to the quarry.";
        let validator = Validator::default();
        let candidate = quoted(
            waste("slag", 5e8, 5e8, Some(2023)),
            "the smelter shipped 500,000,000 tonnes of slag",
        );

        let result = validator.validate(candidate, text);

        let reason = result.rejection().expect("rejected");
        assert_eq!(reason.category(), RejectionCategory::Bounds);
    }

    #[test]
    fn test_rejects_year_outside_range() {
        let text = "In 1950 the works dumped 300 tonnes of slag into the river.";
        let validator = Validator::default();
        let candidate = quoted(
            waste("slag", 300.0, 300.0, Some(1950)),
            "In 1950 the works dumped 300 tonnes of slag",
        );

        let result = validator.validate(candidate, text);

        assert!(matches!(
            result.rejection(),
            Some(Rejection::OutOfBounds { field: "year", .. })
        ));
    }

    #[test]
    fn test_rejects_confidence_out_of_range() {
        let validator = Validator::default();
        let candidate = FactCandidate::quoted(
            waste("fly ash", 5000.0, 5000.0, Some(2023)),
            Some("Acme Corp processed 5,000 tonnes of fly ash.".into()),
            1.5,
        );

        let result = validator.validate(candidate, TEXT);

        assert!(matches!(
            result.rejection(),
            Some(Rejection::OutOfBounds { field: "confidence", .. })
        ));
    }

    #[test]
    fn test_emission_requires_year() {
        let text = "The plant emitted 12,000 tonnes of CO2 last season.";
        let validator = Validator::default();
        let data = FactData::EmissionEvent(EmissionEvent {
            substance: "CO2".into(),
            quantity: Some(Measurement::new(12_000.0, 12_000.0, "tonnes")),
            ..Default::default()
        });

        let result = validator.validate(quoted(data, "The plant emitted 12,000 tonnes of CO2"), text);

        assert_eq!(result.rejection(), Some(&Rejection::MissingField("year")));
        assert_eq!(result.rejection().map(Rejection::category), Some(RejectionCategory::Incomplete));
    }

    #[test]
    fn test_exchange_requires_both_companies() {
        let text = "In 2020 Statoil supplied 2,000 tonnes of gypsum within the park.";
        let validator = Validator::default();
        let data = FactData::ExchangeEvent(ExchangeEvent {
            material: "gypsum".into(),
            source_company: Some("Statoil".into()),
            year: Some(2020),
            ..Default::default()
        });

        let result = validator.validate(
            quoted(data, "In 2020 Statoil supplied 2,000 tonnes of gypsum"),
            text,
        );

        assert_eq!(result.rejection(), Some(&Rejection::MissingField("target_company")));
    }

    #[test]
    fn test_row_derived_citation_skips_substring_check() {
        let validator = Validator::default();
        let candidate = FactCandidate::from_row(
            waste("LEAD", 1.0, 2204.62, Some(2022)),
            "Acme Smelter Recycled 2204.62 Pounds of LEAD in 2022".into(),
        );

        let result = validator.validate(candidate, "");

        let fact = result.fact().expect("accepted");
        assert_eq!(fact.citation().kind, CitationKind::RowDerived);
        assert!(!fact.requires_review());
    }

    #[test]
    fn test_rejects_unit_other_than_cited() {
        let validator = Validator::default();
        let candidate = quoted(
            FactData::WasteEvent(WasteEvent {
                material: "fly ash".into(),
                quantity: Some(Measurement::new(5.0, 5000.0, "kg")),
                year: Some(2023),
                ..Default::default()
            }),
            "In 2023, Acme Corp processed 5,000 tonnes of fly ash.",
        );

        let result = validator.validate(candidate, TEXT);

        let reason = result.rejection().expect("rejected");
        assert_eq!(
            reason,
            &Rejection::UnitNotCited {
                value: "5000".into(),
                unit: "kg".into()
            }
        );
        assert_eq!(reason.category(), RejectionCategory::Citation);
    }

    #[test]
    fn test_accepts_unit_synonym() {
        let validator = Validator::default();
        let candidate = quoted(
            FactData::WasteEvent(WasteEvent {
                material: "fly ash".into(),
                quantity: Some(Measurement::new(5000.0, 5000.0, "t")),
                year: Some(2023),
                ..Default::default()
            }),
            "In 2023, Acme Corp processed 5,000 tonnes of fly ash.",
        );

        assert!(validator.validate(candidate, TEXT).is_accepted());
    }

    #[test]
    fn test_waste_text_fields_must_appear_in_source() {
        let validator = Validator::default();
        let citation = "In 2023, Acme Corp processed 5,000 tonnes of fly ash.";
        let with = |company: &str, location: Option<&str>, treatment: Option<&str>| {
            quoted(
                FactData::WasteEvent(WasteEvent {
                    material: "fly ash".into(),
                    quantity: Some(Measurement::new(5000.0, 5000.0, "tonnes")),
                    company: Some(company.into()),
                    location: location.map(String::from),
                    treatment: treatment.map(String::from),
                    year: Some(2023),
                    ..Default::default()
                }),
                citation,
            )
        };

        assert!(validator.validate(with("ACME corp", None, Some("processed")), TEXT).is_accepted());
        assert!(matches!(
            validator.validate(with("Initech Holdings", None, None), TEXT).rejection(),
            Some(Rejection::NotInSource { field: "company", .. })
        ));
        assert!(matches!(
            validator.validate(with("Acme Corp", Some("Texas"), None), TEXT).rejection(),
            Some(Rejection::NotInSource { field: "location", .. })
        ));
        assert!(matches!(
            validator.validate(with("Acme Corp", None, Some("incinerated")), TEXT).rejection(),
            Some(Rejection::NotInSource { field: "treatment", .. })
        ));
    }

    #[test]
    fn test_emission_scope_must_appear_in_source() {
        let text = "In 2021 the kiln emitted 800 tonnes of CO2 under scope 1.";
        let validator = Validator::default();
        let emission = |scope: &str| {
            quoted(
                FactData::EmissionEvent(EmissionEvent {
                    substance: "CO2".into(),
                    quantity: Some(Measurement::new(800.0, 800.0, "tonnes")),
                    year: Some(2021),
                    scope: Some(scope.into()),
                    ..Default::default()
                }),
                text,
            )
        };

        assert!(validator.validate(emission("Scope 1"), text).is_accepted());
        assert!(matches!(
            validator.validate(emission("scope 3"), text).rejection(),
            Some(Rejection::NotInSource { field: "scope", .. })
        ));
    }

    #[test]
    fn test_exchange_text_fields_must_appear_in_source() {
        let text = "In 2020 Statoil supplied 2,000 tonnes of gypsum to Gyproc in Kalundborg.";
        let validator = Validator::default();
        let exchange = |target: &str, park: &str| {
            quoted(
                FactData::ExchangeEvent(ExchangeEvent {
                    material: "gypsum".into(),
                    source_company: Some("Statoil".into()),
                    target_company: Some(target.into()),
                    volume: Some(Measurement::new(2000.0, 2000.0, "tonnes")),
                    eco_park: Some(park.into()),
                    year: Some(2020),
                }),
                text,
            )
        };

        assert!(validator.validate(exchange("Gyproc", "Kalundborg"), text).is_accepted());
        assert!(matches!(
            validator.validate(exchange("Knauf", "Kalundborg"), text).rejection(),
            Some(Rejection::NotInSource { field: "target_company", .. })
        ));
        assert!(matches!(
            validator.validate(exchange("Gyproc", "Ulsan"), text).rejection(),
            Some(Rejection::NotInSource { field: "eco_park", .. })
        ));
    }

    #[test]
    fn test_validate_all_is_independent() {
        let validator = Validator::default();
        let good = quoted(
            waste("fly ash", 5000.0, 5000.0, Some(2023)),
            "Acme Corp processed 5,000 tonnes of fly ash.",
        );
        let bad = quoted(waste("fly ash", 5000.0, 5000.0, Some(2023)), "Nothing like this appears here.");

        let results = validator.validate_all(vec![good.clone(), bad, good], TEXT);

        assert_eq!(results.iter().filter(|r| r.is_accepted()).count(), 2);
        assert!(!results[1].is_accepted());
    }
}
