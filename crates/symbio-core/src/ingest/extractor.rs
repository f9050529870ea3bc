use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::categories::CategoryTable;
use super::units::{self, Quantity};
use super::validation::{ExtractionResult, FactCandidate, Validator};
use crate::fact::{EmissionEvent, ExchangeEvent, FactData, FactKind, Measurement, WasteEvent};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Extraction failed: {0}")]
    Failed(String),
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Rate limited")]
    RateLimited,
    #[error("Invalid model response: {0}")]
    InvalidResponse(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    RuleBased,
    ModelAssisted,
    Composite,
}

/// Produces unchecked candidates from cleaned text.
///
/// Implementations never decide acceptance; every candidate goes through
/// [`Validator`] afterwards.
#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    fn strategy(&self) -> ExtractionStrategy;

    async fn candidates(&self, text: &str) -> Result<Vec<FactCandidate>, ExtractionError>;
}

static EMISSION_VOCAB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:co2e?|carbon|emissions?|emitted|ghg|greenhouse|methane|ch4)\b")
        .expect("emission vocabulary regex")
});

static EXCHANGE_VOCAB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:symbiosis|exchanges?|exchanged|industrial park|eco-?(?:industrial )?parks?|supplied to|transferred to|by-?product synergy)\b",
    )
    .expect("exchange vocabulary regex")
});

static GAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:co2e|co2|carbon dioxide|methane|ch4|nitrous oxide|n2o|greenhouse gas(?:es)?|ghg|carbon)\b",
    )
    .expect("gas regex")
});

static SCOPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bscope\s*([123])\b").expect("scope regex"));

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("year regex"));

static ORGANIZATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b[A-Z][\w&'-]*(?:\s+(?:[A-Z][\w&'-]*|&|of|and))*\s+(?:Corporation|Corp|Inc|Ltd|LLC|GmbH|AG|SA|PLC|Co|Company|Group|Holdings|Industries|A/S)\b",
    )
    .expect("organization regex")
});

static FLOW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?P<src>[A-Z][\w&'-]*(?:\s+[A-Z][\w&'-]*)*)\s+(?:supplied|supplies|sends?|sent|sold|sells|transferred|transfers|delivered|delivers|provided|provides|exported|exports|piped|pipes)\b[^.!?]*?\bto\s+(?:the\s+)?(?P<dst>[A-Z][\w&'-]*(?:\s+[A-Z][\w&'-]*)*)",
    )
    .expect("flow regex")
});

static MATERIAL_AFTER_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:of\s+)?(?:(?:the|a|an)\s+)?(?P<mat>[A-Za-z][A-Za-z -]*?)(?:\s+(?:from|to|in|at|for|by|and|or|which|that|was|were|per|into|during|through|with|on|annually|generated|produced|collected|processed|recycled|sent|delivered|supplied)\b|\s*[,.;:()]|\s*$)",
    )
    .expect("material regex")
});

static TREATMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(recycled|recovered|reused|landfilled|incinerated|composted|treated|disposed|released)\b",
    )
    .expect("treatment regex")
});

static ECO_PARK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:kalundborg|ulsan|tianjin|kawasaki)\b").expect("eco-park regex")
});

/// Routes a piece of text to the record kind its vocabulary suggests.
#[must_use]
pub fn detect_kind(text: &str) -> FactKind {
    if EMISSION_VOCAB.is_match(text) {
        FactKind::EmissionEvent
    } else if EXCHANGE_VOCAB.is_match(text) {
        FactKind::ExchangeEvent
    } else {
        FactKind::WasteEvent
    }
}

/// Byte span of the sentence enclosing `start..end`.
///
/// Sentence ends are `.`, `!` or `?` followed by whitespace, or a line
/// break, so decimals like `5.5` do not split a sentence.
#[must_use]
pub fn sentence_span(text: &str, start: usize, end: usize) -> (usize, usize) {
    let is_break = |c: char, next: Option<char>| {
        c == '\n' || (matches!(c, '.' | '!' | '?') && next.is_none_or(char::is_whitespace))
    };

    let mut sentence_start = 0;
    let head = &text[..start];
    for (i, c) in head.char_indices().rev() {
        let next = text[i + c.len_utf8()..].chars().next();
        if is_break(c, next) {
            sentence_start = i + c.len_utf8();
            break;
        }
    }

    let mut sentence_end = text.len();
    for (i, c) in text[end..].char_indices() {
        let at = end + i;
        let next = text[at + c.len_utf8()..].chars().next();
        if c == '\n' {
            sentence_end = at;
            break;
        }
        if is_break(c, next) {
            sentence_end = at + c.len_utf8();
            break;
        }
    }

    let sentence = &text[sentence_start..sentence_end];
    let leading = sentence.len() - sentence.trim_start().len();
    let trailing = sentence.len() - sentence.trim_end().len();
    (sentence_start + leading, sentence_end - trailing)
}

/// Deterministic regex extraction: every mass quantity becomes one
/// candidate quoting its enclosing sentence.
pub struct RuleBasedExtractor {
    categories: CategoryTable,
    confidence: f64,
}

impl RuleBasedExtractor {
    #[must_use]
    pub const fn new(categories: CategoryTable) -> Self {
        Self {
            categories,
            confidence: 0.6,
        }
    }

    #[must_use]
    pub const fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    #[must_use]
    pub fn extract_candidates(&self, text: &str) -> Vec<FactCandidate> {
        let quantities = units::extract_quantities(text);
        let document_year = first_year(text, &quantities);

        quantities
            .iter()
            .filter(|q| q.is_mass())
            .map(|quantity| {
                let (start, end) = sentence_span(text, quantity.start, quantity.end);
                let sentence = &text[start..end];
                let local: Vec<Quantity> = quantities
                    .iter()
                    .filter(|q| q.start >= start && q.end <= end)
                    .map(|q| Quantity {
                        start: q.start - start,
                        end: q.end - start,
                        ..q.clone()
                    })
                    .collect();
                let year = first_year(sentence, &local).or(document_year);
                let after_unit = &text[quantity.end..end.max(quantity.end)];

                let data = match detect_kind(sentence) {
                    FactKind::WasteEvent => self.waste_event(sentence, after_unit, quantity, year),
                    FactKind::EmissionEvent => self.emission_event(sentence, after_unit, quantity, year),
                    FactKind::ExchangeEvent => self.exchange_event(text, sentence, after_unit, quantity, year),
                };

                debug!(kind = %data.kind(), quantity = %quantity.raw, "rule candidate");
                FactCandidate::quoted(data, Some(sentence.to_string()), self.confidence)
            })
            .collect()
    }

    fn material(&self, sentence: &str, after_unit: &str) -> String {
        if let Some(mat) = MATERIAL_AFTER_UNIT
            .captures(after_unit)
            .and_then(|caps| caps.name("mat"))
            .map(|m| m.as_str().trim())
            .filter(|m| m.len() >= 2)
        {
            return mat.to_string();
        }

        for (pattern, _) in self.categories.patterns_longest_first() {
            if let Some(found) = pattern.find(sentence) {
                return found.as_str().to_string();
            }
        }

        String::new()
    }

    fn waste_event(
        &self,
        sentence: &str,
        after_unit: &str,
        quantity: &Quantity,
        year: Option<i32>,
    ) -> FactData {
        let material = self.material(sentence, after_unit);
        let category = self.categories.categorize(&material).map(String::from);

        FactData::WasteEvent(WasteEvent {
            material,
            category,
            quantity: measurement(quantity),
            company: organization(sentence),
            location: None,
            year,
            treatment: TREATMENT
                .captures(sentence)
                .map(|caps| caps[1].to_lowercase()),
        })
    }

    /// Named gases first, then whatever substance follows the unit. An
    /// empty substance is left for the validator to reject.
    fn emission_event(
        &self,
        sentence: &str,
        after_unit: &str,
        quantity: &Quantity,
        year: Option<i32>,
    ) -> FactData {
        let substance = GAS.find(sentence).map_or_else(
            || self.material(sentence, after_unit),
            |gas| gas.as_str().to_string(),
        );

        FactData::EmissionEvent(EmissionEvent {
            substance,
            quantity: measurement(quantity),
            company: organization(sentence),
            location: None,
            year,
            scope: SCOPE.find(sentence).map(|m| m.as_str().to_lowercase()),
        })
    }

    fn exchange_event(
        &self,
        text: &str,
        sentence: &str,
        after_unit: &str,
        quantity: &Quantity,
        year: Option<i32>,
    ) -> FactData {
        let flow = FLOW.captures(sentence);
        let eco_park = ECO_PARK.find(text).map(|m| m.as_str().to_string());

        FactData::ExchangeEvent(ExchangeEvent {
            material: self.material(sentence, after_unit),
            source_company: flow.as_ref().map(|caps| caps["src"].to_string()),
            target_company: flow.as_ref().map(|caps| caps["dst"].to_string()),
            volume: measurement(quantity),
            eco_park,
            year,
        })
    }
}

impl Default for RuleBasedExtractor {
    fn default() -> Self {
        Self::new(CategoryTable::default())
    }
}

#[async_trait::async_trait]
impl Extractor for RuleBasedExtractor {
    fn strategy(&self) -> ExtractionStrategy {
        ExtractionStrategy::RuleBased
    }

    async fn candidates(&self, text: &str) -> Result<Vec<FactCandidate>, ExtractionError> {
        Ok(self.extract_candidates(text))
    }
}

fn measurement(quantity: &Quantity) -> Option<Measurement> {
    quantity
        .tons
        .map(|tons| Measurement::new(tons, quantity.value, quantity.unit_label()))
}

fn organization(sentence: &str) -> Option<String> {
    ORGANIZATION
        .find(sentence)
        .map(|m| m.as_str().trim().to_string())
}

/// First plausible year that is not part of a quantity literal.
fn first_year(text: &str, quantities: &[Quantity]) -> Option<i32> {
    YEAR.find_iter(text)
        .find(|m| !quantities.iter().any(|q| m.start() < q.end && q.start < m.end()))
        .and_then(|m| m.as_str().parse().ok())
}

/// Rule-based extraction with an optional fallback that only runs when the
/// rules find nothing, followed by validation of every candidate.
pub struct FactExtractor {
    rules: Box<dyn Extractor>,
    fallback: Option<Box<dyn Extractor>>,
    validator: Validator,
}

impl FactExtractor {
    #[must_use]
    pub fn new(validator: Validator) -> Self {
        Self {
            rules: Box::new(RuleBasedExtractor::default()),
            fallback: None,
            validator,
        }
    }

    #[must_use]
    pub fn with_rules(mut self, rules: Box<dyn Extractor>) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: Box<dyn Extractor>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    #[must_use]
    pub const fn validator(&self) -> &Validator {
        &self.validator
    }

    #[must_use]
    pub fn strategy(&self) -> ExtractionStrategy {
        if self.fallback.is_some() {
            ExtractionStrategy::Composite
        } else {
            self.rules.strategy()
        }
    }

    /// Candidates from the rules, or from the fallback if the rules found
    /// none.
    ///
    /// # Errors
    ///
    /// Propagates extractor failures (model outages, malformed replies).
    pub async fn candidates(&self, text: &str) -> Result<Vec<FactCandidate>, ExtractionError> {
        let candidates = self.rules.candidates(text).await?;
        if !candidates.is_empty() {
            return Ok(candidates);
        }

        match &self.fallback {
            Some(fallback) => fallback.candidates(text).await,
            None => Ok(candidates),
        }
    }

    /// Every candidate found in `text`, each validated on its own.
    ///
    /// # Errors
    ///
    /// See [`Self::candidates`].
    pub async fn extract_all(&self, text: &str) -> Result<Vec<ExtractionResult>, ExtractionError> {
        let candidates = self.candidates(text).await?;
        Ok(self.validator.validate_all(candidates, text))
    }

    /// The first accepted fact, else the first rejection, else `None` when
    /// the text yields no candidates at all.
    ///
    /// # Errors
    ///
    /// See [`Self::candidates`].
    pub async fn extract(&self, text: &str) -> Result<Option<ExtractionResult>, ExtractionError> {
        let results = self.extract_all(text).await?;
        let first_accepted = results.iter().position(ExtractionResult::is_accepted);
        Ok(match first_accepted {
            Some(i) => results.into_iter().nth(i),
            None => results.into_iter().next(),
        })
    }
}

impl Default for FactExtractor {
    fn default() -> Self {
        Self::new(Validator::default())
    }
}
