use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown unit: {0}")]
pub struct UnknownUnit(pub String);

/// Mass units and their weight in metric tonnes.
const MASS_UNITS: &[(&str, f64)] = &[
    ("t", 1.0),
    ("mt", 1.0),
    ("tonne", 1.0),
    ("tonnes", 1.0),
    ("metric ton", 1.0),
    ("metric tons", 1.0),
    ("metric tonne", 1.0),
    ("metric tonnes", 1.0),
    ("tco2", 1.0),
    ("tco2e", 1.0),
    ("ton", 0.907_185),
    ("tons", 0.907_185),
    ("short ton", 0.907_185),
    ("short tons", 0.907_185),
    ("us ton", 0.907_185),
    ("us tons", 0.907_185),
    ("long ton", 1.016_05),
    ("long tons", 1.016_05),
    ("kt", 1000.0),
    ("kilotonne", 1000.0),
    ("kilotonnes", 1000.0),
    ("kg", 0.001),
    ("kgs", 0.001),
    ("kilogram", 0.001),
    ("kilograms", 0.001),
    ("g", 0.000_001),
    ("gram", 0.000_001),
    ("grams", 0.000_001),
    ("lb", 0.000_453_592),
    ("lbs", 0.000_453_592),
    ("pound", 0.000_453_592),
    ("pounds", 0.000_453_592),
    ("cwt", 0.045_359_2),
    ("hundredweight", 0.045_359_2),
];

static QUANTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?P<num>\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)\s*(?P<mult>million|thousand|billion)?\s*(?P<unit>metric\s+tonnes?|metric\s+tons?|short\s+tons?|long\s+tons?|kilotonnes?|kilograms?|tonnes?|tons?|tco2e?|pounds?|grams?|hundredweight|cwt|kgs?|lbs?|kt|mt|cubic\s+met(?:er|re)s?|m3|lit(?:er|re)s?|gallons?|barrels?|[mgk]wh|gj|tj|t|g)\b",
    )
    .expect("quantity regex")
});

/// A number-plus-unit occurrence found in text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    /// The number exactly as written, separators included.
    pub raw: String,
    pub value: f64,
    pub multiplier: f64,
    pub unit: String,
    /// `None` when the unit is not a mass unit.
    pub tons: Option<f64>,
    pub start: usize,
    pub end: usize,
}

impl Quantity {
    /// Value with the multiplier word applied, in the original unit.
    #[must_use]
    pub fn scaled_value(&self) -> f64 {
        self.value * self.multiplier
    }

    #[must_use]
    pub fn is_mass(&self) -> bool {
        self.tons.is_some()
    }

    /// Unit as written, including a multiplier word if there was one.
    #[must_use]
    pub fn unit_label(&self) -> String {
        match multiplier_word(self.multiplier) {
            Some(word) => format!("{word} {}", self.unit),
            None => self.unit.clone(),
        }
    }
}

fn multiplier_word(multiplier: f64) -> Option<&'static str> {
    if (multiplier - 1e3).abs() < f64::EPSILON {
        Some("thousand")
    } else if (multiplier - 1e6).abs() < f64::EPSILON {
        Some("million")
    } else if (multiplier - 1e9).abs() < f64::EPSILON {
        Some("billion")
    } else {
        None
    }
}

fn canonical_unit(unit: &str) -> String {
    unit.trim()
        .trim_end_matches('.')
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Metric tonnes per one `unit`, if `unit` is a known mass unit.
#[must_use]
pub fn tons_per_unit(unit: &str) -> Option<f64> {
    let unit = canonical_unit(unit);
    MASS_UNITS
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, factor)| *factor)
}

/// Converts `value` expressed in `unit` to metric tonnes.
///
/// # Errors
///
/// Returns [`UnknownUnit`] for anything outside the mass table. Nothing is
/// assumed for unrecognised units.
pub fn to_tons(value: f64, unit: &str) -> Result<f64, UnknownUnit> {
    tons_per_unit(unit)
        .map(|factor| value * factor)
        .ok_or_else(|| UnknownUnit(unit.trim().to_string()))
}

/// Lenient numeric parse for report cells: thousands separators, inner
/// spaces and a leading `<` are tolerated.
#[must_use]
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('<')
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();

    if cleaned.is_empty() {
        return None;
    }

    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Finds every number-plus-unit pair in `text`.
#[must_use]
pub fn extract_quantities(text: &str) -> Vec<Quantity> {
    QUANTITY
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let raw = caps.name("num")?.as_str();
            let unit = canonical_unit(caps.name("unit")?.as_str());
            let value = parse_number(raw)?;
            let multiplier = match caps.name("mult").map(|m| m.as_str().to_lowercase()) {
                Some(m) if m == "thousand" => 1e3,
                Some(m) if m == "million" => 1e6,
                Some(m) if m == "billion" => 1e9,
                _ => 1.0,
            };
            let tons = tons_per_unit(&unit).map(|factor| value * multiplier * factor);

            Some(Quantity {
                raw: raw.to_string(),
                value,
                multiplier,
                unit,
                tons,
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}
