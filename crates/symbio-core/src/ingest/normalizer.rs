use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use super::categories::CategoryTable;
use super::html;
use super::units::{self, Quantity};
use crate::document::DocumentType;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("PDF text extraction failed: {0}")]
    Pdf(String),
}

pub type NormalizeResult<T> = Result<T, NormalizeError>;

/// Windows-1252 code points for bytes `0x80..=0x9F`; `None` marks holes.
const CP1252_HIGH: [Option<char>; 32] = [
    Some('\u{20ac}'), None, Some('\u{201a}'), Some('\u{0192}'),
    Some('\u{201e}'), Some('\u{2026}'), Some('\u{2020}'), Some('\u{2021}'),
    Some('\u{02c6}'), Some('\u{2030}'), Some('\u{0160}'), Some('\u{2039}'),
    Some('\u{0152}'), None, Some('\u{017d}'), None,
    None, Some('\u{2018}'), Some('\u{2019}'), Some('\u{201c}'),
    Some('\u{201d}'), Some('\u{2022}'), Some('\u{2013}'), Some('\u{2014}'),
    Some('\u{02dc}'), Some('\u{2122}'), Some('\u{0161}'), Some('\u{203a}'),
    Some('\u{0153}'), None, Some('\u{017e}'), Some('\u{0178}'),
];

static MOJIBAKE_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        "[\u{80}-\u{ff}\u{152}\u{153}\u{160}\u{161}\u{178}\u{17d}\u{17e}\u{192}\u{2c6}\u{2dc}\u{2013}\u{2014}\u{2018}-\u{201a}\u{201c}-\u{201e}\u{2020}-\u{2022}\u{2026}\u{2030}\u{2039}\u{203a}\u{20ac}\u{2122}]{2,}",
    )
    .expect("mojibake regex")
});

static BOILERPLATE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?im)(?:we use cookies|this (?:site|website) uses cookies|cookie policy|accept (?:all )?cookies)[^.\n]*\.?",
        r"(?i)skip to (?:main )?content|jump to navigation|back to top",
        r"(?im)^[ \t]*(?:follow us on|share (?:this|on)|like us on facebook)\b[^\n]{0,40}$",
        r"(?i)all rights reserved\.?|©\s*\d{4}|privacy policy\s*\|\s*terms(?: of (?:use|service))?",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("boilerplate regex"))
    .collect()
});

static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").expect("spaces regex"));
static LINE_EDGES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" *\n *").expect("line edge regex"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank line regex"));

/// Best match for a name against a registry of known entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedName {
    pub name: String,
    pub score: f64,
}

/// Fuzzy entity resolution on token-sorted names.
///
/// Word order and punctuation are ignored ("Steel Co, Acme" matches "Acme
/// Steel Co") before a normalized Levenshtein similarity is taken.
pub struct FuzzyMatchResolver {
    threshold: f64,
}

impl FuzzyMatchResolver {
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    fn token_sorted(name: &str) -> String {
        let lowered = name.to_lowercase();
        let mut tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        tokens.sort_unstable();
        tokens.join(" ")
    }

    #[must_use]
    pub fn similarity(a: &str, b: &str) -> f64 {
        strsim::normalized_levenshtein(&Self::token_sorted(a), &Self::token_sorted(b))
    }

    /// Returns the best known name clearing the threshold, or `name` itself
    /// with a score of zero.
    #[must_use]
    pub fn resolve(&self, name: &str, known: &[String]) -> ResolvedName {
        let best = known
            .iter()
            .map(|candidate| (candidate, Self::similarity(name, candidate)))
            .filter(|(_, score)| *score >= self.threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((candidate, score)) => ResolvedName {
                name: candidate.clone(),
                score,
            },
            None => ResolvedName {
                name: name.to_string(),
                score: 0.0,
            },
        }
    }
}

impl Default for FuzzyMatchResolver {
    fn default() -> Self {
        Self::new(0.85)
    }
}

/// Turns raw document bytes into clean text and canonical values.
pub struct ContentNormalizer {
    categories: CategoryTable,
    seen: HashSet<String>,
}

impl ContentNormalizer {
    #[must_use]
    pub fn new(categories: CategoryTable) -> Self {
        Self {
            categories,
            seen: HashSet::new(),
        }
    }

    #[must_use]
    pub const fn categories(&self) -> &CategoryTable {
        &self.categories
    }

    /// Extracts readable text from raw bytes of the given type.
    ///
    /// # Errors
    ///
    /// Fails when a PDF has no extractable text layer or cannot be parsed.
    pub fn clean(&self, raw: &[u8], document_type: DocumentType) -> NormalizeResult<String> {
        let text = match document_type {
            DocumentType::WebText => {
                let markup = decode_bytes(raw);
                let stripped = html::strip_noise(&markup);
                let text = html::main_text(&stripped);
                if text.trim().is_empty() {
                    html::strip_tags(&stripped)
                } else {
                    text
                }
            }
            // The PDF parser can panic on malformed input.
            DocumentType::Pdf => std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(raw))
                .map_err(|_| NormalizeError::Pdf("parser panicked on malformed input".into()))?
                .map_err(|e| NormalizeError::Pdf(e.to_string()))?,
            DocumentType::Tabular | DocumentType::Raw => decode_bytes(raw),
        };

        Ok(clean_text(&text))
    }

    /// Same pipeline as [`clean_text`], exposed on the normalizer.
    #[must_use]
    pub fn clean_text(&self, text: &str) -> String {
        clean_text(text)
    }

    #[must_use]
    pub fn extract_quantities(&self, text: &str) -> Vec<Quantity> {
        units::extract_quantities(text)
    }

    #[must_use]
    pub fn categorize(&self, material: &str) -> Option<&str> {
        self.categories.categorize(material)
    }

    #[must_use]
    pub fn resolve_entity(&self, name: &str, known: &[String], threshold: f64) -> ResolvedName {
        FuzzyMatchResolver::new(threshold).resolve(name, known)
    }

    /// Remembers a hash of `text`; true if the same text was seen before.
    pub fn is_duplicate(&mut self, text: &str) -> bool {
        let hash = hex::encode(Sha256::digest(text.as_bytes()));
        !self.seen.insert(hash)
    }
}

impl Default for ContentNormalizer {
    fn default() -> Self {
        Self::new(CategoryTable::default())
    }
}

/// Repairs encoding damage, drops boilerplate phrases, and canonicalizes
/// Unicode, punctuation and whitespace.
#[must_use]
pub fn clean_text(text: &str) -> String {
    let mut text = repair_mojibake(text);

    for pattern in BOILERPLATE.iter() {
        if pattern.is_match(&text) {
            text = pattern.replace_all(&text, "").into_owned();
        }
    }

    let text: String = text.nfc().collect();

    let text = text
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2013}', '\u{2014}'], "-")
        .replace('\u{2026}', "...")
        .replace('\u{a0}', " ")
        .replace(['\u{feff}', '\u{200b}'], "")
        .replace("\r\n", "\n")
        .replace(['\r', '\t'], " ");

    let text: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect();

    let text = SPACES.replace_all(&text, " ");
    let text = LINE_EDGES.replace_all(&text, "\n");
    let text = BLANK_LINES.replace_all(&text, "\n\n");

    text.trim().to_string()
}

/// UTF-8 when valid, otherwise Windows-1252.
#[must_use]
pub fn decode_bytes(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => text.to_string(),
        Err(_) => raw
            .iter()
            .map(|&b| match b {
                0x80..=0x9f => CP1252_HIGH[usize::from(b - 0x80)].unwrap_or('\u{fffd}'),
                _ => char::from(b),
            })
            .collect(),
    }
}

fn cp1252_byte(c: char) -> Option<u8> {
    let code = u32::from(c);
    if code < 0x80 || (0x80..=0xff).contains(&code) {
        return u8::try_from(code).ok();
    }
    CP1252_HIGH
        .iter()
        .position(|entry| *entry == Some(c))
        .and_then(|i| u8::try_from(0x80 + i).ok())
}

/// Undoes UTF-8 text that was decoded as Windows-1252 somewhere upstream
/// ("â€™" back to "’"). Runs that do not round-trip are left alone.
fn repair_mojibake(text: &str) -> String {
    MOJIBAKE_RUN
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let run = &caps[0];
            let bytes: Option<Vec<u8>> = run.chars().map(cp1252_byte).collect();
            bytes
                .and_then(|b| String::from_utf8(b).ok())
                .unwrap_or_else(|| run.to_string())
        })
        .into_owned()
}
