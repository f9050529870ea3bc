use regex::Regex;
use serde::{Deserialize, Serialize};

/// Keyword list for one material category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryKeywords {
    pub category: String,
    pub keywords: Vec<String>,
}

/// Injected, read-only material category table.
///
/// Matching is on whole words (a trailing plural `s`/`es` is accepted) and
/// the longest matching keyword wins, so "fly ash" beats "ash" and
/// "copper" beats "pp". Ties go to the earlier category.
#[derive(Debug, Clone)]
pub struct CategoryTable {
    entries: Vec<CompiledKeyword>,
}

#[derive(Debug, Clone)]
struct CompiledKeyword {
    category: String,
    length: usize,
    pattern: Regex,
}

impl CategoryTable {
    /// # Errors
    ///
    /// Fails only if a keyword produces an invalid pattern after escaping.
    pub fn new(categories: &[CategoryKeywords]) -> Result<Self, regex::Error> {
        let mut entries = Vec::new();
        for group in categories {
            for keyword in &group.keywords {
                let keyword = keyword.trim().to_lowercase();
                if keyword.is_empty() {
                    continue;
                }
                let pattern = Regex::new(&format!(r"(?i)\b{}(?:s|es)?\b", regex::escape(&keyword)))?;
                entries.push(CompiledKeyword {
                    category: group.category.clone(),
                    length: keyword.chars().count(),
                    pattern,
                });
            }
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn categorize(&self, material: &str) -> Option<&str> {
        let mut best: Option<&CompiledKeyword> = None;

        for entry in &self.entries {
            if !entry.pattern.is_match(material) {
                continue;
            }
            if best.is_none_or(|b| entry.length > b.length) {
                best = Some(entry);
            }
        }

        best.map(|entry| entry.category.as_str())
    }

    /// Case-insensitive keyword patterns, longest keyword first.
    pub(crate) fn patterns_longest_first(&self) -> Vec<(&Regex, usize)> {
        let mut keywords: Vec<_> = self.entries.iter().map(|e| (&e.pattern, e.length)).collect();
        keywords.sort_by(|a, b| b.1.cmp(&a.1));
        keywords
    }

    #[must_use]
    pub fn builtin_keywords() -> Vec<CategoryKeywords> {
        let table: &[(&str, &[&str])] = &[
            (
                "metals",
                &[
                    "steel", "iron", "copper", "aluminum", "aluminium", "brass", "zinc", "nickel",
                    "lead", "tin", "scrap metal", "ferrous", "non-ferrous", "alloy", "stainless",
                ],
            ),
            (
                "plastics",
                &[
                    "plastic", "polymer", "pet", "hdpe", "ldpe", "pvc", "pp", "polypropylene",
                    "polyethylene", "polystyrene", "abs",
                ],
            ),
            (
                "organics",
                &[
                    "organic", "biomass", "food waste", "compost", "agricultural", "wood", "paper",
                    "cardboard", "cellulose",
                ],
            ),
            (
                "chemicals",
                &[
                    "chemical", "solvent", "acid", "alkali", "caustic", "sulfur", "sulphur",
                    "chlorine", "ammonia",
                ],
            ),
            (
                "energy",
                &["steam", "heat", "energy", "power", "electricity", "gas", "fuel", "oil", "coal"],
            ),
            ("water", &["water", "wastewater", "effluent", "sewage", "coolant"]),
            (
                "construction",
                &[
                    "concrete", "cement", "aggregate", "sand", "gravel", "gypsum", "slag",
                    "fly ash", "ash",
                ],
            ),
        ];

        table
            .iter()
            .map(|(category, keywords)| CategoryKeywords {
                category: (*category).to_string(),
                keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
            })
            .collect()
    }
}

impl Default for CategoryTable {
    fn default() -> Self {
        // Built-in keywords are plain words; escaping cannot fail on them.
        Self::new(&Self::builtin_keywords()).unwrap_or(Self { entries: Vec::new() })
    }
}
