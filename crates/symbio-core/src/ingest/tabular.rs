use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::categories::CategoryTable;
use super::normalizer::decode_bytes;
use super::units::{parse_number, to_tons};
use super::validation::FactCandidate;
use crate::fact::{FactData, Measurement, WasteEvent};

const MAX_CITATION_CHARS: usize = 500;

/// Header list that no profile recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct SchemaError {
    pub headers: Vec<String>,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no schema profile matches headers [{}]", self.headers.join(", "))
    }
}

#[derive(Debug, Error)]
pub enum TabularError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("File has no header row")]
    Empty,
}

/// What happened to a material once reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fate {
    Recycled,
    EnergyRecovery,
    Treated,
    Released,
}

impl Fate {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Recycled => "Recycled",
            Self::EnergyRecovery => "Energy Recovery",
            Self::Treated => "Treated",
            Self::Released => "Disposal/Released",
        }
    }

    pub const ALL: [Self; 4] = [Self::Recycled, Self::EnergyRecovery, Self::Treated, Self::Released];
}

/// Canonical column a header alias can map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Entity,
    Substance,
    Unit,
    Year,
    Location,
    Recycled,
    EnergyRecovery,
    Treated,
    Released,
}

impl CanonicalField {
    #[must_use]
    pub const fn fate(fate: Fate) -> Self {
        match fate {
            Fate::Recycled => Self::Recycled,
            Fate::EnergyRecovery => Self::EnergyRecovery,
            Fate::Treated => Self::Treated,
            Fate::Released => Self::Released,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnAliases {
    pub field: CanonicalField,
    pub aliases: Vec<String>,
}

/// Header vocabulary of one reporting authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaProfile {
    pub name: String,
    /// Unit assumed when a row has no unit column or an empty unit cell
    pub default_unit: String,
    /// Location assumed when a row has no location column
    #[serde(default)]
    pub default_location: Option<String>,
    pub columns: Vec<ColumnAliases>,
}

impl SchemaProfile {
    fn new(name: &str, default_unit: &str, default_location: Option<&str>, columns: &[(CanonicalField, &[&str])]) -> Self {
        Self {
            name: name.to_string(),
            default_unit: default_unit.to_string(),
            default_location: default_location.map(String::from),
            columns: columns
                .iter()
                .map(|(field, aliases)| ColumnAliases {
                    field: *field,
                    aliases: aliases.iter().map(|a| (*a).to_string()).collect(),
                })
                .collect(),
        }
    }

    /// US EPA Toxics Release Inventory, EU E-PRTR, and a generic layout
    /// for smaller national portals, in that order.
    #[must_use]
    pub fn builtin() -> Vec<Self> {
        use CanonicalField as F;

        vec![
            Self::new(
                "epa_tri",
                "pounds",
                Some("USA"),
                &[
                    (F::Entity, &["4. FACILITY NAME", "FACILITY NAME", "FACILITY_NAME"]),
                    (F::Substance, &["37. CHEMICAL", "CHEMICAL", "CHEMICAL_NAME"]),
                    (F::Unit, &["50. UNIT OF MEASURE", "UNIT OF MEASURE", "UNIT"]),
                    (F::Year, &["1. YEAR", "YEAR", "REPORTING_YEAR"]),
                    (F::Location, &["8. ST", "ST", "STATE"]),
                    (
                        F::Recycled,
                        &["94. OFF-SITE RECYCLED TOTAL", "115. 8.4 - RECYCLING ON SITE", "116. 8.5 - RECYCLING OFF SIT"],
                    ),
                    (
                        F::EnergyRecovery,
                        &["97. OFF-SITE ENERGY RECOVERY T", "113. 8.2 - ENERGY RECOVER ON", "114. 8.3 - ENERGY RECOVER OF"],
                    ),
                    (
                        F::Treated,
                        &["104. OFF-SITE TREATED TOTAL", "117. 8.6 - TREATMENT ON SITE", "118. 8.7 - TREATMENT OFF SITE"],
                    ),
                    (
                        F::Released,
                        &["107. TOTAL RELEASES", "65. ON-SITE RELEASE TOTAL", "88. OFF-SITE RELEASE TOTAL"],
                    ),
                ],
            ),
            Self::new(
                "eprtr",
                "tonnes",
                Some("Europe"),
                &[
                    (F::Entity, &["FacilityName", "Facility Name", "Facility", "facilityName"]),
                    (
                        F::Substance,
                        &["Pollutant", "PollutantName", "Pollutant Name", "wasteClassification", "wasteTreatment"],
                    ),
                    (F::Unit, &["UnitCode", "Unit", "UnitOfMeasure"]),
                    (F::Year, &["ReportingYear", "Year", "ReferenceYear"]),
                    (
                        F::Location,
                        &["CountryCode", "CountryName", "Country", "MemberStateName", "NutRegionName", "city"],
                    ),
                    (
                        F::Released,
                        &[
                            "Releases",
                            "transfers",
                            "wasteTransfers",
                            "TotalQuantity",
                            "quantity",
                            "TotalRelease",
                            "ReleaseQuantity",
                            "totalWasteQuantity",
                        ],
                    ),
                ],
            ),
            Self::new(
                "generic",
                "pounds",
                None,
                &[
                    (F::Entity, &["Company", "Facility", "Organization", "Entity", "Source", "Generator"]),
                    (F::Substance, &["Material", "Waste Type", "Waste", "Pollutant", "Item", "Description"]),
                    (F::Unit, &["Unit", "UOM", "Measure"]),
                    (F::Year, &["Year", "Date", "Period"]),
                    (F::Location, &["Country", "Emirate", "City", "Location", "Region"]),
                    (F::Released, &["Amount", "Quantity", "Weight", "Volume", "Total", "Tons", "Kg"]),
                ],
            ),
        ]
    }
}

/// A profile resolved against a concrete header row.
#[derive(Debug, Clone)]
pub struct ProfileMatch<'a> {
    pub profile: &'a SchemaProfile,
    pub columns: HashMap<CanonicalField, usize>,
}

impl ProfileMatch<'_> {
    #[must_use]
    pub fn matched_fields(&self) -> usize {
        self.columns.len()
    }

    fn cell<'r>(&self, row: &'r [&str], field: CanonicalField) -> Option<&'r str> {
        self.columns
            .get(&field)
            .and_then(|&i| row.get(i))
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabularConfig {
    /// Rows read per file before the rest is ignored
    pub max_rows: usize,
    /// Canonical fields a profile must recognise to be selected
    pub min_matched_fields: usize,
}

impl Default for TabularConfig {
    fn default() -> Self {
        Self {
            max_rows: 10_000,
            min_matched_fields: 3,
        }
    }
}

/// A fate value in a row that produced no candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedValue {
    pub fate: Fate,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct RowOutcome {
    pub candidates: Vec<FactCandidate>,
    pub skipped: Vec<SkippedValue>,
}

#[derive(Debug)]
pub struct TabularOutcome {
    pub profile: String,
    pub candidates: Vec<FactCandidate>,
    pub rows_read: usize,
    pub rows_without_subject: usize,
    pub malformed_rows: usize,
    pub values_skipped: usize,
    /// The row cap was hit before the end of the file.
    pub truncated: bool,
}

/// Reconciles bulk exports with differing headers into fact candidates.
pub struct TabularParser {
    profiles: Vec<SchemaProfile>,
    categories: CategoryTable,
    config: TabularConfig,
}

impl TabularParser {
    #[must_use]
    pub fn new(profiles: Vec<SchemaProfile>, categories: CategoryTable, config: TabularConfig) -> Self {
        Self {
            profiles,
            categories,
            config,
        }
    }

    #[must_use]
    pub fn profiles(&self) -> &[SchemaProfile] {
        &self.profiles
    }

    /// Picks the profile recognising the most canonical fields; ties go to
    /// the earlier profile.
    #[must_use]
    pub fn detect_profile(&self, headers: &[&str]) -> Option<ProfileMatch<'_>> {
        let normalized: Vec<String> = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
            .collect();

        let mut best: Option<ProfileMatch<'_>> = None;
        for profile in &self.profiles {
            let mut columns = HashMap::new();
            for group in &profile.columns {
                let index = group.aliases.iter().find_map(|alias| {
                    let alias = alias.trim().to_lowercase();
                    normalized.iter().position(|h| *h == alias)
                });
                if let Some(index) = index {
                    columns.entry(group.field).or_insert(index);
                }
            }

            let candidate = ProfileMatch { profile, columns };
            if best
                .as_ref()
                .is_none_or(|b| candidate.matched_fields() > b.matched_fields())
            {
                best = Some(candidate);
            }
        }

        best.filter(|m| m.matched_fields() >= self.config.min_matched_fields)
    }

    /// Turns one data row into zero or more candidates, one per fate
    /// column carrying a positive amount.
    #[must_use]
    pub fn parse_row(&self, row: &[&str], matched: &ProfileMatch<'_>) -> RowOutcome {
        let mut outcome = RowOutcome::default();

        let (Some(entity), Some(substance)) = (
            matched.cell(row, CanonicalField::Entity),
            matched.cell(row, CanonicalField::Substance),
        ) else {
            return outcome;
        };

        let profile = matched.profile;
        let unit = matched
            .cell(row, CanonicalField::Unit)
            .unwrap_or(&profile.default_unit);
        let year_raw = matched.cell(row, CanonicalField::Year);
        let year = year_raw.and_then(parse_year);
        let location = matched
            .cell(row, CanonicalField::Location)
            .map(String::from)
            .or_else(|| profile.default_location.clone());
        let category = self.categories.categorize(substance).map(String::from);

        for fate in Fate::ALL {
            let Some(raw) = matched.cell(row, CanonicalField::fate(fate)) else {
                continue;
            };

            let value = match parse_number(raw) {
                Some(v) if v > 0.0 => v,
                Some(_) => continue,
                None => {
                    outcome.skipped.push(SkippedValue {
                        fate,
                        reason: format!("unparseable amount {raw:?}"),
                    });
                    continue;
                }
            };

            let tons = match to_tons(value, unit) {
                Ok(tons) => tons,
                Err(e) => {
                    outcome.skipped.push(SkippedValue {
                        fate,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let mut citation = format!("{entity} {} {raw} {unit} of {substance}", fate.label());
            if let Some(year_raw) = year_raw {
                citation.push_str(" in ");
                citation.push_str(year_raw);
            }
            if citation.chars().count() > MAX_CITATION_CHARS {
                citation = citation.chars().take(MAX_CITATION_CHARS).collect();
            }

            let data = FactData::WasteEvent(WasteEvent {
                material: substance.to_string(),
                category: category.clone(),
                quantity: Some(Measurement::new(tons, value, unit)),
                company: Some(entity.to_string()),
                location: location.clone(),
                year,
                treatment: Some(fate.label().to_string()),
            });

            outcome.candidates.push(FactCandidate::from_row(data, citation));
        }

        outcome
    }

    /// Parses a whole delimited file.
    ///
    /// # Errors
    ///
    /// [`TabularError::Schema`] when no profile matches the header row;
    /// nothing is extracted from such files.
    pub fn parse(&self, bytes: &[u8]) -> Result<TabularOutcome, TabularError> {
        let text = decode_bytes(bytes);
        let delimiter = sniff_delimiter(&text);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .has_headers(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(TabularError::Empty);
        }
        let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();

        let matched = self.detect_profile(&header_refs).ok_or_else(|| SchemaError {
            headers: headers.clone(),
        })?;
        debug!(
            profile = %matched.profile.name,
            matched = matched.matched_fields(),
            "schema profile selected"
        );

        let mut outcome = TabularOutcome {
            profile: matched.profile.name.clone(),
            candidates: Vec::new(),
            rows_read: 0,
            rows_without_subject: 0,
            malformed_rows: 0,
            values_skipped: 0,
            truncated: false,
        };

        for record in reader.records() {
            if outcome.rows_read >= self.config.max_rows {
                outcome.truncated = true;
                warn!(max_rows = self.config.max_rows, "row cap reached, rest of file ignored");
                break;
            }
            outcome.rows_read += 1;

            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    outcome.malformed_rows += 1;
                    debug!(error = %e, row = outcome.rows_read, "skipping malformed row");
                    continue;
                }
            };

            let row: Vec<&str> = record.iter().collect();
            let row_outcome = self.parse_row(&row, &matched);
            if row_outcome.candidates.is_empty() && row_outcome.skipped.is_empty() {
                outcome.rows_without_subject += 1;
            }
            for skipped in &row_outcome.skipped {
                debug!(fate = ?skipped.fate, reason = %skipped.reason, "value skipped");
            }
            outcome.values_skipped += row_outcome.skipped.len();
            outcome.candidates.extend(row_outcome.candidates);
        }

        Ok(outcome)
    }
}

impl Default for TabularParser {
    fn default() -> Self {
        Self::new(SchemaProfile::builtin(), CategoryTable::default(), TabularConfig::default())
    }
}

fn parse_year(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    raw.parse::<i32>()
        .ok()
        .or_else(|| raw.get(..4).and_then(|y| y.parse().ok()))
}

fn sniff_delimiter(text: &str) -> u8 {
    let first_line = text.lines().next().unwrap_or_default();
    [b',', b';', b'\t', b'|']
        .into_iter()
        .map(|d| (d, first_line.matches(char::from(d)).count()))
        .fold((b',', 0), |best, (d, count)| if count > best.1 { (d, count) } else { best })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::CitationKind;
    use crate::ingest::validation::Validator;

    const TRI_CSV: &str = "1. YEAR,4. FACILITY NAME,8. ST,37. CHEMICAL,50. UNIT OF MEASURE,94. OFF-SITE RECYCLED TOTAL,104. OFF-SITE TREATED TOTAL,107. TOTAL RELEASES\n\
2022,Acme Smelter,OH,LEAD,Pounds,\"2,000\",0,<500\n\
2022,,OH,ZINC,Pounds,100,0,0\n\
2022,Globex Plant,TX,COPPER,Grams,1000000,n/a,0\n";

    #[test]
    fn test_detect_profile_requires_three_fields() {
        let parser = TabularParser::default();

        let matched = parser
            .detect_profile(&["Company", "Material", "Quantity", "Notes"])
            .expect("generic profile");
        assert_eq!(matched.profile.name, "generic");
        assert_eq!(matched.matched_fields(), 3);

        assert!(parser.detect_profile(&["Company", "Notes", "Remarks"]).is_none());
    }

    #[test]
    fn test_detect_profile_is_case_insensitive_and_bom_tolerant() {
        let parser = TabularParser::default();

        let matched = parser
            .detect_profile(&["\u{feff}facilityname", "POLLUTANT", "reportingyear", "Releases"])
            .unwrap();

        assert_eq!(matched.profile.name, "eprtr");
    }

    #[test]
    fn test_detect_profile_picks_highest_count() {
        let parser = TabularParser::default();
        let headers: Vec<&str> = TRI_CSV.lines().next().unwrap().split(',').collect();

        let matched = parser.detect_profile(&headers).unwrap();

        assert_eq!(matched.profile.name, "epa_tri");
        assert_eq!(matched.matched_fields(), 8);
    }

    #[test]
    fn test_parse_row_one_candidate_per_positive_fate() {
        let parser = TabularParser::default();
        let headers: Vec<&str> = TRI_CSV.lines().next().unwrap().split(',').collect();
        let matched = parser.detect_profile(&headers).unwrap();
        let row = ["2022", "Acme Smelter", "OH", "LEAD", "Pounds", "2,000", "0", "<500"];

        let outcome = parser.parse_row(&row, &matched);

        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(
            outcome.candidates[0].citation(),
            Some("Acme Smelter Recycled 2,000 Pounds of LEAD in 2022")
        );
        assert_eq!(
            outcome.candidates[1].citation(),
            Some("Acme Smelter Disposal/Released <500 Pounds of LEAD in 2022")
        );
        let FactData::WasteEvent(event) = outcome.candidates[0].data() else {
            panic!("expected waste event");
        };
        assert!((event.quantity.as_ref().unwrap().tons - 0.907_184).abs() < 1e-6);
        assert_eq!(event.location.as_deref(), Some("OH"));
        assert_eq!(event.category.as_deref(), Some("metals"));
    }

    #[test]
    fn test_parse_row_without_entity_yields_nothing() {
        let parser = TabularParser::default();
        let matched = parser.detect_profile(&["Company", "Material", "Quantity"]).unwrap();

        let outcome = parser.parse_row(&["", "Slag", "40"], &matched);

        assert!(outcome.candidates.is_empty());
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn test_parse_row_unknown_unit_is_skipped_not_guessed() {
        let parser = TabularParser::default();
        let matched = parser
            .detect_profile(&["Company", "Material", "Quantity", "Unit"])
            .unwrap();

        let outcome = parser.parse_row(&["Acme", "Coolant", "40", "barrels"], &matched);

        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.skipped.len(), 1);
        assert!(outcome.skipped[0].reason.contains("barrels"));
    }

    #[test]
    fn test_parse_file() {
        let parser = TabularParser::default();

        let outcome = parser.parse(TRI_CSV.as_bytes()).unwrap();

        assert_eq!(outcome.profile, "epa_tri");
        assert_eq!(outcome.rows_read, 3);
        assert_eq!(outcome.rows_without_subject, 1);
        assert_eq!(outcome.values_skipped, 1);
        assert_eq!(outcome.candidates.len(), 3);
        assert!(!outcome.truncated);

        let validator = Validator::default();
        let results = validator.validate_all(outcome.candidates, "");
        assert!(results.iter().all(|r| r.is_accepted()));
        assert!(results
            .iter()
            .filter_map(|r| r.fact())
            .all(|f| f.citation().kind == CitationKind::RowDerived && (f.confidence() - 1.0).abs() < f64::EPSILON));
    }

    #[test]
    fn test_parse_file_semicolon_delimited() {
        let parser = TabularParser::default();
        let csv = "FacilityName;Pollutant;ReportingYear;Releases;Unit\nStahlwerk Nord;Zinc;2020;12,5;t\n";

        let outcome = parser.parse(csv.as_bytes()).unwrap();

        assert_eq!(outcome.profile, "eprtr");
        assert_eq!(outcome.candidates.len(), 1);
    }

    #[test]
    fn test_parse_file_unknown_schema() {
        let parser = TabularParser::default();

        let err = parser.parse(b"alpha,beta,gamma\n1,2,3\n").unwrap_err();

        let TabularError::Schema(schema) = err else {
            panic!("expected schema error");
        };
        assert_eq!(schema.headers, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_parse_file_row_cap() {
        let parser = TabularParser::new(
            SchemaProfile::builtin(),
            CategoryTable::default(),
            TabularConfig {
                max_rows: 2,
                ..Default::default()
            },
        );
        let csv = "Company,Material,Quantity\nA,Slag,1\nB,Slag,2\nC,Slag,3\n";

        let outcome = parser.parse(csv.as_bytes()).unwrap();

        assert!(outcome.truncated);
        assert_eq!(outcome.rows_read, 2);
        assert_eq!(outcome.candidates.len(), 2);
    }

    #[test]
    fn test_profiles_load_from_json() {
        let json = r#"[{"name": "uae", "default_unit": "tonnes", "columns": [
            {"field": "entity", "aliases": ["Emirate Entity"]},
            {"field": "substance", "aliases": ["Waste Stream"]},
            {"field": "released", "aliases": ["Tonnage"]}
        ]}]"#;
        let profiles: Vec<SchemaProfile> = serde_json::from_str(json).unwrap();
        let parser = TabularParser::new(profiles, CategoryTable::default(), TabularConfig::default());

        let outcome = parser
            .parse(b"Emirate Entity,Waste Stream,Tonnage\nDubai Municipality,Glass,1200\n")
            .unwrap();

        assert_eq!(outcome.profile, "uae");
        assert_eq!(outcome.candidates.len(), 1);
    }
}
