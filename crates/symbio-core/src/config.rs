use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fetch::{FetchConfig, FetchConfigError};
use crate::ingest::{
    CategoryKeywords, CategoryTable, OrchestratorConfig, SchemaProfile, TabularConfig,
    ValidationBounds,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid value for {name}: {value:?}")]
    InvalidVar { name: &'static str, value: String },
    #[error(transparent)]
    Fetch(#[from] FetchConfigError),
    #[error("Invalid category keyword: {0}")]
    Category(#[from] regex::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Where documents, facts and raw bytes live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file
    pub database_path: String,
    /// Root of the content-addressed raw store
    pub raw_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "symbio.db".to_string(),
            raw_dir: PathBuf::from("data/raw"),
        }
    }
}

const fn default_model_timeout() -> u64 {
    60
}

/// OpenAI-compatible endpoint used when the rules find nothing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: u64,
}

/// Everything the daemon needs, loadable from JSON or `SYMBIO_*` variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fetch: FetchConfig,
    pub orchestrator: OrchestratorConfig,
    pub validation: ValidationBounds,
    pub tabular: TabularConfig,
    pub storage: StorageConfig,
    pub model: Option<ModelConfig>,
    /// JSON list of extra schema profiles; built-ins when unset
    pub profiles_path: Option<PathBuf>,
    /// JSON category keyword table; built-ins when unset
    pub categories_path: Option<PathBuf>,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidVar { name, value })
}

impl EngineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }

    /// Reads `SYMBIO_CONFIG` (a JSON file) if set, then applies the
    /// individual `SYMBIO_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("SYMBIO_CONFIG") {
            Some(path) => Self::from_json_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(v) = lookup("SYMBIO_DB") {
            config.storage.database_path = v;
        }
        if let Some(v) = lookup("SYMBIO_RAW_DIR") {
            config.storage.raw_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SYMBIO_BATCH_SIZE") {
            config.orchestrator.batch_size = parse_var("SYMBIO_BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("SYMBIO_IDLE_SECONDS") {
            let seconds: u64 = parse_var("SYMBIO_IDLE_SECONDS", v)?;
            config.orchestrator.idle_interval_ms = seconds.saturating_mul(1000);
        }
        if let Some(v) = lookup("SYMBIO_SOURCE") {
            config.orchestrator.source = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("SYMBIO_STALE_CLAIM_SECONDS") {
            config.orchestrator.stale_claim_after_seconds =
                Some(parse_var("SYMBIO_STALE_CLAIM_SECONDS", v)?);
        }
        if let Some(v) = lookup("SYMBIO_FETCH_WORKERS") {
            config.fetch.workers = parse_var("SYMBIO_FETCH_WORKERS", v)?;
        }
        if let Some(v) = lookup("SYMBIO_FETCH_DELAY_MS") {
            config.fetch.min_delay_ms = parse_var("SYMBIO_FETCH_DELAY_MS", v)?;
        }
        if let Some(v) = lookup("SYMBIO_MAX_RETRIES") {
            config.fetch.max_retries = parse_var("SYMBIO_MAX_RETRIES", v)?;
        }
        if let Some(v) = lookup("SYMBIO_PROFILES") {
            config.profiles_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SYMBIO_CATEGORIES") {
            config.categories_path = Some(PathBuf::from(v));
        }
        if let Some(base_url) = lookup("SYMBIO_MODEL_URL") {
            config.model = Some(ModelConfig {
                base_url,
                model: lookup("SYMBIO_MODEL_NAME").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                api_key: lookup("SYMBIO_MODEL_API_KEY"),
                timeout_seconds: default_model_timeout(),
            });
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fetch.validate()?;

        if self.orchestrator.batch_size == 0 {
            return Err(ConfigError::Invalid("batch size must be positive".into()));
        }
        if self.orchestrator.search_min_chars > self.orchestrator.search_max_chars {
            return Err(ConfigError::Invalid(
                "search_min_chars exceeds search_max_chars".into(),
            ));
        }
        if self.validation.min_year > self.validation.effective_max_year() {
            return Err(ConfigError::Invalid("min_year is after max_year".into()));
        }
        if self.tabular.max_rows == 0 || self.tabular.min_matched_fields == 0 {
            return Err(ConfigError::Invalid(
                "tabular max_rows and min_matched_fields must be positive".into(),
            ));
        }
        if let Some(model) = &self.model {
            if model.base_url.trim().is_empty() || model.timeout_seconds == 0 {
                return Err(ConfigError::Invalid(
                    "model endpoint needs a base URL and a timeout".into(),
                ));
            }
        }
        Ok(())
    }

    /// Built-in profiles followed by any loaded from `profiles_path`.
    pub fn schema_profiles(&self) -> Result<Vec<SchemaProfile>, ConfigError> {
        let mut profiles = SchemaProfile::builtin();
        if let Some(path) = &self.profiles_path {
            let extra: Vec<SchemaProfile> = read_json(path)?;
            profiles.extend(extra);
        }
        Ok(profiles)
    }

    pub fn category_table(&self) -> Result<CategoryTable, ConfigError> {
        let keywords = match &self.categories_path {
            Some(path) => read_json::<Vec<CategoryKeywords>>(path)?,
            None => CategoryTable::builtin_keywords(),
        };
        Ok(CategoryTable::new(&keywords)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("SYMBIO_DB", "/var/lib/symbio.db"),
            ("SYMBIO_BATCH_SIZE", "25"),
            ("SYMBIO_IDLE_SECONDS", "5"),
            ("SYMBIO_SOURCE", "epa"),
            ("SYMBIO_MODEL_URL", "http://localhost:11434/v1"),
        ]))
        .unwrap();

        assert_eq!(config.storage.database_path, "/var/lib/symbio.db");
        assert_eq!(config.orchestrator.batch_size, 25);
        assert_eq!(config.orchestrator.idle_interval_ms, 5000);
        assert_eq!(config.orchestrator.source.as_deref(), Some("epa"));
        assert_eq!(config.model.unwrap().timeout_seconds, 60);
    }

    #[test]
    fn test_env_rejects_garbage_numbers() {
        let err = EngineConfig::from_lookup(lookup(&[("SYMBIO_BATCH_SIZE", "ten")])).unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidVar {
                name: "SYMBIO_BATCH_SIZE",
                ..
            }
        ));
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let mut config = EngineConfig::default();
        config.fetch.backoff_factor = 0.5;

        assert!(matches!(config.validate(), Err(ConfigError::Fetch(_))));
    }

    #[test]
    fn test_from_json_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"orchestrator": {{"batch_size": 3}}, "tabular": {{"max_rows": 50}}}}"#
        )
        .unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();

        assert_eq!(config.orchestrator.batch_size, 3);
        assert_eq!(config.tabular.max_rows, 50);
        assert_eq!(config.tabular.min_matched_fields, 3);
        assert_eq!(config.fetch.max_retries, 3);
    }

    #[test]
    fn test_extra_profiles_append_to_builtins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name": "uae", "default_unit": "tonnes", "columns": []}}]"#
        )
        .unwrap();
        let config = EngineConfig {
            profiles_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        let profiles = config.schema_profiles().unwrap();

        assert_eq!(profiles.first().unwrap().name, "epa_tri");
        assert_eq!(profiles.last().unwrap().name, "uae");
    }

    #[test]
    fn test_missing_categories_file() {
        let config = EngineConfig {
            categories_path: Some(PathBuf::from("/nonexistent/categories.json")),
            ..Default::default()
        };

        assert!(matches!(config.category_table(), Err(ConfigError::Io { .. })));
    }
}
