//! Environment configuration and the locale registry.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shelfsync_core::{CandidateList, Locale, PipelineError};
use shelfsync_keepa::{KeepaConfig, DEFAULT_BASE_URL, DEFAULT_OFFERS};
use shelfsync_storage::products::DEFAULT_RETENTION_DAYS;
use shelfsync_storage::{BackoffPolicy, HttpClientConfig, PgProductStore};
use tokio::fs;
use tracing::warn;

/// Category node of the Italian best-seller list the registry falls back to.
pub const IT_CATEGORY_NODE: u64 = 412_609_031;

#[derive(Clone)]
pub struct SyncConfig {
    pub api_key: Option<String>,
    pub keepa_base_url: String,
    pub database_url: Option<String>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub db_schema: String,
    pub batch_size: usize,
    pub max_asins: usize,
    pub batch_delay: Duration,
    pub retention_days: u32,
    pub offers: u32,
    pub item_concurrency: usize,
    pub tokens_per_product: f64,
    pub http_timeout_secs: u64,
    pub http_retries: usize,
    pub user_agent: String,
    pub artifacts_dir: PathBuf,
    pub log_file: PathBuf,
    pub locales_file: PathBuf,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("keepa_base_url", &self.keepa_base_url)
            .field("db_schema", &self.db_schema)
            .field("batch_size", &self.batch_size)
            .field("max_asins", &self.max_asins)
            .field("batch_delay", &self.batch_delay)
            .field("retention_days", &self.retention_days)
            .field("offers", &self.offers)
            .field("item_concurrency", &self.item_concurrency)
            .field("tokens_per_product", &self.tokens_per_product)
            .field("artifacts_dir", &self.artifacts_dir)
            .field("log_file", &self.log_file)
            .field("locales_file", &self.locales_file)
            .finish_non_exhaustive()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }),
        None => default,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| non_empty(lookup(key));
        Self {
            api_key: get("KEEPA_API_KEY").or_else(|| get("API_KEY")),
            keepa_base_url: get("KEEPA_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            database_url: get("DATABASE_URL").or_else(|| get("DB_URL")),
            db_user: get("DB_USER"),
            db_password: get("DB_PASSWORD"),
            db_schema: get("DB_SCHEMA").unwrap_or_else(|| "public".to_string()),
            batch_size: parsed(&lookup, "SHELFSYNC_BATCH_SIZE", 1usize).max(1),
            max_asins: parsed(&lookup, "SHELFSYNC_MAX_ASINS", CandidateList::DEFAULT_MAX),
            batch_delay: Duration::from_secs(parsed(&lookup, "SHELFSYNC_BATCH_DELAY_SECS", 30u64)),
            retention_days: parsed(&lookup, "SHELFSYNC_RETENTION_DAYS", DEFAULT_RETENTION_DAYS),
            offers: parsed(&lookup, "SHELFSYNC_OFFERS", DEFAULT_OFFERS),
            item_concurrency: parsed(&lookup, "SHELFSYNC_ITEM_CONCURRENCY", 8usize).max(1),
            tokens_per_product: parsed(&lookup, "SHELFSYNC_TOKENS_PER_PRODUCT", 11.4f64),
            http_timeout_secs: parsed(&lookup, "SHELFSYNC_HTTP_TIMEOUT_SECS", 30u64),
            http_retries: parsed(&lookup, "SHELFSYNC_HTTP_RETRIES", 2usize),
            user_agent: get("SHELFSYNC_USER_AGENT").unwrap_or_else(|| "shelfsync/0.1".to_string()),
            artifacts_dir: get("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            log_file: get("SHELFSYNC_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./terminal_output.txt")),
            locales_file: get("SHELFSYNC_LOCALES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./locales.yaml")),
        }
    }

    pub fn api_key(&self) -> Result<&str, PipelineError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| PipelineError::Configuration("KEEPA_API_KEY is not set".into()))
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_retries,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        }
    }

    pub fn keepa_config(&self) -> Result<KeepaConfig, PipelineError> {
        Ok(KeepaConfig {
            api_key: self.api_key()?.to_string(),
            base_url: self.keepa_base_url.clone(),
            http: self.http_config(),
        })
    }

    pub fn pg_store(&self) -> Result<PgProductStore, PipelineError> {
        let url = self
            .database_url
            .as_deref()
            .ok_or_else(|| PipelineError::Configuration("DATABASE_URL (or DB_URL) is not set".into()))?;
        Ok(PgProductStore::new(url, &self.db_schema, self.retention_days)?
            .with_credentials(self.db_user.as_deref(), self.db_password.as_deref()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleEntry {
    pub locale: Locale,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub category_node: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleRegistry {
    pub locales: Vec<LocaleEntry>,
}

impl Default for LocaleRegistry {
    fn default() -> Self {
        Self {
            locales: vec![LocaleEntry {
                locale: Locale::It,
                enabled: true,
                category_node: Some(IT_CATEGORY_NODE),
            }],
        }
    }
}

impl LocaleRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(text)
            .map_err(|err| PipelineError::Configuration(format!("parsing locale registry: {err}")))
    }

    /// Reads the registry file, or falls back to the built-in registry when it does not exist.
    pub async fn load(path: &Path) -> Result<Self, PipelineError> {
        match fs::read_to_string(path).await {
            Ok(text) => Self::from_yaml_str(&text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "locale registry not found; using built-in registry");
                Ok(Self::default())
            }
            Err(err) => Err(PipelineError::Configuration(format!(
                "reading {}: {err}",
                path.display()
            ))),
        }
    }

    pub fn entry(&self, locale: Locale) -> Option<&LocaleEntry> {
        self.locales.iter().find(|e| e.locale == locale)
    }

    pub fn enabled(&self) -> Vec<Locale> {
        self.locales.iter().filter(|e| e.enabled).map(|e| e.locale).collect()
    }

    /// Category root node for `locale`. A disabled or unmapped locale is a configuration error.
    pub fn category_node(&self, locale: Locale) -> Result<u64, PipelineError> {
        let entry = self
            .entry(locale)
            .ok_or_else(|| PipelineError::Configuration(format!("locale {locale} is not registered")))?;
        if !entry.enabled {
            return Err(PipelineError::Configuration(format!("locale {locale} is disabled")));
        }
        entry
            .category_node
            .ok_or_else(|| PipelineError::Configuration(format!("locale {locale} has no category node")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_pipeline_constants() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_asins, 1000);
        assert_eq!(config.batch_delay, Duration::from_secs(30));
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.offers, 40);
        assert_eq!(config.tokens_per_product, 11.4);
        assert_eq!(config.db_schema, "public");
        assert_eq!(config.keepa_base_url, DEFAULT_BASE_URL);
        assert!(config.api_key().is_err());
    }

    #[test]
    fn api_key_falls_back_and_blank_values_are_ignored() {
        let config = SyncConfig::from_lookup(lookup(&[("KEEPA_API_KEY", "  "), ("API_KEY", "abc")]));
        assert_eq!(config.api_key().unwrap(), "abc");
        assert_eq!(config.keepa_config().unwrap().api_key, "abc");
    }

    #[test]
    fn numeric_overrides_and_bad_values() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("SHELFSYNC_BATCH_SIZE", "0"),
            ("SHELFSYNC_MAX_ASINS", "25"),
            ("SHELFSYNC_BATCH_DELAY_SECS", "soon"),
            ("SHELFSYNC_HTTP_RETRIES", "4"),
        ]));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_asins, 25);
        assert_eq!(config.batch_delay, Duration::from_secs(30));
        assert_eq!(config.http_config().backoff.max_retries, 4);
    }

    #[test]
    fn debug_output_redacts_key() {
        let config = SyncConfig::from_lookup(lookup(&[("KEEPA_API_KEY", "topsecret")]));
        assert!(!format!("{config:?}").contains("topsecret"));
    }

    #[test]
    fn pg_store_requires_url_and_valid_schema() {
        assert!(SyncConfig::default().pg_store().is_err());
        let bad_schema = SyncConfig::from_lookup(lookup(&[
            ("DB_URL", "jdbc:postgresql://localhost:5432/catalog"),
            ("DB_SCHEMA", "public; drop"),
        ]));
        assert_eq!(bad_schema.pg_store().unwrap_err().kind(), "ConfigurationError");
    }

    #[test]
    fn registry_parses_and_resolves_nodes() {
        let registry = LocaleRegistry::from_yaml_str(
            r#"
locales:
  - locale: IT
    category_node: 412609031
  - locale: FR
    enabled: false
  - locale: ES
"#,
        )
        .unwrap();
        assert_eq!(registry.enabled(), vec![Locale::It, Locale::Es]);
        assert_eq!(registry.category_node(Locale::It).unwrap(), IT_CATEGORY_NODE);
        assert!(registry.category_node(Locale::Fr).is_err());
        assert!(registry.category_node(Locale::Es).is_err());
        assert!(registry.category_node(Locale::De).is_err());
    }

    #[test]
    fn registry_rejects_unknown_locale() {
        assert!(LocaleRegistry::from_yaml_str("locales:\n  - locale: UK\n").is_err());
    }

    #[tokio::test]
    async fn missing_registry_file_uses_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LocaleRegistry::load(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(registry.category_node(Locale::It).unwrap(), IT_CATEGORY_NODE);
    }
}
