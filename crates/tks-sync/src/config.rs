use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tks_adapters::{CrawlPacing, DetailCooldown, DetailFailurePolicy, SearchQuery, SourceKind};
use tks_storage::{HttpClientConfig, TableNames};
use tracing::debug;

/// Process-wide settings, read once from the environment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_mode: SourceKind,
    /// Pauses between HTML listing pages and between HTML detail pages.
    pub html_page_delay_ms: u64,
    pub html_detail_delay_ms: u64,
    pub vacancies_limit: usize,
    pub detail_cooldown_every: usize,
    pub detail_cooldown_secs: u64,
    pub detail_failure_policy: DetailFailurePolicy,
    pub registry_workers: usize,
    pub registry_max_files: Option<usize>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub tables: TableNames,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            workspace_root: PathBuf::from("."),
            user_agent: "Mozilla/5.0".to_string(),
            http_timeout_secs: 20,
            source_mode: SourceKind::Api,
            html_page_delay_ms: 1000,
            html_detail_delay_ms: 500,
            vacancies_limit: 100,
            detail_cooldown_every: 119,
            detail_cooldown_secs: 60,
            detail_failure_policy: DetailFailurePolicy::Abort,
            registry_workers: 4,
            registry_max_files: None,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            tables: TableNames::default(),
        }
    }
}

fn env_parsed<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}")),
        _ => Ok(None),
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            workspace_root: std::env::var("TKS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            user_agent: std::env::var("TKS_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parsed("TKS_HTTP_TIMEOUT_SECS")?
                .unwrap_or(defaults.http_timeout_secs),
            source_mode: env_parsed("TKS_SOURCE_MODE")?.unwrap_or(defaults.source_mode),
            html_page_delay_ms: env_parsed("TKS_HTML_PAGE_DELAY_MS")?
                .unwrap_or(defaults.html_page_delay_ms),
            html_detail_delay_ms: env_parsed("TKS_HTML_DETAIL_DELAY_MS")?
                .unwrap_or(defaults.html_detail_delay_ms),
            vacancies_limit: env_parsed("TKS_VACANCIES_LIMIT")?.unwrap_or(defaults.vacancies_limit),
            detail_cooldown_every: env_parsed("TKS_DETAIL_COOLDOWN_EVERY")?
                .unwrap_or(defaults.detail_cooldown_every),
            detail_cooldown_secs: env_parsed("TKS_DETAIL_COOLDOWN_SECS")?
                .unwrap_or(defaults.detail_cooldown_secs),
            detail_failure_policy: env_parsed("TKS_DETAIL_FAILURE_POLICY")?
                .unwrap_or(defaults.detail_failure_policy),
            registry_workers: env_parsed("TKS_REGISTRY_WORKERS")?
                .unwrap_or(defaults.registry_workers),
            registry_max_files: env_parsed("TKS_REGISTRY_MAX_FILES")?,
            scheduler_enabled: env_flag("TKS_SCHEDULER_ENABLED"),
            sync_cron: std::env::var("TKS_SYNC_CRON").unwrap_or(defaults.sync_cron),
            tables: defaults.tables,
        })
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn html_pacing(&self) -> CrawlPacing {
        CrawlPacing {
            page_delay: Duration::from_millis(self.html_page_delay_ms),
            detail_delay: Duration::from_millis(self.html_detail_delay_ms),
        }
    }

    pub fn detail_cooldown(&self) -> DetailCooldown {
        DetailCooldown::new(
            self.detail_cooldown_every,
            Duration::from_secs(self.detail_cooldown_secs),
        )
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is not set")
    }
}

/// Endpoints, schemas and registry inputs for one named environment. The
/// job logic is identical across environments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub vacancies_schema: String,
    pub companies_schema: String,
    /// Registry zip archive, relative to the workspace root unless absolute.
    pub registry_archive: PathBuf,
    #[serde(default)]
    pub registry_download_url: Option<String>,
    pub api_url: String,
    pub html_url: String,
    #[serde(default)]
    pub query: SearchQuery,
    pub okved_code: String,
}

impl EnvironmentConfig {
    pub fn registry_archive_path(&self, workspace_root: &Path) -> PathBuf {
        workspace_root.join(&self.registry_archive)
    }

    pub fn listing_url(&self, mode: SourceKind) -> &str {
        match mode {
            SourceKind::Api => &self.api_url,
            SourceKind::Html => &self.html_url,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentRegistry {
    pub environments: Vec<EnvironmentConfig>,
}

const HH_API_URL: &str = "https://api.hh.ru/vacancies";
const HH_HTML_URL: &str = "https://hh.ru/search/vacancy";
const TELECOM_OKVED: &str = "61";

impl EnvironmentRegistry {
    pub fn builtin() -> Self {
        let env = |name: &str, vacancies: &str, companies: &str, archive: &str, url: Option<&str>| {
            EnvironmentConfig {
                name: name.to_string(),
                vacancies_schema: vacancies.to_string(),
                companies_schema: companies.to_string(),
                registry_archive: PathBuf::from(archive),
                registry_download_url: url.map(str::to_string),
                api_url: HH_API_URL.to_string(),
                html_url: HH_HTML_URL.to_string(),
                query: SearchQuery::default(),
                okved_code: TELECOM_OKVED.to_string(),
            }
        };

        Self {
            environments: vec![
                env("test", "hw3_test", "hw1", "bulk_data/egrul_test.json.zip", None),
                env(
                    "preprod",
                    "hw3_preprod",
                    "hw3_preprod",
                    "bulk_data/egrul_full.json.zip",
                    None,
                ),
                env(
                    "prod",
                    "hw3_prod",
                    "hw3_prod",
                    "bulk_data/egrul_full_download.json.zip",
                    Some("https://ofdata.ru/open-data/download/egrul.json.zip"),
                ),
            ],
        }
    }

    /// Reads `environments.yaml` under `workspace_root`, falling back to the
    /// built-in registry when the file does not exist.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("environments.yaml");
        if !path.exists() {
            debug!(path = %path.display(), "no environments file, using built-in registry");
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        if registry.environments.is_empty() {
            return Err(anyhow!("no environments declared"));
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| anyhow!("unknown environment {name:?} (known: {})", self.names().join(", ")))
    }

    pub fn names(&self) -> Vec<&str> {
        self.environments.iter().map(|e| e.name.as_str()).collect()
    }
}
