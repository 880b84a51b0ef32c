//! Configuration management for gitpulse using the prefer crate.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::github::RetryConfig;
use crate::models::PipelineType;
use crate::pipeline::ranking::RankingWeights;
use crate::pipeline::repo_stats::HealthWeights;

/// Default GitHub REST endpoint.
pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";

/// Default ceiling on enrichment attempts per entity.
pub const DEFAULT_MAX_ENRICHMENT_ATTEMPTS: u32 = 3;

/// Seconds without a heartbeat after which a running pipeline counts as dead.
pub const DEFAULT_STALE_RUN_AFTER: u64 = 300;

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename.
    pub database_filename: String,
    /// GitHub REST API base URL.
    pub api_base_url: String,
    /// Bearer token for the GitHub API. Required by pipelines that fetch.
    pub github_token: Option<String>,
    /// User agent for HTTP requests.
    pub user_agent: String,
    /// Request timeout in seconds.
    pub request_timeout: u64,
    /// Maximum concurrent API calls within one pipeline run.
    pub request_concurrency: usize,
    /// Retry budget of the API client.
    pub retry: RetryConfig,
    /// Attempts after which an entity is left un-enriched for good.
    pub max_enrichment_attempts: u32,
    /// Raw records extracted per batch.
    pub extraction_batch_size: usize,
    /// Maximum pages fetched per list endpoint during sync.
    pub max_pages: u32,
    /// Weight table of the contributor ranking.
    pub ranking_weights: RankingWeights,
    /// Weight table of the repository health score.
    pub health_weights: HealthWeights,
    /// Share of commits the core contributor set must cover.
    pub core_contributor_threshold: f64,
    /// Repositories (`owner/name`) synced on every github_sync run.
    pub tracked_repositories: Vec<String>,
    /// Cron expression per pipeline type.
    pub schedules: HashMap<PipelineType, String>,
    /// Heartbeat age in seconds after which startup recovery reclaims a run.
    pub stale_run_after: u64,
}

impl Default for Settings {
    fn default() -> Self {
        // Default to ~/.local/share/gitpulse/ for user data
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
            .join("gitpulse");

        Self {
            data_dir,
            database_filename: "gitpulse.db".to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            github_token: None,
            user_agent: "gitpulse/0.4 (repository analytics)".to_string(),
            request_timeout: 30,
            request_concurrency: 4,
            retry: RetryConfig::default(),
            max_enrichment_attempts: DEFAULT_MAX_ENRICHMENT_ATTEMPTS,
            extraction_batch_size: 200,
            max_pages: 10,
            ranking_weights: RankingWeights::default(),
            health_weights: HealthWeights::default(),
            core_contributor_threshold: 0.5,
            tracked_repositories: Vec::new(),
            schedules: default_schedules(),
            stale_run_after: DEFAULT_STALE_RUN_AFTER,
        }
    }
}

/// Default cron expressions (seconds field first).
pub fn default_schedules() -> HashMap<PipelineType, String> {
    HashMap::from([
        (PipelineType::GithubSync, "0 0 */6 * * *".to_string()),
        (PipelineType::DataEnrichment, "0 30 * * * *".to_string()),
        (PipelineType::RepositoryProcessing, "0 0 3 * * *".to_string()),
        (PipelineType::ContributorRanking, "0 0 4 * * *".to_string()),
    ])
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Get the full path to the database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn stale_run_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_run_after.min(i32::MAX as u64) as i64)
    }

    /// How often a running pipeline refreshes its heartbeat.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs((self.stale_run_after / 4).max(1))
    }

    /// Ensure all directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir)
    }

    /// Apply environment overrides (`GITHUB_TOKEN`, `GITPULSE_DATA_DIR`).
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if !token.trim().is_empty() {
                self.github_token = Some(token.trim().to_string());
            }
        }
        if let Ok(dir) = std::env::var("GITPULSE_DATA_DIR") {
            let path = shellexpand::tilde(&dir);
            self.data_dir = PathBuf::from(path.as_ref());
        }
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Target directory for data.
    #[serde(default)]
    pub target: Option<String>,
    /// Database filename.
    #[serde(default)]
    pub database: Option<String>,
    /// GitHub API base URL (for GitHub Enterprise).
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// GitHub token. Prefer the GITHUB_TOKEN environment variable.
    #[serde(default)]
    pub github_token: Option<String>,
    /// User agent string.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    #[serde(default)]
    pub request_timeout: Option<u64>,
    /// Maximum concurrent API calls within a run.
    #[serde(default)]
    pub request_concurrency: Option<usize>,
    /// Retry budget overrides.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Enrichment attempt ceiling.
    #[serde(default)]
    pub max_enrichment_attempts: Option<u32>,
    /// Maximum pages per list endpoint.
    #[serde(default)]
    pub max_pages: Option<u32>,
    /// Ranking weight table.
    #[serde(default)]
    pub ranking_weights: Option<RankingWeights>,
    /// Health score weight table.
    #[serde(default)]
    pub health_weights: Option<HealthWeights>,
    /// Core contributor coverage threshold (0.0 - 1.0).
    #[serde(default)]
    pub core_contributor_threshold: Option<f64>,
    /// Repositories to sync.
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Cron expressions keyed by pipeline type name.
    #[serde(default)]
    pub schedules: HashMap<String, String>,
    /// Heartbeat age (seconds) after which a run counts as interrupted.
    #[serde(default)]
    pub stale_run_after: Option<u64>,
}

impl Config {
    /// Load configuration using prefer crate.
    /// Automatically discovers gitpulse config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("gitpulse").await {
            Ok(pref_config) => {
                // Extract values from prefer config using dot notation
                let target: Option<String> = pref_config.get("target").ok();
                let database: Option<String> = pref_config.get("database").ok();
                let api_base_url: Option<String> = pref_config.get("api_base_url").ok();
                let github_token: Option<String> = pref_config.get("github_token").ok();
                let user_agent: Option<String> = pref_config.get("user_agent").ok();
                let request_timeout: Option<u64> = pref_config.get("request_timeout").ok();
                let request_concurrency: Option<usize> =
                    pref_config.get("request_concurrency").ok();
                let retry: Option<RetryConfig> = pref_config.get("retry").ok();
                let max_enrichment_attempts: Option<u32> =
                    pref_config.get("max_enrichment_attempts").ok();
                let max_pages: Option<u32> = pref_config.get("max_pages").ok();
                let ranking_weights: Option<RankingWeights> =
                    pref_config.get("ranking_weights").ok();
                let health_weights: Option<HealthWeights> =
                    pref_config.get("health_weights").ok();
                let core_contributor_threshold: Option<f64> =
                    pref_config.get("core_contributor_threshold").ok();
                let repositories: Vec<String> =
                    pref_config.get("repositories").unwrap_or_default();
                let schedules: HashMap<String, String> =
                    pref_config.get("schedules").unwrap_or_default();
                let stale_run_after: Option<u64> =
                    pref_config.get("stale_run_after").ok();

                Config {
                    target,
                    database,
                    api_base_url,
                    github_token,
                    user_agent,
                    request_timeout,
                    request_concurrency,
                    retry,
                    max_enrichment_attempts,
                    max_pages,
                    ranking_weights,
                    health_weights,
                    core_contributor_threshold,
                    repositories,
                    schedules,
                    stale_run_after,
                }
            }
            Err(_) => {
                // No config file found, use defaults
                Self::default()
            }
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings) {
        if let Some(ref target) = self.target {
            let path = shellexpand::tilde(target);
            settings.data_dir = PathBuf::from(path.as_ref());
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }
        if let Some(ref url) = self.api_base_url {
            settings.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ref token) = self.github_token {
            settings.github_token = Some(token.clone());
        }
        if let Some(ref user_agent) = self.user_agent {
            settings.user_agent = user_agent.clone();
        }
        if let Some(timeout) = self.request_timeout {
            settings.request_timeout = timeout;
        }
        if let Some(concurrency) = self.request_concurrency {
            settings.request_concurrency = concurrency.max(1);
        }
        if let Some(ref retry) = self.retry {
            settings.retry = retry.clone();
        }
        if let Some(attempts) = self.max_enrichment_attempts {
            settings.max_enrichment_attempts = attempts;
        }
        if let Some(pages) = self.max_pages {
            settings.max_pages = pages.max(1);
        }
        if let Some(ref weights) = self.ranking_weights {
            settings.ranking_weights = weights.clone();
        }
        if let Some(ref weights) = self.health_weights {
            settings.health_weights = weights.clone();
        }
        if let Some(threshold) = self.core_contributor_threshold {
            settings.core_contributor_threshold = threshold.clamp(0.0, 1.0);
        }
        if let Some(secs) = self.stale_run_after {
            settings.stale_run_after = secs;
        }
        for repo in &self.repositories {
            let repo = repo.trim().to_string();
            if !repo.is_empty() && !settings.tracked_repositories.contains(&repo) {
                settings.tracked_repositories.push(repo);
            }
        }
        for (name, cron) in &self.schedules {
            match PipelineType::from_str(name) {
                Some(pipeline_type) => {
                    settings.schedules.insert(pipeline_type, cron.clone());
                }
                None => tracing::warn!("Ignoring schedule for unknown pipeline type '{}'", name),
            }
        }
    }
}

/// Load settings from configuration and environment.
pub async fn load_settings() -> Settings {
    let config = Config::load().await;
    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings);
    settings.apply_env();
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_to_settings_overrides() {
        let config = Config {
            database: Some("custom.db".to_string()),
            api_base_url: Some("https://github.example.com/api/v3/".to_string()),
            request_concurrency: Some(0),
            max_enrichment_attempts: Some(5),
            core_contributor_threshold: Some(1.7),
            repositories: vec!["rust-lang/rust".to_string(), "rust-lang/rust".to_string()],
            schedules: HashMap::from([
                ("data_enrichment".to_string(), "0 */5 * * * *".to_string()),
                ("nonsense".to_string(), "* * * * * *".to_string()),
            ]),
            ..Default::default()
        };
        let mut settings = Settings::with_data_dir(PathBuf::from("/tmp/gitpulse-test"));
        config.apply_to_settings(&mut settings);

        assert_eq!(settings.database_path(), PathBuf::from("/tmp/gitpulse-test/custom.db"));
        assert_eq!(settings.api_base_url, "https://github.example.com/api/v3");
        assert_eq!(settings.request_concurrency, 1);
        assert_eq!(settings.max_enrichment_attempts, 5);
        assert_eq!(settings.core_contributor_threshold, 1.0);
        assert_eq!(settings.tracked_repositories, vec!["rust-lang/rust".to_string()]);
        assert_eq!(
            settings.schedules.get(&PipelineType::DataEnrichment).map(String::as_str),
            Some("0 */5 * * * *")
        );
        assert_eq!(settings.schedules.len(), 4);
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_enrichment_attempts, 3);
        assert_eq!(settings.retry.primary_rate_limit_retries, 2);
        assert_eq!(settings.retry.secondary_rate_limit_retries, 1);
        assert_eq!(settings.core_contributor_threshold, 0.5);
        assert_eq!(settings.stale_run_after().num_seconds(), 300);
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(75));
    }
}
