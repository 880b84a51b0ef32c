use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A GitHub repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    /// GitHub numeric repository id.
    pub external_id: String,
    pub name: String,
    /// `owner/name`, globally unique.
    pub full_name: String,
    pub description: Option<String>,
    pub url: String,
    pub stars: i32,
    pub forks: i32,
    pub size_kb: i32,
    pub watchers: i32,
    pub primary_language: Option<String>,
    pub license: Option<String>,
    pub is_fork: bool,
    pub is_archived: bool,
    pub owner_id: Option<String>,
    pub is_enriched: bool,
    pub enrichment_attempts: i32,
    pub enrichment_error: Option<String>,
    pub health_percentage: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub fn owner_login(&self) -> &str {
        self.full_name
            .split_once('/')
            .map(|(owner, _)| owner)
            .unwrap_or(&self.full_name)
    }
}

/// A point-in-time observation of a repository's popularity counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    pub repository_id: String,
    pub stars: i32,
    pub forks: i32,
    pub watchers: i32,
    pub recorded_at: DateTime<Utc>,
}
