use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A person (or bot) who contributed to a tracked repository.
///
/// Placeholder contributors are commit authors known only by a name string;
/// they carry no username and are reconciled to a real account once one with
/// a matching login or display name shows up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contributor {
    pub id: String,
    pub external_id: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub followers: i32,
    pub repositories: i32,
    pub impact_score: f64,
    pub role_classification: Option<ContributorRole>,
    pub top_languages: Vec<String>,
    pub organizations: Vec<String>,
    pub first_contribution: Option<DateTime<Utc>>,
    pub last_contribution: Option<DateTime<Utc>>,
    pub direct_commits: i32,
    pub pull_requests_merged: i32,
    pub pull_requests_rejected: i32,
    pub code_reviews: i32,
    pub is_placeholder: bool,
    pub is_bot: bool,
    pub is_enriched: bool,
    pub enrichment_attempts: i32,
    pub enrichment_error: Option<String>,
}

impl Contributor {
    /// Number of profile fields that are filled in (0..=5).
    pub fn profile_completeness(&self) -> u32 {
        [
            &self.name,
            &self.bio,
            &self.company,
            &self.location,
            &self.avatar,
        ]
        .iter()
        .filter(|field| field.as_deref().is_some_and(|v| !v.trim().is_empty()))
        .count() as u32
    }
}

/// Coarse role derived from a contributor's activity during ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributorRole {
    Bot,
    Maintainer,
    Reviewer,
    Core,
    Contributor,
    Occasional,
}

impl ContributorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributorRole::Bot => "bot",
            ContributorRole::Maintainer => "maintainer",
            ContributorRole::Reviewer => "reviewer",
            ContributorRole::Core => "core",
            ContributorRole::Contributor => "contributor",
            ContributorRole::Occasional => "occasional",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bot" => Some(ContributorRole::Bot),
            "maintainer" => Some(ContributorRole::Maintainer),
            "reviewer" => Some(ContributorRole::Reviewer),
            "core" => Some(ContributorRole::Core),
            "contributor" => Some(ContributorRole::Contributor),
            "occasional" => Some(ContributorRole::Occasional),
            _ => None,
        }
    }
}

/// Per (contributor, repository) activity totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContributorRepositoryLink {
    pub contributor_id: String,
    pub repository_id: String,
    pub commit_count: i32,
    pub pull_requests: i32,
    pub reviews: i32,
    pub issues_opened: i32,
    pub lines_added: i32,
    pub lines_removed: i32,
    pub first_contribution_date: Option<DateTime<Utc>>,
    pub last_contribution_date: Option<DateTime<Utc>>,
}
