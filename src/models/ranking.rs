use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw, un-normalized inputs to the ranking of one contributor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetrics {
    pub lines_added: i64,
    pub lines_removed: i64,
    pub commit_count: i64,
    pub repositories_contributed: i64,
    pub followers: i64,
    pub profile_completeness: i64,
    pub pull_requests_merged: i64,
    pub pull_requests_opened: i64,
    pub code_reviews: i64,
    /// Sum of stars of every repository contributed to.
    pub repository_stars: i64,
}

/// Percentile sub-scores (0-100) per ranking dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub code_volume: f64,
    pub efficiency: f64,
    pub commit_impact: f64,
    pub repo_influence: f64,
    pub followers: f64,
    pub profile_completeness: f64,
    pub collaboration: f64,
    pub repo_popularity: f64,
}

/// One row of an immutable ranking snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributorRanking {
    pub id: String,
    pub contributor_id: String,
    pub rank_position: i32,
    pub total_score: f64,
    pub component_scores: ComponentScores,
    pub raw_metrics: RawMetrics,
    pub calculation_timestamp: DateTime<Utc>,
}

/// Movement between the two most recent snapshots of a contributor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingTrend {
    pub contributor_id: String,
    pub current_rank: i32,
    pub previous_rank: Option<i32>,
    /// Positive when the contributor moved up.
    pub rank_delta: Option<i32>,
    pub score_delta: Option<f64>,
}

impl RankingTrend {
    pub fn between(current: &ContributorRanking, previous: Option<&ContributorRanking>) -> Self {
        Self {
            contributor_id: current.contributor_id.clone(),
            current_rank: current.rank_position,
            previous_rank: previous.map(|p| p.rank_position),
            rank_delta: previous.map(|p| p.rank_position - current.rank_position),
            score_delta: previous.map(|p| current.total_score - p.total_score),
        }
    }
}
