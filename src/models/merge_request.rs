use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestState {
    Open,
    Closed,
    Merged,
}

impl MergeRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeRequestState::Open => "open",
            MergeRequestState::Closed => "closed",
            MergeRequestState::Merged => "merged",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(MergeRequestState::Open),
            "closed" => Some(MergeRequestState::Closed),
            "merged" => Some(MergeRequestState::Merged),
            _ => None,
        }
    }

    /// GitHub reports merged pull requests as `closed` with a `merged_at`.
    pub fn from_api(state: &str, merged_at: Option<&DateTime<Utc>>) -> Self {
        match (state, merged_at) {
            (_, Some(_)) => MergeRequestState::Merged,
            ("open", None) => MergeRequestState::Open,
            (_, None) => MergeRequestState::Closed,
        }
    }
}

/// A pull request. `(repository_id, external_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: String,
    /// Pull request number within the repository.
    pub external_id: i32,
    pub repository_id: String,
    pub author_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub state: MergeRequestState,
    pub is_draft: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub merged_by_id: Option<String>,
    pub commits_count: i32,
    pub additions: i32,
    pub deletions: i32,
    pub changed_files: i32,
    pub comments: i32,
    pub review_comments: i32,
    pub labels: Vec<String>,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub is_enriched: bool,
    pub enrichment_attempts: i32,
    pub enrichment_error: Option<String>,
}

/// A submitted review on a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequestReview {
    pub external_id: String,
    pub merge_request_id: String,
    pub reviewer_id: Option<String>,
    pub state: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_api() {
        let now = Utc::now();
        assert_eq!(MergeRequestState::from_api("open", None), MergeRequestState::Open);
        assert_eq!(MergeRequestState::from_api("closed", None), MergeRequestState::Closed);
        assert_eq!(
            MergeRequestState::from_api("closed", Some(&now)),
            MergeRequestState::Merged
        );
    }
}
