//! Raw intake records: fetched API payloads pending extraction.

use chrono::{DateTime, Utc};

/// What kind of payload a raw record holds.
///
/// Page variants hold a JSON array from a list endpoint and extract into many
/// entities. `MergeRequestReviews` and `Organizations` are only fetched during
/// enrichment and never produce entities on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawEntityKind {
    Repository,
    Contributor,
    ContributorPage,
    MergeRequest,
    MergeRequestPage,
    MergeRequestReviews,
    Commit,
    CommitPage,
    Organizations,
}

impl RawEntityKind {
    pub const ALL: [RawEntityKind; 9] = [
        RawEntityKind::Repository,
        RawEntityKind::Contributor,
        RawEntityKind::ContributorPage,
        RawEntityKind::MergeRequest,
        RawEntityKind::MergeRequestPage,
        RawEntityKind::MergeRequestReviews,
        RawEntityKind::Commit,
        RawEntityKind::CommitPage,
        RawEntityKind::Organizations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RawEntityKind::Repository => "repository",
            RawEntityKind::Contributor => "contributor",
            RawEntityKind::ContributorPage => "contributor_page",
            RawEntityKind::MergeRequest => "merge_request",
            RawEntityKind::MergeRequestPage => "merge_request_page",
            RawEntityKind::MergeRequestReviews => "merge_request_reviews",
            RawEntityKind::Commit => "commit",
            RawEntityKind::CommitPage => "commit_page",
            RawEntityKind::Organizations => "organizations",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

/// A fetched payload. Immutable once written except for `is_processed`.
///
/// `external_id` is the intake key of the fetch (full name for repositories,
/// login for users, `owner/name#42` for merge requests, `owner/name@sha` for
/// commits, `owner/name:commits:3` for list pages).
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub id: i32,
    pub kind: RawEntityKind,
    pub external_id: String,
    pub payload: String,
    pub fetched_at: DateTime<Utc>,
    pub api_endpoint: String,
    pub etag: Option<String>,
    pub is_processed: bool,
}

impl RawRecord {
    /// Repository full name encoded in the intake key, when the kind carries one.
    pub fn repository_full_name(&self) -> Option<&str> {
        let key = self.external_id.as_str();
        match self.kind {
            RawEntityKind::Repository => Some(key),
            RawEntityKind::MergeRequest | RawEntityKind::MergeRequestReviews => {
                key.split_once('#').map(|(repo, _)| repo)
            }
            RawEntityKind::Commit => key.split_once('@').map(|(repo, _)| repo),
            RawEntityKind::MergeRequestPage
            | RawEntityKind::CommitPage
            | RawEntityKind::ContributorPage => key.split_once(':').map(|(repo, _)| repo),
            RawEntityKind::Contributor | RawEntityKind::Organizations => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: RawEntityKind, key: &str) -> RawRecord {
        RawRecord {
            id: 1,
            kind,
            external_id: key.to_string(),
            payload: "{}".to_string(),
            fetched_at: Utc::now(),
            api_endpoint: "/".to_string(),
            etag: None,
            is_processed: false,
        }
    }

    #[test]
    fn test_kind_roundtrip_names() {
        for kind in RawEntityKind::ALL {
            assert_eq!(RawEntityKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(RawEntityKind::from_str("issue"), None);
    }

    #[test]
    fn test_repository_full_name_from_key() {
        assert_eq!(
            record(RawEntityKind::Commit, "rust-lang/rust@abc123").repository_full_name(),
            Some("rust-lang/rust")
        );
        assert_eq!(
            record(RawEntityKind::MergeRequest, "tokio-rs/tokio#42").repository_full_name(),
            Some("tokio-rs/tokio")
        );
        assert_eq!(
            record(RawEntityKind::CommitPage, "tokio-rs/tokio:commits:2").repository_full_name(),
            Some("tokio-rs/tokio")
        );
        assert_eq!(
            record(RawEntityKind::Contributor, "octocat").repository_full_name(),
            None
        );
    }
}
