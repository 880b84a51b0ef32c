//! Serde views of the GitHub REST payloads the pipeline reads.
//!
//! Only the fields the pipeline uses are declared; everything is lenient so a
//! trimmed or partial payload still decodes.

use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GhUser {
    pub id: i64,
    pub login: String,
    #[serde(rename = "type", default)]
    pub account_type: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub followers: Option<i32>,
    #[serde(default)]
    pub public_repos: Option<i32>,
}

impl GhUser {
    /// Bot accounts: `type: "Bot"` or the `[bot]` login suffix of apps.
    pub fn is_bot(&self) -> bool {
        self.account_type.as_deref() == Some("Bot") || self.login.ends_with("[bot]")
    }

    pub fn is_organization(&self) -> bool {
        self.account_type.as_deref() == Some("Organization")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhLicense {
    #[serde(default)]
    pub spdx_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl GhLicense {
    /// SPDX id when GitHub recognized the license, otherwise its name.
    pub fn label(&self) -> Option<String> {
        self.spdx_id
            .clone()
            .filter(|id| !id.is_empty() && id != "NOASSERTION")
            .or_else(|| self.name.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhRepository {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub html_url: String,
    #[serde(default)]
    pub stargazers_count: i32,
    #[serde(default)]
    pub forks_count: i32,
    #[serde(default)]
    pub size: i32,
    /// Watchers proper; `watchers_count` is a legacy alias of stars.
    #[serde(default)]
    pub subscribers_count: Option<i32>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub license: Option<GhLicense>,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub archived: bool,
    pub owner: GhUser,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhLabel {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhBranchRef {
    #[serde(rename = "ref")]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhPullRequest {
    pub number: i32,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub user: Option<GhUser>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_by: Option<GhUser>,
    #[serde(default)]
    pub merge_commit_sha: Option<String>,
    #[serde(default)]
    pub labels: Vec<GhLabel>,
    #[serde(default)]
    pub head: Option<GhBranchRef>,
    #[serde(default)]
    pub base: Option<GhBranchRef>,
    // Detail fields, present only on the single pull request endpoint.
    #[serde(default)]
    pub commits: Option<i32>,
    #[serde(default)]
    pub additions: Option<i32>,
    #[serde(default)]
    pub deletions: Option<i32>,
    #[serde(default)]
    pub changed_files: Option<i32>,
    #[serde(default)]
    pub comments: Option<i32>,
    #[serde(default)]
    pub review_comments: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhReview {
    pub id: i64,
    #[serde(default)]
    pub user: Option<GhUser>,
    pub state: String,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhGitSignature {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhCommitDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: Option<GhGitSignature>,
    #[serde(default)]
    pub committer: Option<GhGitSignature>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhParent {
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhCommitFile {
    pub filename: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub additions: i32,
    #[serde(default)]
    pub deletions: i32,
    #[serde(default)]
    pub patch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhCommit {
    pub sha: String,
    pub commit: GhCommitDetail,
    /// The linked GitHub account, absent when the author email is unknown.
    #[serde(default)]
    pub author: Option<GhUser>,
    #[serde(default)]
    pub parents: Vec<GhParent>,
    #[serde(default)]
    pub files: Option<Vec<GhCommitFile>>,
}

impl GhCommit {
    /// Authored date, falling back to the committer date.
    pub fn committed_at(&self) -> Option<DateTime<Utc>> {
        self.commit
            .author
            .as_ref()
            .and_then(|a| a.date)
            .or_else(|| self.commit.committer.as_ref().and_then(|c| c.date))
    }

    /// Git author name, used when the commit has no linked account.
    pub fn author_name(&self) -> Option<&str> {
        self.commit
            .author
            .as_ref()
            .and_then(|a| a.name.as_deref())
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhOrganization {
    pub login: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_detection() {
        let user: GhUser =
            serde_json::from_str(r#"{"id": 1, "login": "dependabot[bot]", "type": "Bot"}"#).unwrap();
        assert!(user.is_bot());
        let user: GhUser =
            serde_json::from_str(r#"{"id": 2, "login": "renovate[bot]"}"#).unwrap();
        assert!(user.is_bot());
        let user: GhUser =
            serde_json::from_str(r#"{"id": 3, "login": "octocat", "type": "User"}"#).unwrap();
        assert!(!user.is_bot());
    }

    #[test]
    fn test_commit_fallbacks() {
        let commit: GhCommit = serde_json::from_str(
            r#"{
                "sha": "abc",
                "commit": {
                    "message": "Fix",
                    "author": {"name": "  Jane Doe ", "email": "jane@example.com"},
                    "committer": {"name": "GitHub", "date": "2024-03-01T10:00:00Z"}
                },
                "author": null,
                "parents": [{"sha": "p1"}, {"sha": "p2"}]
            }"#,
        )
        .unwrap();
        assert_eq!(commit.author_name(), Some("Jane Doe"));
        assert_eq!(
            commit.committed_at().map(|d| d.to_rfc3339()),
            Some("2024-03-01T10:00:00+00:00".to_string())
        );
        assert!(commit.is_merge());
        assert!(commit.files.is_none());
    }

    #[test]
    fn test_license_label() {
        let license: GhLicense =
            serde_json::from_str(r#"{"spdx_id": "NOASSERTION", "name": "Other"}"#).unwrap();
        assert_eq!(license.label().as_deref(), Some("Other"));
        let license: GhLicense =
            serde_json::from_str(r#"{"spdx_id": "MIT", "name": "MIT License"}"#).unwrap();
        assert_eq!(license.label().as_deref(), Some("MIT"));
    }
}
